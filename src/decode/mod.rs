//! Decode capability and the decode loop.
//!
//! The engine does not demux or decode itself. It drives a `MediaBackend`,
//! which opens a `StreamSource` into a `MediaInput` that yields one decoded
//! RGB24 `Picture` per compressed unit (or nothing, if the unit did not
//! complete a picture). Backends:
//! - `synthetic`: `stub://` test pattern (always available)
//! - `scripted`: deterministic frames/failures/stalls for tests
//! - `ffmpeg`: real RTSP/file/device decode (feature: decode-ffmpeg)
//!
//! `DecodeLoop::run` owns the input for the lifetime of one connection attempt
//! and reports to a `DecodeSink`. Every failure is classified into a
//! `StreamError` here; nothing backend-specific escapes.

#[cfg(feature = "decode-ffmpeg")]
pub mod ffmpeg;
pub mod scripted;
pub mod synthetic;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::error::{ErrorKind, StreamError};
use crate::frame::{Frame, StreamMetadata};
use crate::source::{SourceKind, StreamSource};

/// Granularity of stop checks while the loop is pacing or waiting.
pub(crate) const STOP_POLL_SLICE: Duration = Duration::from_millis(10);

/// Options applied when opening a source.
#[derive(Clone, Debug)]
pub struct OpenOptions {
    /// One-time deadline for opening the source and decoding the first frame.
    pub connect_timeout: Duration,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// A decoded picture in packed RGB24, before it is stamped into a `Frame`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Picture {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// What an opened input knows before decoding.
#[derive(Clone, Debug, PartialEq)]
pub struct InputInfo {
    pub codec: String,
    /// Nominal frame rate; 0.0 when the container does not say.
    pub frame_rate: f64,
}

/// An opened source. Owned exclusively by the decode thread.
pub trait MediaInput: Send {
    fn info(&self) -> InputInfo;

    /// Read and decode the next compressed unit.
    ///
    /// `Ok(None)` means the unit produced no picture (other stream, decoder
    /// warming up, nothing ready yet). End of stream is
    /// `Err(ErrorKind::Disconnected)`.
    fn read(&mut self) -> Result<Option<Picture>, StreamError>;
}

/// Capability to open sources.
pub trait MediaBackend: Send + Sync {
    fn open(
        &self,
        source: &StreamSource,
        options: &OpenOptions,
    ) -> Result<Box<dyn MediaInput>, StreamError>;
}

/// Backend routing `stub://` addresses to the synthetic source and everything
/// else to FFmpeg when the decode-ffmpeg feature is enabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct AutoBackend;

impl MediaBackend for AutoBackend {
    fn open(
        &self,
        source: &StreamSource,
        options: &OpenOptions,
    ) -> Result<Box<dyn MediaInput>, StreamError> {
        if source.is_synthetic() {
            return synthetic::SyntheticBackend.open(source, options);
        }
        #[cfg(feature = "decode-ffmpeg")]
        {
            ffmpeg::FfmpegBackend.open(source, options)
        }
        #[cfg(not(feature = "decode-ffmpeg"))]
        {
            Err(StreamError::connection(format!(
                "{} sources require the decode-ffmpeg feature",
                source.kind()
            )))
        }
    }
}

/// Receiver of decode loop output.
pub trait DecodeSink {
    /// Called exactly once, right before the first frame of the attempt.
    fn on_metadata(&mut self, metadata: StreamMetadata);
    fn on_frame(&mut self, frame: Frame);
    /// Called at most once; the loop returns right after.
    fn on_error(&mut self, error: StreamError);
}

/// How a decode attempt ended.
#[derive(Clone, Debug, PartialEq)]
pub enum AttemptOutcome {
    /// `should_stop` was observed.
    Stopped,
    /// A failure was reported through `on_error`.
    Failed(ErrorKind),
}

/// One connection attempt's decode loop.
pub struct DecodeLoop {
    backend: Arc<dyn MediaBackend>,
    options: OpenOptions,
    supported_codecs: Vec<String>,
    sequence: Arc<AtomicU64>,
}

impl DecodeLoop {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        options: OpenOptions,
        supported_codecs: Vec<String>,
        sequence: Arc<AtomicU64>,
    ) -> Self {
        Self {
            backend,
            options,
            supported_codecs,
            sequence,
        }
    }

    /// Open `source` and decode until stopped or failed.
    pub fn run(
        &self,
        source: &StreamSource,
        sink: &mut dyn DecodeSink,
        should_stop: &AtomicBool,
    ) -> AttemptOutcome {
        match self.decode(source, sink, should_stop) {
            Ok(()) => AttemptOutcome::Stopped,
            Err(err) => {
                let kind = err.kind;
                sink.on_error(err);
                AttemptOutcome::Failed(kind)
            }
        }
    }

    fn decode(
        &self,
        source: &StreamSource,
        sink: &mut dyn DecodeSink,
        should_stop: &AtomicBool,
    ) -> Result<(), StreamError> {
        let started = Instant::now();
        source.validate()?;
        if should_stop.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut input = self
            .backend
            .open(source, &self.options)
            .map_err(|err| self.classify_before_first_frame(err))?;
        let info = input.info();
        log::debug!(
            "decode: opened {} codec={} fps={:.2}",
            source,
            info.codec,
            info.frame_rate
        );

        if source.kind().is_network()
            && !source.is_synthetic()
            && !self.is_supported_codec(&info.codec)
        {
            return Err(StreamError::codec(format!(
                "unsupported codec: {}",
                info.codec
            )));
        }

        // Local files are paced to their nominal rate; live sources run as fast as they arrive.
        let pacing = (source.kind() == SourceKind::File
            && !source.is_synthetic()
            && info.frame_rate > 0.0)
            .then(|| Duration::from_secs_f64(1.0 / info.frame_rate));

        let mut connected = false;
        loop {
            if should_stop.load(Ordering::Acquire) {
                return Ok(());
            }
            if !connected && started.elapsed() >= self.options.connect_timeout {
                return Err(StreamError::connection(format!(
                    "no frame received within {:.1}s",
                    self.options.connect_timeout.as_secs_f64()
                )));
            }

            let unit_started = Instant::now();
            let picture = match input.read() {
                Ok(Some(picture)) => picture,
                Ok(None) => continue,
                Err(err) if !connected => return Err(self.classify_before_first_frame(err)),
                Err(err) => return Err(err),
            };

            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
            let frame = Frame::new(
                picture.width,
                picture.height,
                picture.pixels,
                sequence,
                SystemTime::now(),
            )?;

            if !connected {
                connected = true;
                sink.on_metadata(StreamMetadata {
                    width: frame.width(),
                    height: frame.height(),
                    codec: info.codec.clone(),
                    frame_rate: info.frame_rate,
                });
            }
            sink.on_frame(frame);

            if let Some(interval) = pacing {
                let spent = unit_started.elapsed();
                if spent < interval && sleep_unless_stopped(interval - spent, should_stop) {
                    return Ok(());
                }
            }
        }
    }

    /// Before the first frame, transport trouble means the connection never came up.
    fn classify_before_first_frame(&self, err: StreamError) -> StreamError {
        match err.kind {
            ErrorKind::Network => StreamError::connection(err.message),
            _ => err,
        }
    }

    fn is_supported_codec(&self, codec: &str) -> bool {
        self.supported_codecs
            .iter()
            .any(|supported| supported.eq_ignore_ascii_case(codec))
    }
}

/// Sleep up to `duration`, waking early on stop. Returns true if stopped.
pub(crate) fn sleep_unless_stopped(duration: Duration, should_stop: &AtomicBool) -> bool {
    let until = Instant::now() + duration;
    loop {
        if should_stop.load(Ordering::Acquire) {
            return true;
        }
        let now = Instant::now();
        if now >= until {
            return false;
        }
        std::thread::sleep((until - now).min(STOP_POLL_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::{ScriptedAttempt, ScriptedBackend, Step};
    use super::*;

    #[derive(Default)]
    struct Collect {
        metadata: Vec<StreamMetadata>,
        frames: Vec<u64>,
        errors: Vec<StreamError>,
    }

    impl DecodeSink for Collect {
        fn on_metadata(&mut self, metadata: StreamMetadata) {
            self.metadata.push(metadata);
        }
        fn on_frame(&mut self, frame: Frame) {
            self.frames.push(frame.sequence());
        }
        fn on_error(&mut self, error: StreamError) {
            self.errors.push(error);
        }
    }

    fn decode_loop(backend: ScriptedBackend, connect_timeout: Duration) -> DecodeLoop {
        DecodeLoop::new(
            Arc::new(backend),
            OpenOptions { connect_timeout },
            vec!["h264".to_string(), "hevc".to_string()],
            Arc::new(AtomicU64::new(0)),
        )
    }

    fn rtsp() -> StreamSource {
        StreamSource::rtsp("rtsp://camera.local/stream")
    }

    #[test]
    fn metadata_precedes_frames_and_is_reported_once() {
        let backend = ScriptedBackend::new(vec![ScriptedAttempt::steps(vec![
            Step::Frames(3),
            Step::Fail(StreamError::disconnected("end of stream")),
        ])]);
        let mut sink = Collect::default();
        let outcome = decode_loop(backend, Duration::from_secs(1)).run(
            &rtsp(),
            &mut sink,
            &AtomicBool::new(false),
        );

        assert_eq!(outcome, AttemptOutcome::Failed(ErrorKind::Disconnected));
        assert_eq!(sink.metadata.len(), 1);
        assert_eq!(sink.metadata[0].codec, "h264");
        assert_eq!(sink.frames, vec![1, 2, 3]);
        assert_eq!(sink.errors.len(), 1);
    }

    #[test]
    fn open_failure_is_reported_as_connection_error() {
        let backend = ScriptedBackend::new(vec![ScriptedAttempt::OpenFail(
            StreamError::network("connection refused"),
        )]);
        let mut sink = Collect::default();
        let outcome = decode_loop(backend, Duration::from_secs(1)).run(
            &rtsp(),
            &mut sink,
            &AtomicBool::new(false),
        );
        assert_eq!(outcome, AttemptOutcome::Failed(ErrorKind::Connection));
        assert!(sink.metadata.is_empty());
    }

    #[test]
    fn no_first_frame_within_timeout_is_connection_error() {
        let backend = ScriptedBackend::new(vec![ScriptedAttempt::steps(vec![Step::Hold])]);
        let mut sink = Collect::default();
        let started = Instant::now();
        let outcome = decode_loop(backend, Duration::from_millis(80)).run(
            &rtsp(),
            &mut sink,
            &AtomicBool::new(false),
        );
        assert_eq!(outcome, AttemptOutcome::Failed(ErrorKind::Connection));
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert!(sink.errors[0].message.contains("no frame"));
    }

    #[test]
    fn unsupported_network_codec_is_rejected() {
        let backend = ScriptedBackend::new(vec![ScriptedAttempt::Run {
            codec: "mjpeg".to_string(),
            frame_rate: 30.0,
            steps: vec![Step::Frames(1)],
        }]);
        let mut sink = Collect::default();
        let outcome = decode_loop(backend, Duration::from_secs(1)).run(
            &rtsp(),
            &mut sink,
            &AtomicBool::new(false),
        );
        assert_eq!(outcome, AttemptOutcome::Failed(ErrorKind::Codec));
        assert!(sink.frames.is_empty());
    }

    #[test]
    fn invalid_source_fails_validation_without_opening() {
        let backend = ScriptedBackend::new(Vec::new());
        let opens = backend.open_counter();
        let mut sink = Collect::default();
        let outcome = decode_loop(backend, Duration::from_secs(1)).run(
            &StreamSource::rtsp(""),
            &mut sink,
            &AtomicBool::new(false),
        );
        assert_eq!(outcome, AttemptOutcome::Failed(ErrorKind::Validation));
        assert_eq!(opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stop_flag_ends_loop_without_error() {
        let backend = ScriptedBackend::new(vec![ScriptedAttempt::steps(vec![Step::Stream(
            Duration::from_millis(5),
        )])]);
        let decode = decode_loop(backend, Duration::from_secs(1));
        let stop = Arc::new(AtomicBool::new(false));
        let stopper = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                stop.store(true, Ordering::Release);
            })
        };
        let mut sink = Collect::default();
        let outcome = decode.run(&rtsp(), &mut sink, &stop);
        stopper.join().expect("stopper");

        assert_eq!(outcome, AttemptOutcome::Stopped);
        assert!(sink.errors.is_empty());
        assert!(!sink.frames.is_empty());
    }

    #[test]
    fn sleep_unless_stopped_wakes_on_stop() {
        let stop = AtomicBool::new(true);
        let started = Instant::now();
        assert!(sleep_unless_stopped(Duration::from_secs(5), &stop));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!sleep_unless_stopped(
            Duration::from_millis(1),
            &AtomicBool::new(false)
        ));
    }
}
