//! FFmpeg-backed decode for RTSP, local files and capture devices.
//!
//! Sources are opened with low-latency options: TCP transport for RTSP,
//! demuxer buffering disabled, low-delay decoding, and socket timeouts
//! derived from the initial-connect timeout so a dead peer cannot block a
//! read forever. Decoded pictures are converted to packed RGB24.

use ffmpeg_next as ffmpeg;
use std::time::Duration;

use super::{InputInfo, MediaBackend, MediaInput, OpenOptions, Picture};
use crate::error::StreamError;
use crate::source::{SourceKind, StreamSource};

/// Consecutive undecodable packets tolerated before the stream is declared broken.
const MAX_CONSECUTIVE_DECODE_ERRORS: u32 = 25;

#[cfg(target_os = "linux")]
const DEVICE_INPUT_FORMAT: &str = "video4linux2,v4l2";
#[cfg(target_os = "windows")]
const DEVICE_INPUT_FORMAT: &str = "dshow";
#[cfg(target_os = "macos")]
const DEVICE_INPUT_FORMAT: &str = "avfoundation";
#[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
const DEVICE_INPUT_FORMAT: &str = "";

#[derive(Clone, Copy, Debug, Default)]
pub struct FfmpegBackend;

impl MediaBackend for FfmpegBackend {
    fn open(
        &self,
        source: &StreamSource,
        options: &OpenOptions,
    ) -> Result<Box<dyn MediaInput>, StreamError> {
        Ok(Box::new(FfmpegInput::open(source, options)?))
    }
}

struct FfmpegInput {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: Option<Scaler>,
    info: InputInfo,
    decode_errors: u32,
}

struct Scaler {
    context: ffmpeg::software::scaling::Context,
    format: ffmpeg::util::format::pixel::Pixel,
    width: u32,
    height: u32,
}

impl FfmpegInput {
    fn open(source: &StreamSource, options: &OpenOptions) -> Result<Self, StreamError> {
        ffmpeg::init().map_err(|e| StreamError::connection(format!("initialize ffmpeg: {e}")))?;

        let input = open_input(source, options)?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| StreamError::connection("no video stream found in source"))?;
        let stream_index = input_stream.index();
        let parameters = input_stream.parameters();
        let codec = parameters.id().name().to_string();
        let frame_rate = rational_to_f64(input_stream.avg_frame_rate())
            .or_else(|| rational_to_f64(input_stream.rate()))
            .unwrap_or(0.0);

        let mut context = ffmpeg::codec::context::Context::from_parameters(parameters)
            .map_err(|e| StreamError::codec(format!("load {codec} decoder parameters: {e}")))?;
        context.set_flags(ffmpeg::codec::Flags::LOW_DELAY);
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| StreamError::codec(format!("open {codec} decoder: {e}")))?;

        log::info!(
            "ffmpeg: opened {} (codec={}, {}x{}, {:.2} fps)",
            source,
            codec,
            decoder.width(),
            decoder.height(),
            frame_rate
        );

        Ok(Self {
            input,
            stream_index,
            decoder,
            scaler: None,
            info: InputInfo { codec, frame_rate },
            decode_errors: 0,
        })
    }

    fn convert(&mut self, decoded: &ffmpeg::frame::Video) -> Result<Picture, StreamError> {
        let (format, width, height) = (decoded.format(), decoded.width(), decoded.height());
        let stale = self
            .scaler
            .as_ref()
            .map_or(true, |s| s.format != format || s.width != width || s.height != height);
        if stale {
            let context = ffmpeg::software::scaling::Context::get(
                format,
                width,
                height,
                ffmpeg::util::format::pixel::Pixel::RGB24,
                width,
                height,
                ffmpeg::software::scaling::flag::Flags::BILINEAR,
            )
            .map_err(|e| StreamError::codec(format!("create RGB24 scaler: {e}")))?;
            self.scaler = Some(Scaler {
                context,
                format,
                width,
                height,
            });
        }
        let Some(scaler) = self.scaler.as_mut() else {
            return Err(StreamError::codec("RGB24 scaler unavailable"));
        };

        let mut rgb_frame = ffmpeg::frame::Video::empty();
        scaler
            .context
            .run(decoded, &mut rgb_frame)
            .map_err(|e| StreamError::codec(format!("scale frame to RGB24: {e}")))?;
        frame_to_picture(&rgb_frame)
    }
}

impl MediaInput for FfmpegInput {
    fn info(&self) -> InputInfo {
        self.info.clone()
    }

    fn read(&mut self) -> Result<Option<Picture>, StreamError> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => {
                return Err(StreamError::disconnected("end of stream"));
            }
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                std::thread::sleep(Duration::from_millis(10));
                return Ok(None);
            }
            Err(e) => return Err(StreamError::network(format!("read packet: {e}"))),
        }
        if packet.stream() != self.stream_index {
            return Ok(None);
        }

        if let Err(e) = self.decoder.send_packet(&packet) {
            self.decode_errors += 1;
            log::debug!("ffmpeg: dropped undecodable packet: {e}");
            if self.decode_errors >= MAX_CONSECUTIVE_DECODE_ERRORS {
                return Err(StreamError::codec(format!(
                    "{} consecutive packets failed to decode: {e}",
                    self.decode_errors
                )));
            }
            return Ok(None);
        }
        self.decode_errors = 0;

        // Keep only the newest picture completed by this packet.
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut latest = None;
        while self.decoder.receive_frame(&mut decoded).is_ok() {
            latest = Some(self.convert(&decoded)?);
        }
        Ok(latest)
    }
}

fn open_input(
    source: &StreamSource,
    options: &OpenOptions,
) -> Result<ffmpeg::format::context::Input, StreamError> {
    let timeout_us = options.connect_timeout.as_micros().to_string();
    let mut dict = ffmpeg::Dictionary::new();
    dict.set("fflags", "nobuffer");
    dict.set("flags", "low_delay");
    dict.set("strict", "experimental");

    match source.kind() {
        SourceKind::Rtsp => {
            dict.set("rtsp_transport", "tcp");
            dict.set("allowed_media_types", "video");
            dict.set("timeout", &timeout_us);
            dict.set("buffer_size", "2048000");
            ffmpeg::format::input_with_dictionary(&source.address(), dict)
                .map_err(|e| StreamError::connection(format!("open {source}: {e}")))
        }
        SourceKind::File => ffmpeg::format::input_with_dictionary(&source.address(), dict)
            .map_err(|e| StreamError::connection(format!("open {source}: {e}"))),
        SourceKind::Device => {
            dict.set("framerate", "30");
            dict.set("video_size", "640x480");
            let format = device_input_format()?;
            let path = device_path(source.address());
            ffmpeg::format::open_with(
                &path,
                &ffmpeg::format::format::Format::Input(format),
                dict,
            )
            .map(|context| context.input())
            .map_err(|e| StreamError::connection(format!("open device {path}: {e}")))
        }
    }
}

fn device_input_format() -> Result<ffmpeg::format::format::Input, StreamError> {
    ffmpeg::device::register_all();
    ffmpeg::device::input::video()
        .find(|format| format.name() == DEVICE_INPUT_FORMAT)
        .ok_or_else(|| {
            StreamError::connection(format!(
                "capture input format '{DEVICE_INPUT_FORMAT}' is not available in this ffmpeg build"
            ))
        })
}

/// Map an operator-style device id onto what the platform input format expects.
fn device_path(address: &str) -> String {
    let address = address.trim();
    if address.chars().all(|c| c.is_ascii_digit()) {
        if cfg!(target_os = "linux") {
            return format!("/dev/video{address}");
        }
        if cfg!(target_os = "windows") {
            return format!("video={address}");
        }
    }
    address.to_string()
}

fn rational_to_f64(rational: ffmpeg::Rational) -> Option<f64> {
    (rational.numerator() > 0 && rational.denominator() > 0).then(|| f64::from(rational))
}

fn frame_to_picture(frame: &ffmpeg::frame::Video) -> Result<Picture, StreamError> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .ok_or_else(|| StreamError::codec("RGB24 frame is shorter than its dimensions"))?
            .to_vec();
        return Ok(Picture {
            width,
            height,
            pixels,
        });
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .ok_or_else(|| StreamError::codec("RGB24 frame row is out of bounds"))?,
        );
    }

    Ok(Picture {
        width,
        height,
        pixels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_device_ids_map_to_platform_paths() {
        if cfg!(target_os = "linux") {
            assert_eq!(device_path("0"), "/dev/video0");
        }
        assert_eq!(device_path("/dev/video3"), "/dev/video3");
    }

    #[test]
    fn missing_file_is_connection_error() {
        let source = StreamSource::file("/definitely/not/here.mp4");
        let err = FfmpegBackend
            .open(&source, &OpenOptions::default())
            .err()
            .expect("open fails");
        assert_eq!(err.kind, crate::ErrorKind::Connection);
    }
}
