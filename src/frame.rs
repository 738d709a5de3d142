//! Decoded frames and the latest-frame slot.
//!
//! - `Frame`: one decoded RGB24 picture plus sequence number and arrival time.
//! - `StreamMetadata`: what is known about a stream once its first frame decodes.
//! - `FrameSlot`: single-element, overwrite-on-write holder shared with the consumer.
//!
//! The slot never queues. A `put` replaces whatever is held, and the previous
//! frame is dropped as soon as no consumer still holds a handle to it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use crate::error::StreamError;
use crate::metrics::FpsCounter;
use crate::watchdog::StallDeadline;

/// Bytes per pixel for packed RGB24.
pub const RGB24_BYTES_PER_PIXEL: usize = 3;

/// Decoded picture in packed RGB24.
///
/// Width, height and buffer length are checked together at construction and
/// are immutable afterwards, so a `Frame` is always internally consistent.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    sequence: u64,
    captured_at: SystemTime,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        pixels: Vec<u8>,
        sequence: u64,
        captured_at: SystemTime,
    ) -> Result<Self, StreamError> {
        let expected = rgb24_len(width, height);
        if width == 0 || height == 0 {
            return Err(StreamError::codec(format!(
                "decoded frame has empty dimensions {width}x{height}"
            )));
        }
        if pixels.len() != expected {
            return Err(StreamError::codec(format!(
                "decoded frame buffer is {} bytes, expected {expected} for {width}x{height} RGB24",
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
            sequence,
            captured_at,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Packed RGB24 rows, `width * 3` bytes each, no padding.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Monotonic per-engine sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Wall-clock time the decoded frame became available.
    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// Glass-to-glass latency measured against `now` (zero if the clock went backwards).
    pub fn age_at(&self, now: SystemTime) -> Duration {
        now.duration_since(self.captured_at).unwrap_or_default()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .field("sequence", &self.sequence)
            .finish()
    }
}

pub(crate) fn rgb24_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * RGB24_BYTES_PER_PIXEL
}

/// Stream properties published once per successful connection.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamMetadata {
    pub width: u32,
    pub height: u32,
    pub codec: String,
    /// Nominal frames per second reported by the container (0.0 if unknown).
    pub frame_rate: f64,
}

impl StreamMetadata {
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

struct SlotState {
    frame: Option<Arc<Frame>>,
    last_arrival: Option<Instant>,
    frames_put: u64,
    fps: FpsCounter,
}

/// Latest-frame holder shared between the decode loop and the consumer.
///
/// `put` is called from the decode thread only; `get` from any thread at any
/// rate. Both take the same short lock, and the frame itself is swapped as an
/// `Arc`, so a reader sees either the old or the new frame in full.
pub struct FrameSlot {
    state: Mutex<SlotState>,
    deadline: Arc<StallDeadline>,
}

impl FrameSlot {
    pub fn new(deadline: Arc<StallDeadline>) -> Self {
        Self {
            state: Mutex::new(SlotState {
                frame: None,
                last_arrival: None,
                frames_put: 0,
                fps: FpsCounter::new(),
            }),
            deadline,
        }
    }

    /// Replace the held frame. Never blocks on the consumer and never fails.
    pub fn put(&self, frame: Frame) {
        let now = Instant::now();
        let previous = {
            let mut state = self.lock();
            state.last_arrival = Some(now);
            state.frames_put += 1;
            state.fps.tick(now);
            state.frame.replace(Arc::new(frame))
        };
        self.deadline.touch(now);
        // Release the old frame outside the lock.
        drop(previous);
    }

    /// Most recent frame, if any. Does not consume it.
    pub fn get(&self) -> Option<Arc<Frame>> {
        self.lock().frame.clone()
    }

    /// Drop the held frame (on stop or disconnect) and restart the FPS window.
    /// The total frame count survives for diagnostics.
    pub fn clear(&self) {
        let previous = {
            let mut state = self.lock();
            state.fps.reset();
            state.frame.take()
        };
        drop(previous);
    }

    pub fn stats(&self, now: Instant) -> SlotStats {
        let state = self.lock();
        SlotStats {
            frames_put: state.frames_put,
            current_fps: state.fps.fps(),
            has_frame: state.frame.is_some(),
            frame_size_bytes: state.frame.as_ref().map_or(0, |f| f.byte_len()),
            time_since_last_frame: state
                .last_arrival
                .map(|at| now.saturating_duration_since(at)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Point-in-time view of the slot counters.
#[derive(Clone, Debug, PartialEq)]
pub struct SlotStats {
    pub frames_put: u64,
    pub current_fps: f64,
    pub has_frame: bool,
    pub frame_size_bytes: usize,
    pub time_since_last_frame: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn solid(width: u32, height: u32, value: u8, sequence: u64) -> Frame {
        Frame::new(
            width,
            height,
            vec![value; rgb24_len(width, height)],
            sequence,
            SystemTime::now(),
        )
        .expect("valid frame")
    }

    fn slot() -> FrameSlot {
        FrameSlot::new(Arc::new(StallDeadline::new(Duration::from_millis(2500))))
    }

    #[test]
    fn frame_rejects_inconsistent_buffer() {
        let err = Frame::new(4, 4, vec![0; 10], 0, SystemTime::now()).unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::Codec);
        assert!(Frame::new(0, 4, Vec::new(), 0, SystemTime::now()).is_err());
    }

    #[test]
    fn get_on_empty_slot_returns_none() {
        assert!(slot().get().is_none());
    }

    #[test]
    fn latest_put_wins_without_queueing() {
        let slot = slot();
        for seq in 1..=20 {
            slot.put(solid(8, 8, seq as u8, seq));
        }
        let latest = slot.get().expect("frame");
        assert_eq!(latest.sequence(), 20);
        assert_eq!(latest.pixels()[0], 20);

        // Repeated reads see the same frame.
        assert_eq!(slot.get().expect("frame").sequence(), 20);
        assert_eq!(slot.stats(Instant::now()).frames_put, 20);
    }

    #[test]
    fn clear_drops_held_frame() {
        let slot = slot();
        slot.put(solid(2, 2, 1, 1));
        slot.clear();
        assert!(slot.get().is_none());
        assert!(!slot.stats(Instant::now()).has_frame);
    }

    #[test]
    fn clear_resets_frame_rate() {
        let slot = slot();
        for seq in 0..40u64 {
            slot.put(solid(2, 2, 1, seq));
            thread::sleep(Duration::from_millis(30));
        }
        assert!(slot.stats(Instant::now()).current_fps > 0.0);

        slot.clear();
        let stats = slot.stats(Instant::now());
        assert_eq!(stats.current_fps, 0.0);
        assert_eq!(stats.frame_size_bytes, 0);
        assert_eq!(stats.frames_put, 40);
    }

    #[test]
    fn put_refreshes_stall_deadline() {
        let deadline = Arc::new(StallDeadline::new(Duration::from_millis(2500)));
        let slot = FrameSlot::new(deadline.clone());
        let armed_at = Instant::now();
        deadline.arm(armed_at);
        slot.put(solid(2, 2, 1, 1));
        assert!(deadline.deadline().expect("armed") >= armed_at + Duration::from_millis(2500));
    }

    #[test]
    fn concurrent_reads_never_observe_torn_frames() {
        let slot = Arc::new(slot());
        let writer = {
            let slot = slot.clone();
            thread::spawn(move || {
                for seq in 0..2_000u64 {
                    // Alternate shapes so a torn read would mismatch dimensions.
                    let (w, h) = if seq % 2 == 0 { (16, 9) } else { (4, 3) };
                    slot.put(solid(w, h, (seq % 251) as u8, seq));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let slot = slot.clone();
                thread::spawn(move || {
                    let mut last_seq = 0;
                    for _ in 0..5_000 {
                        if let Some(frame) = slot.get() {
                            assert_eq!(
                                frame.pixels().len(),
                                rgb24_len(frame.width(), frame.height())
                            );
                            let first = frame.pixels()[0];
                            assert!(frame.pixels().iter().all(|&p| p == first));
                            assert!(frame.sequence() >= last_seq);
                            last_seq = frame.sequence();
                        }
                    }
                })
            })
            .collect();

        writer.join().expect("writer");
        for reader in readers {
            reader.join().expect("reader");
        }
        assert_eq!(slot.get().expect("frame").sequence(), 1_999);
    }
}
