//! Frame-rate and latency counters.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::engine::ConnectionState;

const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Frames-per-second counter, recomputed once per one-second window.
#[derive(Clone, Debug, Default)]
pub struct FpsCounter {
    window_start: Option<Instant>,
    frames_in_window: u32,
    current_fps: f64,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one frame arriving at `now`. Returns the current estimate.
    pub fn tick(&mut self, now: Instant) -> f64 {
        let start = *self.window_start.get_or_insert(now);
        self.frames_in_window += 1;
        let elapsed = now.saturating_duration_since(start);
        if elapsed >= FPS_WINDOW {
            self.current_fps = f64::from(self.frames_in_window) / elapsed.as_secs_f64();
            self.frames_in_window = 0;
            self.window_start = Some(now);
        }
        self.current_fps
    }

    pub fn fps(&self) -> f64 {
        self.current_fps
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Rolling window of glass-to-glass latency samples.
#[derive(Clone, Debug)]
pub struct LatencyTracker {
    window: usize,
    samples: VecDeque<Duration>,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(30)
    }
}

impl LatencyTracker {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
        }
    }

    pub fn record(&mut self, latency: Duration) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
    }

    pub fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        self.samples.iter().sum::<Duration>() / self.samples.len() as u32
    }

    pub fn max(&self) -> Duration {
        self.samples.iter().copied().max().unwrap_or_default()
    }

    pub fn min(&self) -> Duration {
        self.samples.iter().copied().min().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Snapshot returned by `StreamEngine::stats`.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineStats {
    pub state: ConnectionState,
    pub attempt: usize,
    pub frames_decoded: u64,
    pub current_fps: f64,
    pub has_frame: bool,
    pub frame_size_bytes: usize,
    pub time_since_last_frame: Option<Duration>,
}

/// Snapshot returned by `StreamEngine::retry_info`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryInfo {
    pub state: ConnectionState,
    pub attempt: usize,
    pub max_attempts: usize,
    pub remaining_attempts: usize,
}
