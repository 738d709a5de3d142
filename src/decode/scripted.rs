//! Deterministic scripted backend.
//!
//! Each `open` consumes the next `ScriptedAttempt`. A running attempt plays
//! its `Step`s in order, which lets tests reproduce connect failures,
//! mid-stream errors, stalls and clean end-of-stream without any I/O.
//! When the script runs out, further opens fail with a connection error.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::{InputInfo, MediaBackend, MediaInput, OpenOptions, Picture};
use crate::error::StreamError;
use crate::source::StreamSource;

const SCRIPTED_WIDTH: u32 = 4;
const SCRIPTED_HEIGHT: u32 = 2;
const IDLE_SLICE: Duration = Duration::from_millis(5);

/// One action of a scripted stream.
#[derive(Clone, Debug)]
pub enum Step {
    /// Emit one picture.
    Frame,
    /// Emit `n` pictures back to back.
    Frames(usize),
    /// Fail the read with this error.
    Fail(StreamError),
    /// Produce no pictures for this long, then continue.
    Stall(Duration),
    /// Emit one picture every interval, forever.
    Stream(Duration),
    /// Produce no pictures, forever.
    Hold,
}

/// Behaviour of one connection attempt.
#[derive(Clone, Debug)]
pub enum ScriptedAttempt {
    OpenFail(StreamError),
    Run {
        codec: String,
        frame_rate: f64,
        steps: Vec<Step>,
    },
}

impl ScriptedAttempt {
    /// An h264 stream at 25 fps playing `steps`.
    pub fn steps(steps: Vec<Step>) -> Self {
        ScriptedAttempt::Run {
            codec: "h264".to_string(),
            frame_rate: 25.0,
            steps,
        }
    }

    /// Streams pictures at `interval` until stopped.
    pub fn healthy(interval: Duration) -> Self {
        Self::steps(vec![Step::Stream(interval)])
    }

    /// Plays a few frames, then fails with `error`.
    pub fn fails_after(frames: usize, error: StreamError) -> Self {
        Self::steps(vec![Step::Frames(frames), Step::Fail(error)])
    }
}

/// Backend replaying scripted attempts.
pub struct ScriptedBackend {
    attempts: Mutex<VecDeque<ScriptedAttempt>>,
    opens: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new(attempts: Vec<ScriptedAttempt>) -> Self {
        Self {
            attempts: Mutex::new(attempts.into()),
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared count of `open` calls, readable after the backend moves into an engine.
    pub fn open_counter(&self) -> Arc<AtomicUsize> {
        self.opens.clone()
    }

    /// Append attempts to the end of the script.
    pub fn push(&self, attempt: ScriptedAttempt) {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(attempt);
    }
}

impl MediaBackend for ScriptedBackend {
    fn open(
        &self,
        _source: &StreamSource,
        _options: &OpenOptions,
    ) -> Result<Box<dyn MediaInput>, StreamError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let next = self
            .attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        match next {
            None => Err(StreamError::connection("scripted source: no attempts left")),
            Some(ScriptedAttempt::OpenFail(err)) => Err(err),
            Some(ScriptedAttempt::Run {
                codec,
                frame_rate,
                steps,
            }) => Ok(Box::new(ScriptedInput {
                info: InputInfo { codec, frame_rate },
                steps: steps.into(),
                stall_until: None,
                emitted: 0,
            })),
        }
    }
}

struct ScriptedInput {
    info: InputInfo,
    steps: VecDeque<Step>,
    stall_until: Option<Instant>,
    emitted: u64,
}

impl ScriptedInput {
    fn picture(&mut self) -> Picture {
        self.emitted += 1;
        let value = (self.emitted % 256) as u8;
        Picture {
            width: SCRIPTED_WIDTH,
            height: SCRIPTED_HEIGHT,
            pixels: vec![value; crate::frame::rgb24_len(SCRIPTED_WIDTH, SCRIPTED_HEIGHT)],
        }
    }
}

impl MediaInput for ScriptedInput {
    fn info(&self) -> InputInfo {
        self.info.clone()
    }

    fn read(&mut self) -> Result<Option<Picture>, StreamError> {
        let Some(step) = self.steps.front_mut() else {
            return Err(StreamError::disconnected("scripted stream ended"));
        };
        match step {
            Step::Frame => {
                self.steps.pop_front();
                Ok(Some(self.picture()))
            }
            Step::Frames(remaining) => {
                if *remaining <= 1 {
                    self.steps.pop_front();
                } else {
                    *remaining -= 1;
                }
                Ok(Some(self.picture()))
            }
            Step::Fail(err) => {
                let err = err.clone();
                self.steps.pop_front();
                Err(err)
            }
            Step::Stall(duration) => {
                let now = Instant::now();
                let until = *self.stall_until.get_or_insert(now + *duration);
                if now >= until {
                    self.stall_until = None;
                    self.steps.pop_front();
                } else {
                    std::thread::sleep((until - now).min(IDLE_SLICE));
                }
                Ok(None)
            }
            Step::Stream(interval) => {
                std::thread::sleep(*interval);
                Ok(Some(self.picture()))
            }
            Step::Hold => {
                std::thread::sleep(IDLE_SLICE);
                Ok(None)
            }
        }
    }
}
