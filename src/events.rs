//! Consumer events and the injected logging capability.
//!
//! The presentation layer only ever sees `EngineEvent`s, delivered in the order
//! the state machine processes them. Every event, plus the start and end of
//! each connection attempt, is also written as one `LogRecord` to the
//! `EventLog` the engine was built with.

use std::fmt;
use std::time::{Duration, SystemTime};

use crate::error::{ErrorKind, StreamError};
use crate::frame::StreamMetadata;

/// Lifecycle notifications for the consumer.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    /// First frame decoded; stream is PLAYING.
    Connected(StreamMetadata),
    /// A restart has been scheduled.
    Reconnecting { attempt: usize, delay: Duration },
    /// A playing stream was lost.
    Disconnected(StreamError),
    /// An attempt failed, or (with `ErrorKind::MaxRetriesExceeded`) the engine gave up.
    Error(StreamError),
    /// The engine returned to IDLE after `stop()`.
    Stopped,
}

impl EngineEvent {
    pub fn is_terminal_error(&self) -> bool {
        matches!(self, EngineEvent::Error(err) if err.kind == ErrorKind::MaxRetriesExceeded)
    }
}

/// Category of a structured log record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    AttemptStarted,
    AttemptEnded,
    Connected,
    Reconnecting,
    Disconnected,
    Error,
    Stopped,
    /// Worker abandoned, ignored command, and similar engine-side warnings.
    Warning,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::AttemptStarted => "attempt_started",
            RecordKind::AttemptEnded => "attempt_ended",
            RecordKind::Connected => "connected",
            RecordKind::Reconnecting => "reconnecting",
            RecordKind::Disconnected => "disconnected",
            RecordKind::Error => "error",
            RecordKind::Stopped => "stopped",
            RecordKind::Warning => "warning",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured log entry.
#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    pub timestamp: SystemTime,
    pub kind: RecordKind,
    pub detail: String,
}

impl LogRecord {
    pub fn new(kind: RecordKind, detail: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            kind,
            detail: detail.into(),
        }
    }

    pub(crate) fn for_event(event: &EngineEvent) -> Self {
        match event {
            EngineEvent::Connected(meta) => Self::new(
                RecordKind::Connected,
                format!(
                    "codec={} resolution={} fps={:.2}",
                    meta.codec,
                    meta.resolution(),
                    meta.frame_rate
                ),
            ),
            EngineEvent::Reconnecting { attempt, delay } => Self::new(
                RecordKind::Reconnecting,
                format!("attempt={attempt} delay={:.1}s", delay.as_secs_f64()),
            ),
            EngineEvent::Disconnected(err) => Self::new(RecordKind::Disconnected, err.to_string()),
            EngineEvent::Error(err) => Self::new(RecordKind::Error, err.to_string()),
            EngineEvent::Stopped => Self::new(RecordKind::Stopped, "stream stopped"),
        }
    }
}

/// Logging capability handed to the engine at construction.
pub trait EventLog: Send + Sync {
    fn record(&self, record: LogRecord);
}

/// Default `EventLog` forwarding to the `log` facade under target `visionstream`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogFacade;

impl EventLog for LogFacade {
    fn record(&self, record: LogRecord) {
        let level = match record.kind {
            RecordKind::AttemptStarted | RecordKind::AttemptEnded => log::Level::Debug,
            RecordKind::Connected | RecordKind::Reconnecting | RecordKind::Stopped => {
                log::Level::Info
            }
            RecordKind::Disconnected | RecordKind::Warning => log::Level::Warn,
            RecordKind::Error => log::Level::Error,
        };
        log::log!(target: "visionstream", level, "{}: {}", record.kind, record.detail);
    }
}
