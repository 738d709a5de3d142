//! VisionStream
//!
//! A resilient, low-latency engine that turns a live or recorded video source
//! into a steady supply of decoded RGB frames, and keeps doing so through
//! network drops, decoder failures and silent stalls.
//!
//! # Architecture
//!
//! - `frame`: `Frame`, `StreamMetadata` and the latest-wins `FrameSlot`
//! - `decode`: the `MediaBackend` capability and the per-attempt `DecodeLoop`
//! - `watchdog`: stall deadline and the periodic `Watchdog` thread
//! - `retry`: fixed restart schedule
//! - `engine`: reconnection state machine and the `StreamEngine` facade
//! - `events`: consumer events and the injected `EventLog`
//! - `config`: `EngineConfig` (defaults, JSON/TOML file, env overrides)
//!
//! The consumer polls `StreamEngine::current_frame()` at its own cadence and
//! reads lifecycle changes from `StreamEngine::events()`. Neither side ever
//! waits on the other.

pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod events;
pub mod frame;
pub mod metrics;
pub mod retry;
pub mod source;
pub mod watchdog;

pub use config::EngineConfig;
pub use decode::{AutoBackend, MediaBackend, MediaInput, OpenOptions};
pub use engine::{ConnectionState, EngineBuilder, StreamEngine};
pub use error::{ErrorKind, StreamError};
pub use events::{EngineEvent, EventLog, LogFacade, LogRecord, RecordKind};
pub use frame::{Frame, FrameSlot, StreamMetadata};
pub use metrics::{EngineStats, LatencyTracker, RetryInfo};
pub use retry::RetryPlan;
pub use source::{SourceKind, StreamSource};
