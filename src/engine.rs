//! Reconnection state machine and the public engine facade.
//!
//! One supervisor thread owns `ConnectionState`, the `RetryPlan` and the
//! current metadata. Everything that can change them (facade commands, decode
//! worker reports, watchdog stalls) arrives as a `Message` on a single
//! channel and is applied one at a time, so concurrent triggers never race.
//!
//! The scheduled restart is a deadline the supervisor waits on with
//! `recv_deadline`; a `stop()` processed before the deadline clears it, so no
//! restart can fire afterwards. Each decode attempt runs on its own thread and
//! tags its reports with a generation number; reports from older attempts are
//! dropped.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::decode::{AutoBackend, DecodeLoop, DecodeSink, MediaBackend};
use crate::error::StreamError;
use crate::events::{EngineEvent, EventLog, LogFacade, LogRecord, RecordKind};
use crate::frame::{Frame, FrameSlot, StreamMetadata};
use crate::metrics::{EngineStats, RetryInfo};
use crate::retry::RetryPlan;
use crate::source::StreamSource;
use crate::watchdog::{StallDeadline, Watchdog};

/// Lifecycle state of the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Playing,
    Reconnecting,
    /// Retries exhausted; waits for a manual `start()`.
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Playing => "playing",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }

    /// True while a stream is wanted (anything but IDLE and ERROR).
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Playing | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Message {
    Start(StreamSource),
    Stop(Sender<()>),
    Metadata {
        generation: u64,
        metadata: StreamMetadata,
    },
    Failed {
        generation: u64,
        error: StreamError,
    },
    Stall {
        epoch: u64,
    },
    Shutdown(Sender<()>),
}

/// Snapshot of supervisor state readable from the facade.
#[derive(Clone, Debug)]
struct Status {
    state: ConnectionState,
    attempt: usize,
    max_attempts: usize,
    metadata: Option<StreamMetadata>,
}

struct Shared {
    slot: FrameSlot,
    status: Mutex<Status>,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Builder for `StreamEngine`; defaults to `AutoBackend` and `LogFacade`.
pub struct EngineBuilder {
    config: EngineConfig,
    backend: Arc<dyn MediaBackend>,
    log: Arc<dyn EventLog>,
}

impl EngineBuilder {
    pub fn backend(mut self, backend: Arc<dyn MediaBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.log = log;
        self
    }

    /// Spawn the supervisor and watchdog threads.
    pub fn build(self) -> std::io::Result<StreamEngine> {
        let EngineBuilder {
            config,
            backend,
            log,
        } = self;

        let deadline = Arc::new(StallDeadline::new(config.stall_threshold));
        let shared = Arc::new(Shared {
            slot: FrameSlot::new(deadline.clone()),
            status: Mutex::new(Status {
                state: ConnectionState::Idle,
                attempt: 0,
                max_attempts: config.retry_delays.len(),
                metadata: None,
            }),
        });
        let (inbox_tx, inbox_rx) = unbounded::<Message>();
        let (events_tx, events_rx) = unbounded::<EngineEvent>();

        let stall_tx = inbox_tx.clone();
        let watchdog = Watchdog::spawn(deadline.clone(), config.watchdog_interval, move |epoch| {
            let _ = stall_tx.send(Message::Stall { epoch });
        })?;

        let join_timeout = config.join_timeout;
        let supervisor = Supervisor {
            plan: config.retry_plan(),
            config,
            backend,
            log,
            shared: shared.clone(),
            deadline,
            events: events_tx,
            inbox: inbox_tx.clone(),
            state: ConnectionState::Idle,
            source: None,
            metadata: None,
            worker: None,
            generation: 0,
            stall_epoch: None,
            restart_at: None,
            sequence: Arc::new(AtomicU64::new(0)),
        };
        let join = std::thread::Builder::new()
            .name("stream-supervisor".to_string())
            .spawn(move || supervisor.run(inbox_rx))?;

        Ok(StreamEngine {
            shared,
            inbox: inbox_tx,
            events: events_rx,
            join_timeout,
            supervisor: Some(join),
            watchdog: Some(watchdog),
        })
    }
}

/// Resilient stream engine.
///
/// Commands return immediately except `stop()`, which waits for the bounded
/// shutdown of the current attempt. Outcomes are reported as `EngineEvent`s;
/// frames are pulled with `current_frame()` at whatever rate the consumer
/// likes.
pub struct StreamEngine {
    shared: Arc<Shared>,
    inbox: Sender<Message>,
    events: Receiver<EngineEvent>,
    join_timeout: Duration,
    supervisor: Option<JoinHandle<()>>,
    watchdog: Option<Watchdog>,
}

impl StreamEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            backend: Arc::new(AutoBackend),
            log: Arc::new(LogFacade),
        }
    }

    pub fn new(config: EngineConfig) -> std::io::Result<Self> {
        Self::builder(config).build()
    }

    /// Begin streaming `source`. Ignored (with a warning record) while a
    /// stream is already active.
    pub fn start(&self, source: StreamSource) {
        if self.inbox.send(Message::Start(source)).is_err() {
            log::warn!("engine supervisor is gone; start ignored");
        }
    }

    /// Stop streaming and return to IDLE. A no-op when already idle.
    pub fn stop(&self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.inbox.send(Message::Stop(ack_tx)).is_err() {
            return;
        }
        // The supervisor may be finishing one bounded join before it gets to us.
        let wait = self.join_timeout * 2 + Duration::from_millis(500);
        if let Err(RecvTimeoutError::Timeout) = ack_rx.recv_timeout(wait) {
            log::warn!("engine stop not acknowledged within {wait:?}");
        }
    }

    /// Most recent decoded frame. Never blocks on the decoder.
    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.shared.slot.get()
    }

    /// Event stream. All receivers share one queue, so use a single consumer.
    pub fn events(&self) -> Receiver<EngineEvent> {
        self.events.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status().state
    }

    /// Metadata of the current connection; `None` unless PLAYING.
    pub fn metadata(&self) -> Option<StreamMetadata> {
        self.shared.status().metadata.clone()
    }

    pub fn stats(&self) -> EngineStats {
        let (state, attempt) = {
            let status = self.shared.status();
            (status.state, status.attempt)
        };
        let slot = self.shared.slot.stats(Instant::now());
        EngineStats {
            state,
            attempt,
            frames_decoded: slot.frames_put,
            current_fps: slot.current_fps,
            has_frame: slot.has_frame,
            frame_size_bytes: slot.frame_size_bytes,
            time_since_last_frame: slot.time_since_last_frame,
        }
    }

    pub fn retry_info(&self) -> RetryInfo {
        let status = self.shared.status();
        RetryInfo {
            state: status.state,
            attempt: status.attempt,
            max_attempts: status.max_attempts,
            remaining_attempts: status.max_attempts.saturating_sub(status.attempt),
        }
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.shutdown();
        }
        let (ack_tx, ack_rx) = bounded(1);
        if self.inbox.send(Message::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.recv_timeout(self.join_timeout * 2 + Duration::from_millis(500));
        }
        if let Some(join) = self.supervisor.take() {
            if join.join().is_err() {
                log::warn!("engine supervisor thread panicked");
            }
        }
    }
}

/// Handle to the decode thread of one attempt.
struct Worker {
    generation: u64,
    stop: Arc<AtomicBool>,
    /// Disconnects when the thread exits.
    done: Receiver<()>,
    join: JoinHandle<()>,
}

/// Forwards decode output of one attempt to the slot and the supervisor.
///
/// Metadata is held back until the first frame is in the slot, so a consumer
/// reacting to `Connected` always finds a frame.
struct AttemptSink {
    generation: u64,
    shared: Arc<Shared>,
    inbox: Sender<Message>,
    stop: Arc<AtomicBool>,
    pending_metadata: Option<StreamMetadata>,
}

impl DecodeSink for AttemptSink {
    fn on_metadata(&mut self, metadata: StreamMetadata) {
        self.pending_metadata = Some(metadata);
    }

    fn on_frame(&mut self, frame: Frame) {
        // An abandoned worker must not repopulate the slot after stop.
        if self.stop.load(Ordering::Acquire) {
            return;
        }
        self.shared.slot.put(frame);
        if let Some(metadata) = self.pending_metadata.take() {
            let _ = self.inbox.send(Message::Metadata {
                generation: self.generation,
                metadata,
            });
        }
    }

    fn on_error(&mut self, error: StreamError) {
        let _ = self.inbox.send(Message::Failed {
            generation: self.generation,
            error,
        });
    }
}

struct Supervisor {
    config: EngineConfig,
    backend: Arc<dyn MediaBackend>,
    log: Arc<dyn EventLog>,
    shared: Arc<Shared>,
    deadline: Arc<StallDeadline>,
    events: Sender<EngineEvent>,
    inbox: Sender<Message>,
    state: ConnectionState,
    plan: RetryPlan,
    source: Option<StreamSource>,
    metadata: Option<StreamMetadata>,
    worker: Option<Worker>,
    generation: u64,
    stall_epoch: Option<u64>,
    restart_at: Option<Instant>,
    /// Frame sequence numbers, monotonic across attempts.
    sequence: Arc<AtomicU64>,
}

impl Supervisor {
    fn run(mut self, inbox: Receiver<Message>) {
        loop {
            let message = match self.restart_at {
                Some(at) => match inbox.recv_deadline(at) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => {
                        self.restart_due();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match inbox.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };

            match message {
                Message::Start(source) => self.start(source),
                Message::Stop(ack) => {
                    self.stop();
                    let _ = ack.send(());
                }
                Message::Metadata {
                    generation,
                    metadata,
                } => self.on_metadata(generation, metadata),
                Message::Failed { generation, error } => self.on_failure(generation, error),
                Message::Stall { epoch } => self.on_stall(epoch),
                Message::Shutdown(ack) => {
                    self.stop();
                    let _ = ack.send(());
                    break;
                }
            }
        }
        log::debug!("engine supervisor exiting");
    }

    fn start(&mut self, source: StreamSource) {
        if self.state.is_active() {
            self.record(
                RecordKind::Warning,
                format!("start({source}) ignored while {}; stop first", self.state),
            );
            return;
        }
        self.plan.reset();
        self.source = Some(source);
        self.set_state(ConnectionState::Connecting);
        self.launch();
    }

    fn stop(&mut self) {
        if self.state == ConnectionState::Idle {
            return;
        }
        self.restart_at = None;
        self.deadline.disarm();
        self.stall_epoch = None;
        self.stop_worker();
        self.shared.slot.clear();
        self.metadata = None;
        self.source = None;
        self.plan.reset();
        self.set_state(ConnectionState::Idle);
        self.emit(EngineEvent::Stopped);
    }

    fn launch(&mut self) {
        let Some(source) = self.source.clone() else {
            return;
        };
        self.generation += 1;
        let generation = self.generation;
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = bounded::<()>(0);
        let decode = DecodeLoop::new(
            self.backend.clone(),
            self.config.open_options(),
            self.config.supported_codecs.clone(),
            self.sequence.clone(),
        );
        let mut sink = AttemptSink {
            generation,
            shared: self.shared.clone(),
            inbox: self.inbox.clone(),
            stop: stop.clone(),
            pending_metadata: None,
        };
        let log = self.log.clone();
        let should_stop = stop.clone();

        self.record(
            RecordKind::AttemptStarted,
            format!("attempt #{generation} source={source}"),
        );
        let spawned = std::thread::Builder::new()
            .name(format!("stream-decode-{generation}"))
            .spawn(move || {
                let _done = done_tx;
                let outcome = decode.run(&source, &mut sink, &should_stop);
                log.record(LogRecord::new(
                    RecordKind::AttemptEnded,
                    format!("attempt #{generation} outcome={outcome:?}"),
                ));
            });

        match spawned {
            Ok(join) => {
                self.worker = Some(Worker {
                    generation,
                    stop,
                    done: done_rx,
                    join,
                });
            }
            Err(err) => self.on_failure(
                generation,
                StreamError::connection(format!("spawn decode thread: {err}")),
            ),
        }
    }

    fn on_metadata(&mut self, generation: u64, metadata: StreamMetadata) {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            return;
        }
        self.plan.reset();
        self.metadata = Some(metadata.clone());
        self.stall_epoch = Some(self.deadline.arm(Instant::now()));
        self.set_state(ConnectionState::Playing);
        self.emit(EngineEvent::Connected(metadata));
    }

    fn on_failure(&mut self, generation: u64, error: StreamError) {
        if generation != self.generation {
            return;
        }
        match self.state {
            ConnectionState::Connecting => {
                self.emit(EngineEvent::Error(error));
                self.schedule_restart();
            }
            ConnectionState::Playing => self.lose_stream(error),
            _ => {}
        }
    }

    fn on_stall(&mut self, epoch: u64) {
        if self.state != ConnectionState::Playing || self.stall_epoch != Some(epoch) {
            return;
        }
        let error = StreamError::network(format!(
            "no frames received for {:.1}s",
            self.config.stall_threshold.as_secs_f64()
        ));
        self.lose_stream(error);
    }

    /// PLAYING -> RECONNECTING.
    fn lose_stream(&mut self, reason: StreamError) {
        self.deadline.disarm();
        self.stall_epoch = None;
        self.stop_worker();
        self.shared.slot.clear();
        self.metadata = None;
        self.emit(EngineEvent::Disconnected(reason));
        self.schedule_restart();
    }

    fn schedule_restart(&mut self) {
        self.stop_worker();
        match self.plan.next_delay() {
            Some((attempt, delay)) => {
                self.restart_at = Some(Instant::now() + delay);
                self.set_state(ConnectionState::Reconnecting);
                self.emit(EngineEvent::Reconnecting { attempt, delay });
            }
            None => {
                self.restart_at = None;
                self.set_state(ConnectionState::Error);
                self.emit(EngineEvent::Error(StreamError::max_retries(
                    self.plan.max_attempts(),
                )));
            }
        }
    }

    fn restart_due(&mut self) {
        self.restart_at = None;
        if self.state != ConnectionState::Reconnecting {
            return;
        }
        self.set_state(ConnectionState::Connecting);
        self.launch();
    }

    /// Signal the current worker and wait up to `join_timeout` for it.
    fn stop_worker(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.stop.store(true, Ordering::Release);
        match worker.done.recv_timeout(self.config.join_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                self.record(
                    RecordKind::Warning,
                    format!(
                        "decode worker #{} did not exit within {:?}; abandoning it",
                        worker.generation, self.config.join_timeout
                    ),
                );
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.join.join().is_err() {
                    self.record(
                        RecordKind::Warning,
                        format!("decode worker #{} panicked", worker.generation),
                    );
                }
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        let mut status = self.shared.status();
        status.state = state;
        status.attempt = self.plan.attempt();
        status.metadata = self.metadata.clone();
    }

    fn emit(&self, event: EngineEvent) {
        self.log.record(LogRecord::for_event(&event));
        let _ = self.events.send(event);
    }

    fn record(&self, kind: RecordKind, detail: String) {
        self.log.record(LogRecord::new(kind, detail));
    }
}
