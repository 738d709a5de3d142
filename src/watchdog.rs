//! Frame-arrival liveness monitoring.
//!
//! `StallDeadline` is the shared input: the frame slot refreshes it on every
//! arrival, the state machine arms it on entering PLAYING and disarms it on
//! leaving. `Watchdog` is a periodic thread that polls the deadline and reports
//! at most one stall per armed episode.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::{Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct DeadlineState {
    armed: bool,
    fired: bool,
    epoch: u64,
    deadline: Option<Instant>,
}

/// Last-arrival-plus-threshold deadline, armed only while PLAYING.
#[derive(Debug)]
pub struct StallDeadline {
    threshold: Duration,
    state: Mutex<DeadlineState>,
}

impl StallDeadline {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            state: Mutex::new(DeadlineState {
                armed: false,
                fired: false,
                epoch: 0,
                deadline: None,
            }),
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Start a new stall episode with the deadline seeded at `now`.
    ///
    /// Returns the episode number reported back by `poll`.
    pub fn arm(&self, now: Instant) -> u64 {
        let mut state = self.lock();
        state.armed = true;
        state.fired = false;
        state.epoch += 1;
        state.deadline = Some(now + self.threshold);
        state.epoch
    }

    pub fn disarm(&self) {
        let mut state = self.lock();
        state.armed = false;
        state.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.lock().armed
    }

    /// Record a frame arrival. Ignored while disarmed.
    pub fn touch(&self, now: Instant) {
        let mut state = self.lock();
        if state.armed {
            state.deadline = Some(now + self.threshold);
            state.fired = false;
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.lock().deadline
    }

    /// Check the deadline at `now`.
    ///
    /// Returns the episode number the first time the deadline is reached while
    /// armed; `None` on every other call until the next `arm` or `touch`.
    pub fn poll(&self, now: Instant) -> Option<u64> {
        let mut state = self.lock();
        if !state.armed || state.fired {
            return None;
        }
        match state.deadline {
            Some(deadline) if now >= deadline => {
                state.fired = true;
                Some(state.epoch)
            }
            _ => None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeadlineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Periodic stall detector running on its own thread.
pub struct Watchdog {
    shutdown: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Spawn the polling thread. `on_stall` receives the episode number.
    pub fn spawn<F>(
        deadline: std::sync::Arc<StallDeadline>,
        interval: Duration,
        on_stall: F,
    ) -> std::io::Result<Self>
    where
        F: Fn(u64) + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let join = std::thread::Builder::new()
            .name("stream-watchdog".to_string())
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Some(epoch) = deadline.poll(Instant::now()) {
                            log::debug!(
                                "watchdog: no frame for {:?} (episode {epoch})",
                                deadline.threshold()
                            );
                            on_stall(epoch);
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self {
            shutdown: Some(shutdown_tx),
            join: Some(join),
        })
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.try_send(());
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::warn!("watchdog thread panicked");
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const THRESHOLD: Duration = Duration::from_millis(2500);
    const TICK: Duration = Duration::from_millis(100);

    #[test]
    fn disarmed_deadline_never_fires() {
        let deadline = StallDeadline::new(THRESHOLD);
        let start = Instant::now();
        deadline.touch(start);
        assert_eq!(deadline.poll(start + Duration::from_secs(60)), None);
    }

    #[test]
    fn stall_fires_within_one_tick_after_threshold() {
        let deadline = StallDeadline::new(THRESHOLD);
        let start = Instant::now();
        let epoch = deadline.arm(start);

        let mut fired_at = None;
        for tick in 1..=40u32 {
            let now = start + TICK * tick;
            if let Some(e) = deadline.poll(now) {
                assert_eq!(e, epoch);
                fired_at = Some(now - start);
                break;
            }
        }
        let fired_at = fired_at.expect("stall fired");
        assert!(fired_at >= Duration::from_millis(2500));
        assert!(fired_at < Duration::from_millis(2600));
    }

    #[test]
    fn stall_fires_once_per_episode() {
        let deadline = StallDeadline::new(THRESHOLD);
        let start = Instant::now();
        deadline.arm(start);
        assert!(deadline.poll(start + THRESHOLD).is_some());
        for tick in 1..10u32 {
            assert_eq!(deadline.poll(start + THRESHOLD + TICK * tick), None);
        }

        // A new episode can fire again.
        let rearmed = start + Duration::from_secs(10);
        let epoch = deadline.arm(rearmed);
        assert_eq!(deadline.poll(rearmed + THRESHOLD), Some(epoch));
    }

    #[test]
    fn frame_arrival_pushes_deadline_out() {
        let deadline = StallDeadline::new(THRESHOLD);
        let start = Instant::now();
        deadline.arm(start);
        deadline.touch(start + Duration::from_millis(2000));
        assert_eq!(deadline.poll(start + Duration::from_millis(2600)), None);
        assert!(deadline
            .poll(start + Duration::from_millis(4500))
            .is_some());
    }

    #[test]
    fn disarm_suppresses_pending_stall() {
        let deadline = StallDeadline::new(THRESHOLD);
        let start = Instant::now();
        deadline.arm(start);
        deadline.disarm();
        assert!(!deadline.is_armed());
        assert_eq!(deadline.poll(start + THRESHOLD * 2), None);
    }

    #[test]
    fn watchdog_thread_reports_stall_once() {
        let deadline = Arc::new(StallDeadline::new(Duration::from_millis(50)));
        let stalls = Arc::new(AtomicUsize::new(0));
        let counter = stalls.clone();
        let mut watchdog = Watchdog::spawn(deadline.clone(), Duration::from_millis(5), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("spawn watchdog");

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(stalls.load(Ordering::SeqCst), 0, "disarmed watchdog fired");

        deadline.arm(Instant::now());
        std::thread::sleep(Duration::from_millis(300));
        watchdog.shutdown();
        assert_eq!(stalls.load(Ordering::SeqCst), 1);
    }
}
