//! Fixed-schedule restart plan.

use std::time::Duration;

/// Default delays between reconnection attempts.
pub const DEFAULT_RETRY_DELAYS_SECS: [u64; 5] = [0, 2, 5, 10, 30];

/// Ordered restart delays plus the attempt counter.
///
/// The counter is reset on every successful PLAYING transition and on every
/// explicit start. Each restart entry consumes the next delay; once the
/// schedule is exhausted `next_delay` returns `None`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPlan {
    delays: Vec<Duration>,
    attempt: usize,
}

impl Default for RetryPlan {
    fn default() -> Self {
        Self::new(
            DEFAULT_RETRY_DELAYS_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        )
    }
}

impl RetryPlan {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays, attempt: 0 }
    }

    /// Enter a restart: returns `(attempt, delay)` with the 1-based attempt
    /// number, or `None` once every delay has been used.
    pub fn next_delay(&mut self) -> Option<(usize, Duration)> {
        self.attempt += 1;
        self.delays
            .get(self.attempt - 1)
            .map(|delay| (self.attempt, *delay))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn max_attempts(&self) -> usize {
        self.delays.len()
    }

    pub fn remaining(&self) -> usize {
        self.delays.len().saturating_sub(self.attempt)
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt > self.delays.len()
    }
}
