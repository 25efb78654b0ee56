//! Reconnection scheduling with exponential backoff.

use std::time::Duration;
use tracing::{debug, info};

use crate::config::RetryConfig;
use crate::timer::{TimerId, Timers};

/// Snapshot of the scheduler's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Retries scheduled since the last reset.
    pub attempt: u32,
    /// Delay the next retry will use.
    pub current_delay: Duration,
    /// Retry budget.
    pub max_attempts: u32,
    /// Delay cap.
    pub max_delay: Duration,
    /// Timer of the pending retry, if any.
    pub pending_timer: Option<TimerId>,
}

/// Result of asking for a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// A retry timer was armed.
    Scheduled {
        /// 1-based attempt number.
        attempt: u32,
        /// Delay until the retry fires.
        delay: Duration,
    },
    /// A retry is already pending; nothing changed.
    AlreadyPending,
    /// The budget is spent; nothing will be scheduled until a reset.
    Exhausted,
}

/// Schedules at most one pending retry at a time.
#[derive(Debug)]
pub struct RetryScheduler {
    config: RetryConfig,
    attempt: u32,
    current_delay: Duration,
    pending: Option<TimerId>,
}

impl RetryScheduler {
    /// Create a scheduler in its reset state.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempt: 0,
            current_delay: config.initial_delay,
            pending: None,
        }
    }

    /// Arm a retry timer using the current delay, then double the delay
    /// (capped at `max_delay`) for the next one.
    pub fn schedule(&mut self, timers: &mut dyn Timers) -> RetryOutcome {
        if self.pending.is_some() {
            debug!("Retry already pending, ignoring schedule request");
            return RetryOutcome::AlreadyPending;
        }

        if self.attempt >= self.config.max_attempts {
            info!(
                "Maximum retry count ({}) reached, not retrying",
                self.config.max_attempts
            );
            return RetryOutcome::Exhausted;
        }

        self.attempt += 1;
        let delay = self.current_delay;
        self.current_delay = next_delay(self.current_delay, self.config.max_delay);
        self.pending = Some(timers.schedule(delay));

        info!("Scheduled retry {} in {:?}", self.attempt, delay);
        RetryOutcome::Scheduled {
            attempt: self.attempt,
            delay,
        }
    }

    /// Claim a timer expiry. Returns `true` if it is the pending retry.
    pub fn take_fired(&mut self, id: TimerId) -> bool {
        if self.pending == Some(id) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    /// Cancel any pending retry and restore the initial delay and budget.
    pub fn reset(&mut self, timers: &mut dyn Timers) {
        if let Some(timer) = self.pending.take() {
            timers.cancel(timer);
        }
        self.attempt = 0;
        self.current_delay = self.config.initial_delay;
    }

    /// Current bookkeeping.
    pub fn state(&self) -> RetryState {
        RetryState {
            attempt: self.attempt,
            current_delay: self.current_delay,
            max_attempts: self.config.max_attempts,
            max_delay: self.config.max_delay,
            pending_timer: self.pending,
        }
    }
}

/// Double `delay`, capped at `max`.
pub fn next_delay(delay: Duration, max: Duration) -> Duration {
    delay.saturating_mul(2).min(max)
}
