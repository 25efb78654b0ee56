//! One-shot timers delivered through the event queue.
//!
//! The supervisor never sleeps. It asks a [`Timers`] implementation to fire
//! a [`TimerId`] later, and the expiry arrives as an ordinary queued event.
//! Ids are never reused, so an expiry for a cancelled or replaced timer is
//! recognised and ignored by whoever scheduled it.

use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::transport::{Event, EventQueue};

/// Identifier of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Scheduler of one-shot timers.
pub trait Timers: Send {
    /// Arrange for `Event::Timer(id)` to be delivered after `delay`.
    fn schedule(&mut self, delay: Duration) -> TimerId;

    /// Cancel a timer. Cancelling an expired or unknown timer is a no-op.
    fn cancel(&mut self, id: TimerId);
}

/// Timers backed by tokio tasks.
pub struct TokioTimers {
    queue: EventQueue,
    next_id: u64,
    pending: HashMap<TimerId, JoinHandle<()>>,
}

impl TokioTimers {
    /// Create timers posting to the given queue.
    pub fn new(queue: EventQueue) -> Self {
        Self {
            queue,
            next_id: 0,
            pending: HashMap::new(),
        }
    }

    /// Number of timers that have neither fired nor been cancelled.
    pub fn pending(&self) -> usize {
        self.pending.values().filter(|h| !h.is_finished()).count()
    }
}

impl Timers for TokioTimers {
    fn schedule(&mut self, delay: Duration) -> TimerId {
        self.pending.retain(|_, handle| !handle.is_finished());

        self.next_id += 1;
        let id = TimerId(self.next_id);
        let queue = self.queue.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.post(Event::Timer(id));
        });
        self.pending.insert(id, handle);

        id
    }

    fn cancel(&mut self, id: TimerId) {
        if let Some(handle) = self.pending.remove(&id) {
            handle.abort();
        }
    }
}

impl Drop for TokioTimers {
    fn drop(&mut self) {
        for (_, handle) in self.pending.drain() {
            handle.abort();
        }
    }
}
