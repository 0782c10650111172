//! When to move the pending buffer downstream.
//!
//! The scheduler itself has no timer. It is polled, by default from the
//! request path, and decides through a [`FlushPolicy`] whether the buffer
//! should be drained now. A background ticker can poll the same scheduler
//! without changing the decision logic.

use std::sync::Mutex;

use crate::buffer::{PendingWriteBuffer, Snapshot};

pub trait FlushPolicy: Send + Sync {
    /// * `now`           - current unix seconds
    /// * `last_flush_at` - unix seconds of the previous flush attempt
    /// * `buffered_keys` - distinct keys currently pending
    fn should_flush(&self, now: i64, last_flush_at: i64, buffered_keys: usize) -> bool;
}

/// Flush a non-empty buffer once `interval_secs` have passed since the last
/// attempt, or as soon as it holds `max_batch_keys` distinct keys.
#[derive(Debug, Clone, Copy)]
pub struct IntervalOrSize {
    pub interval_secs: i64,
    pub max_batch_keys: usize,
}

impl IntervalOrSize {
    pub fn new(interval_secs: u64, max_batch_keys: usize) -> Self {
        Self {
            interval_secs: interval_secs as i64,
            max_batch_keys,
        }
    }
}

impl FlushPolicy for IntervalOrSize {
    fn should_flush(&self, now: i64, last_flush_at: i64, buffered_keys: usize) -> bool {
        buffered_keys > 0
            && (now - last_flush_at >= self.interval_secs || buffered_keys >= self.max_batch_keys)
    }
}

pub struct FlushScheduler {
    policy: Box<dyn FlushPolicy>,
    last_flush_at: Mutex<i64>,
}

impl FlushScheduler {
    /// * `started_at` - unix seconds treated as the first "last flush"
    pub fn new(policy: Box<dyn FlushPolicy>, started_at: i64) -> Self {
        Self {
            policy,
            last_flush_at: Mutex::new(started_at),
        }
    }

    pub fn last_flush_at(&self) -> i64 {
        *self.last_flush_at.lock().expect("flush scheduler lock poisoned")
    }

    /// Drain `buffer` if the policy says so, recording `now` as the flush time.
    ///
    /// The scheduler lock is held while the buffer is inspected and drained,
    /// so two concurrent polls cannot both drain for the same interval.
    pub fn poll(&self, now: i64, buffer: &PendingWriteBuffer) -> Option<Snapshot> {
        let mut last = self.last_flush_at.lock().expect("flush scheduler lock poisoned");
        let snapshot =
            buffer.drain_if(|keys| self.policy.should_flush(now, *last, keys))?;
        *last = now;
        Some(snapshot)
    }

    /// Drain whatever is buffered regardless of the policy.
    pub fn force(&self, now: i64, buffer: &PendingWriteBuffer) -> Option<Snapshot> {
        let mut last = self.last_flush_at.lock().expect("flush scheduler lock poisoned");
        let snapshot = buffer.drain_if(|keys| keys > 0)?;
        *last = now;
        Some(snapshot)
    }
}
