use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Running totals kept by a [`RateLimiter`](crate::RateLimiter).
#[derive(Debug, Default)]
pub struct LimiterStats {
    admitted: AtomicU64,
    rejected: AtomicU64,
    unauthenticated: AtomicU64,
    cache_refreshes: AtomicU64,
    store_read_failures: AtomicU64,
    flushes: AtomicU64,
    records_published: AtomicU64,
    publish_failures: AtomicU64,
    dropped_increments: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub admitted: u64,
    pub rejected: u64,
    pub unauthenticated: u64,
    pub cache_refreshes: u64,
    pub store_read_failures: u64,
    pub flushes: u64,
    pub records_published: u64,
    pub publish_failures: u64,
    pub dropped_increments: u64,
}

impl LimiterStats {
    pub(crate) fn admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unauthenticated(&self) {
        self.unauthenticated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cache_refresh(&self, failed: bool) {
        self.cache_refreshes.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.store_read_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn flushed(&self, records: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.records_published.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub(crate) fn flush_failed(&self, increments: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
        self.dropped_increments.fetch_add(increments, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            unauthenticated: self.unauthenticated.load(Ordering::Relaxed),
            cache_refreshes: self.cache_refreshes.load(Ordering::Relaxed),
            store_read_failures: self.store_read_failures.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            records_published: self.records_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            dropped_increments: self.dropped_increments.load(Ordering::Relaxed),
        }
    }
}
