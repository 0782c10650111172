//! Approximate, cooperative rate limiting over fixed time windows.
//!
//! Every serving process owns one [`RateLimiter`]. A request is admitted when
//!
//! ```text
//! cached aggregate + locally pending + 1 <= limit
//! ```
//!
//! where the cached aggregate is the durable count for the caller's
//! (entity, window) key as last read from the [`CounterStore`], and the
//! pending count is what this process has admitted but not yet flushed.
//! Admitted requests accumulate in a [`PendingWriteBuffer`] that is drained
//! opportunistically and published to the aggregation stream; a separate
//! aggregator folds those increments into the counter store, where other
//! processes pick them up on their next cache refresh.
//!
//! Processes never coordinate. With `N` processes each refreshing every
//! `cache_invalidation_secs`, up to `N * limit` requests may be admitted for
//! one key before the processes converge, an overshoot of `(N - 1) * limit`.
//! Fixed windows also allow a burst of up to twice the limit across a window
//! boundary.
//!
//! Failure handling favours availability: a failed or timed-out store read
//! is treated as an empty window, and a failed or timed-out publish drops the
//! drained snapshot. Both calls are bounded, so every request resolves.

pub mod buffer;
pub mod cache;
pub mod classifier;
pub mod clock;
pub mod decision;
pub mod flush;
pub mod publisher;
pub mod stats;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use windowgate_common::{RateLimitConfig, RateLimitKey};
use windowgate_store::{CounterStore, StreamPublisher};

pub use buffer::{PendingWriteBuffer, Snapshot};
pub use cache::{CacheEntry, LocalAggregateCache};
pub use classifier::{classify, entity_id, parse_bearer, Classification, FixedWindow};
pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{Decision, RateLimitInfo};
pub use flush::{FlushPolicy, FlushScheduler, IntervalOrSize};
pub use publisher::FlushPublisher;
pub use stats::{LimiterStats, StatsSnapshot};

/// Result of one flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    /// Distinct keys drained from the buffer.
    pub keys: usize,
    /// Sum of the drained counts.
    pub increments: u64,
    /// Whether the transport accepted the records.
    pub published: bool,
}

/// Per-process rate limiter.
///
/// Cheaply cloneable (backed by `Arc`); clones share cache, buffer and
/// flush state. Independent instances share nothing but the stores they are
/// given.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    limit: u64,
    window: FixedWindow,
    store_timeout: Option<Duration>,
    publish_timeout: Option<Duration>,
    cache: LocalAggregateCache,
    buffer: PendingWriteBuffer,
    scheduler: FlushScheduler,
    publisher: FlushPublisher,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    stats: LimiterStats,
    instance_id: String,
}

impl RateLimiter {
    /// Create a limiter driven by the system clock.
    pub fn new(
        config: &RateLimitConfig,
        store: Arc<dyn CounterStore>,
        stream: Arc<dyn StreamPublisher>,
    ) -> Self {
        Self::with_clock(config, store, stream, Arc::new(SystemClock))
    }

    /// Create a limiter with an explicit time source.
    pub fn with_clock(
        config: &RateLimitConfig,
        store: Arc<dyn CounterStore>,
        stream: Arc<dyn StreamPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let policy = IntervalOrSize::new(config.flush.interval_secs, config.flush.max_batch_keys);
        Self::with_policy(config, store, stream, clock, Box::new(policy))
    }

    /// Create a limiter with a custom flush policy.
    pub fn with_policy(
        config: &RateLimitConfig,
        store: Arc<dyn CounterStore>,
        stream: Arc<dyn StreamPublisher>,
        clock: Arc<dyn Clock>,
        policy: Box<dyn FlushPolicy>,
    ) -> Self {
        let instance_id = uuid::Uuid::new_v4().to_string();
        let started_at = clock.unix_secs();

        info!(
            instance_id = %instance_id,
            window_secs = config.window_secs,
            max_requests = config.max_requests,
            cache_invalidation_secs = config.cache_invalidation_secs,
            flush_interval_secs = config.flush.interval_secs,
            max_batch_keys = config.flush.max_batch_keys,
            "creating fixed window rate limiter"
        );

        Self {
            inner: Arc::new(Inner {
                limit: config.max_requests,
                window: FixedWindow::new(config.window_secs),
                store_timeout: (config.store_timeout_ms > 0)
                    .then(|| Duration::from_millis(config.store_timeout_ms)),
                publish_timeout: (config.flush.publish_timeout_ms > 0)
                    .then(|| Duration::from_millis(config.flush.publish_timeout_ms)),
                cache: LocalAggregateCache::new(config.cache_invalidation_secs),
                buffer: PendingWriteBuffer::new(),
                scheduler: FlushScheduler::new(policy, started_at),
                publisher: FlushPublisher::new(stream, config.publish_mode, instance_id.clone()),
                store,
                clock,
                stats: LimiterStats::default(),
                instance_id,
            }),
        }
    }

    pub fn limit(&self) -> u64 {
        self.inner.limit
    }

    pub fn window(&self) -> FixedWindow {
        self.inner.window
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Locally pending (unflushed) count for `key`.
    pub fn pending(&self, key: &RateLimitKey) -> u64 {
        self.inner.buffer.pending(key)
    }

    /// Distinct keys waiting for the next flush.
    pub fn buffered_keys(&self) -> usize {
        self.inner.buffer.len()
    }

    pub fn cache_entry(&self, key: &RateLimitKey) -> Option<CacheEntry> {
        self.inner.cache.get(key)
    }

    /// Key the limiter would use for `token` right now, if it is a credential.
    pub fn key_for(&self, token: Option<&str>) -> Option<RateLimitKey> {
        match classify(token) {
            Classification::Unauthenticated => None,
            Classification::Entity(id) => {
                let now = self.inner.clock.unix_secs();
                Some(RateLimitKey::new(id, self.inner.window.identifier(now)))
            }
        }
    }

    /// Decide one request carrying the bearer token `token`.
    ///
    /// Before deciding, the pending buffer is flushed if the flush policy
    /// says so. The returned decision is final; nothing is queued or retried.
    pub async fn check(&self, token: Option<&str>) -> Decision {
        self.flush_if_needed().await;

        let entity_id = match classify(token) {
            Classification::Unauthenticated => {
                debug!("no credential, skipping rate limit");
                self.inner.stats.unauthenticated();
                return Decision::Unlimited;
            }
            Classification::Entity(id) => id,
        };

        let inner = &self.inner;
        let now = inner.clock.unix_secs();
        let key = RateLimitKey::new(entity_id, inner.window.identifier(now));
        let cached = self.cached_count(&key, now).await;

        let mut pending = 0;
        let admitted = inner.buffer.increment_if(&key, |buffered| {
            pending = buffered;
            decision::within_limit(inner.limit, cached, buffered)
        });

        let total = cached.saturating_add(pending).saturating_add(1);
        let info = RateLimitInfo::new(inner.limit, total, now, &inner.window);

        if admitted {
            inner.stats.admitted();
            debug!(key = %key, cached, pending, remaining = info.remaining, "request admitted");
            Decision::Admitted(info)
        } else {
            inner.stats.rejected();
            info!(key = %key, cached, pending, limit = inner.limit, "rate limit exceeded");
            Decision::Rejected(info)
        }
    }

    /// Cached aggregate for `key`, refreshed from the counter store when
    /// missing or older than the invalidation interval.
    async fn cached_count(&self, key: &RateLimitKey, now: i64) -> u64 {
        let inner = &self.inner;
        if let Some(entry) = inner.cache.fresh(key, now) {
            return entry.count;
        }

        let read = match inner.store_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, inner.store.get(key)).await {
                Ok(result) => result,
                Err(_) => Err(windowgate_common::GateError::Store(format!(
                    "read timed out after {:?}",
                    timeout
                ))),
            },
            None => inner.store.get(key).await,
        };

        let count = match read {
            Ok(count) => {
                inner.stats.cache_refresh(false);
                debug!(key = %key, count, "refreshed aggregate from counter store");
                count
            }
            Err(e) => {
                inner.stats.cache_refresh(true);
                warn!(key = %key, error = %e, "counter store read failed, assuming empty window");
                0
            }
        };

        inner.cache.set(key.clone(), count, now);
        count
    }

    /// Flush the pending buffer if the flush policy asks for it.
    pub async fn flush_if_needed(&self) -> Option<FlushReport> {
        let now = self.inner.clock.unix_secs();
        let snapshot = self.inner.scheduler.poll(now, &self.inner.buffer)?;
        Some(self.publish_snapshot(snapshot, now).await)
    }

    /// Flush whatever is pending, ignoring the policy. Used on shutdown.
    pub async fn shutdown_flush(&self) -> Option<FlushReport> {
        let now = self.inner.clock.unix_secs();
        let snapshot = self.inner.scheduler.force(now, &self.inner.buffer)?;
        Some(self.publish_snapshot(snapshot, now).await)
    }

    async fn publish_snapshot(&self, snapshot: Snapshot, now: i64) -> FlushReport {
        let inner = &self.inner;
        let keys = snapshot.len();
        let increments: u64 = snapshot.values().sum();

        for (key, count) in &snapshot {
            inner.cache.absorb(key, *count);
        }

        info!(keys, increments, "flushing pending increments");

        let published = match inner.publish_timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, inner.publisher.publish(snapshot, now)).await {
                    Ok(result) => result,
                    Err(_) => Err(windowgate_common::GateError::Transport(format!(
                        "publish timed out after {:?}",
                        timeout
                    ))),
                }
            }
            None => inner.publisher.publish(snapshot, now).await,
        };

        match published {
            Ok(records) => {
                inner.stats.flushed(records);
                debug!(records, "pending increments published");
                FlushReport {
                    keys,
                    increments,
                    published: true,
                }
            }
            Err(e) => {
                inner.stats.flush_failed(increments);
                error!(
                    error = %e,
                    keys,
                    increments,
                    "failed to publish pending increments, dropping snapshot"
                );
                FlushReport {
                    keys,
                    increments,
                    published: false,
                }
            }
        }
    }

    /// Spawn a background thread that periodically evicts cache entries from
    /// windows that have already ended.
    pub fn start_cleanup_task(&self, interval: Duration) -> std::io::Result<()> {
        let inner = Arc::clone(&self.inner);

        std::thread::Builder::new()
            .name("rate-limit-cleanup".into())
            .spawn(move || loop {
                std::thread::sleep(interval);

                let now = inner.clock.unix_secs();
                inner.cache.evict_before(&inner.window.identifier(now));

                tracing::trace!("rate limiter cleanup tick completed");
            })?;
        Ok(())
    }

    /// Spawn a Tokio task that evaluates the flush policy every `period`, so
    /// an idle process still drains its buffer.
    pub fn spawn_flush_ticker(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        info!(period_ms = period.as_millis() as u64, "starting background flush ticker");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                limiter.flush_if_needed().await;
            }
        })
    }
}
