//! Folds the increments published by the serving processes into the durable
//! counter store.
//!
//! The aggregator consumes one partition batch at a time, sums every valid
//! increment per (entity, window) key and issues exactly one store increment
//! per distinct key. A batch is acknowledged only when every increment
//! succeeded; otherwise it is handed back and delivered again, which may apply
//! some increments twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use windowgate_common::{
    AggregationMessage, GateError, GateResult, RateLimitKey, StreamMessage, MAX_COUNT,
};
use windowgate_store::{Batch, CounterStore, StreamConsumer};

/// Outcome of processing a single batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BatchReport {
    /// Increments found in the batch, valid or not.
    pub messages: usize,
    /// Increments that could not be parsed and were ignored.
    pub skipped: usize,
    /// Distinct keys written to the store.
    pub keys: usize,
    /// Sum of all applied counts.
    pub applied: u64,
}

#[derive(Debug, Default)]
pub struct AggregatorStats {
    batches: AtomicU64,
    failed_batches: AtomicU64,
    messages: AtomicU64,
    skipped: AtomicU64,
    applied: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AggregatorStatsSnapshot {
    pub batches: u64,
    pub failed_batches: u64,
    pub messages: u64,
    pub skipped: u64,
    pub applied: u64,
}

impl AggregatorStats {
    fn record(&self, report: &BatchReport) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.messages.fetch_add(report.messages as u64, Ordering::Relaxed);
        self.skipped.fetch_add(report.skipped as u64, Ordering::Relaxed);
        self.applied.fetch_add(report.applied, Ordering::Relaxed);
    }

    fn failed(&self) {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AggregatorStatsSnapshot {
        AggregatorStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
        }
    }
}

/// Fold one increment into the per-key sums. An increment that would push a
/// key past what the store accepts is rejected and the sum left unchanged.
fn add_increment(sums: &mut HashMap<RateLimitKey, u64>, msg: AggregationMessage) -> GateResult<()> {
    let sum = sums.entry(msg.key()).or_insert(0);
    match sum.checked_add(msg.count).filter(|n| *n <= MAX_COUNT) {
        Some(total) => {
            *sum = total;
            Ok(())
        }
        None => Err(GateError::MessageParse(format!(
            "count {} overflows the running total {} for {}",
            msg.count,
            sum,
            msg.key()
        ))),
    }
}

pub struct StreamAggregator {
    store: Arc<dyn CounterStore>,
    consumer: Arc<dyn StreamConsumer>,
    poll_interval: Duration,
    stats: AggregatorStats,
}

impl StreamAggregator {
    pub fn new(
        store: Arc<dyn CounterStore>,
        consumer: Arc<dyn StreamConsumer>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            consumer,
            poll_interval,
            stats: AggregatorStats::default(),
        }
    }

    pub fn stats(&self) -> AggregatorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Apply one batch to the counter store.
    ///
    /// Malformed messages are skipped. Fails with
    /// [`GateError::AggregatorWrite`] if any key could not be incremented.
    pub async fn process_batch(&self, batch: &Batch) -> GateResult<BatchReport> {
        let mut report = BatchReport::default();
        let mut sums: HashMap<RateLimitKey, u64> = HashMap::new();

        for delivered in &batch.messages {
            let increments = match StreamMessage::decode(&delivered.payload) {
                Ok(message) => message.into_increments(),
                Err(e) => vec![Err(e)],
            };

            for increment in increments {
                report.messages += 1;
                match increment.and_then(|msg| add_increment(&mut sums, msg)) {
                    Ok(()) => {}
                    Err(e) => {
                        report.skipped += 1;
                        warn!(
                            partition = batch.partition,
                            sequence = %delivered.sequence,
                            error = %e,
                            "skipping malformed aggregation message"
                        );
                    }
                }
            }
        }

        let writes = sums.iter().map(|(key, count)| async move {
            self.store
                .increment(key, *count)
                .await
                .map_err(|e| GateError::AggregatorWrite {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
        });

        for result in join_all(writes).await {
            result?;
        }

        report.keys = sums.len();
        report.applied = sums.values().fold(0u64, |acc, n| acc.saturating_add(*n));

        debug!(
            partition = batch.partition,
            first_offset = %batch.first_offset,
            last_offset = %batch.last_offset,
            messages = report.messages,
            skipped = report.skipped,
            keys = report.keys,
            applied = report.applied,
            "batch applied"
        );
        Ok(report)
    }

    /// Fetch, process and settle a single batch. Returns `Ok(None)` when the
    /// transport had nothing to deliver.
    pub async fn poll_once(&self) -> GateResult<Option<BatchReport>> {
        let Some(batch) = self.consumer.next_batch().await? else {
            return Ok(None);
        };

        match self.process_batch(&batch).await {
            Ok(report) => {
                self.consumer.ack(&batch).await?;
                self.stats.record(&report);
                Ok(Some(report))
            }
            Err(e) => {
                self.stats.failed();
                error!(
                    partition = batch.partition,
                    first_offset = %batch.first_offset,
                    last_offset = %batch.last_offset,
                    error = %e,
                    "batch failed, returning it for redelivery"
                );
                self.consumer.nack(&batch).await?;
                Err(e)
            }
        }
    }

    /// Keep draining the transport until `shutdown` flips to `true` or its
    /// sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "aggregator started");

        loop {
            let stop = *shutdown.borrow();
            if stop {
                break;
            }

            let idle = match self.poll_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    warn!(error = %e, "aggregation poll failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!("aggregator stopped");
    }
}
