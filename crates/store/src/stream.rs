//! Partitioned, ordered, at-least-once log between the serving processes and
//! the aggregator.
//!
//! Producers publish [`StreamRecord`]s; each record lands on the partition
//! selected by hashing its partition key. Consumers receive [`Batch`]es that
//! hold consecutive messages from a single partition, in publish order. A
//! batch that is not acknowledged is delivered again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use windowgate_common::{GateError, GateResult};

/// A record handed to the transport by a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub partition_key: String,
    pub payload: Vec<u8>,
}

/// A record as seen by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub sequence: String,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Consecutive messages from one partition.
#[derive(Debug, Clone)]
pub struct Batch {
    pub partition: u32,
    pub first_offset: String,
    pub last_offset: String,
    pub messages: Vec<DeliveredMessage>,
}

impl Batch {
    fn from_messages(partition: u32, messages: Vec<DeliveredMessage>) -> Option<Self> {
        let first_offset = messages.first()?.sequence.clone();
        let last_offset = messages.last()?.sequence.clone();
        Some(Self {
            partition,
            first_offset,
            last_offset,
            messages,
        })
    }
}

#[async_trait]
pub trait StreamPublisher: Send + Sync {
    /// Publish all records; the call fails as a whole if the transport rejects it.
    async fn publish(&self, records: Vec<StreamRecord>) -> GateResult<()>;
}

/// Consumption side of the transport.
///
/// A consumer works on one batch at a time: every batch returned by
/// [`next_batch`](StreamConsumer::next_batch) must be settled with
/// [`ack`](StreamConsumer::ack) or [`nack`](StreamConsumer::nack) before the
/// next call.
#[async_trait]
pub trait StreamConsumer: Send + Sync {
    /// Fetch the next available batch, or `None` when every partition is drained.
    async fn next_batch(&self) -> GateResult<Option<Batch>>;

    /// Mark the batch as processed so it is never delivered again.
    async fn ack(&self, batch: &Batch) -> GateResult<()>;

    /// Give the batch back for redelivery.
    async fn nack(&self, batch: &Batch) -> GateResult<()>;
}

/// Map a partition key onto one of `partitions` partitions.
///
/// The mapping only depends on the key bytes, so every process agrees on it.
pub fn partition_for(partition_key: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(partition_key.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix % partitions.max(1)
}

struct PartitionLog {
    entries: VecDeque<DeliveredMessage>,
    next_seq: u64,
    in_flight: bool,
}

/// In-process stream with the same delivery guarantees as the Redis one.
pub struct MemoryStream {
    partitions: Vec<Mutex<PartitionLog>>,
    batch_size: usize,
    cursor: AtomicUsize,
}

impl MemoryStream {
    pub fn new(partitions: u32, batch_size: usize) -> Self {
        let partitions = (0..partitions.max(1))
            .map(|_| {
                Mutex::new(PartitionLog {
                    entries: VecDeque::new(),
                    next_seq: 0,
                    in_flight: false,
                })
            })
            .collect();
        Self {
            partitions,
            batch_size: batch_size.max(1),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Messages published but not yet acknowledged, across all partitions.
    pub fn pending(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| p.lock().expect("stream partition lock poisoned").entries.len())
            .sum()
    }

    fn partition(&self, index: u32) -> GateResult<&Mutex<PartitionLog>> {
        self.partitions
            .get(index as usize)
            .ok_or_else(|| GateError::Transport(format!("unknown partition {}", index)))
    }
}

#[async_trait]
impl StreamPublisher for MemoryStream {
    async fn publish(&self, records: Vec<StreamRecord>) -> GateResult<()> {
        let count = self.partitions.len() as u32;
        for record in records {
            let index = partition_for(&record.partition_key, count);
            let mut log = self.partition(index)?.lock().expect("stream partition lock poisoned");
            let sequence = format!("{:020}", log.next_seq);
            log.next_seq += 1;
            log.entries.push_back(DeliveredMessage {
                sequence,
                payload: record.payload,
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StreamConsumer for MemoryStream {
    async fn next_batch(&self) -> GateResult<Option<Batch>> {
        let count = self.partitions.len();
        for _ in 0..count {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
            let mut log = self.partitions[index]
                .lock()
                .expect("stream partition lock poisoned");
            if log.in_flight || log.entries.is_empty() {
                continue;
            }
            let messages: Vec<DeliveredMessage> =
                log.entries.iter().take(self.batch_size).cloned().collect();
            if let Some(batch) = Batch::from_messages(index as u32, messages) {
                log.in_flight = true;
                return Ok(Some(batch));
            }
        }
        Ok(None)
    }

    async fn ack(&self, batch: &Batch) -> GateResult<()> {
        let mut log = self.partition(batch.partition)?.lock().expect("stream partition lock poisoned");
        while log
            .entries
            .front()
            .is_some_and(|m| m.sequence <= batch.last_offset)
        {
            log.entries.pop_front();
        }
        log.in_flight = false;
        Ok(())
    }

    async fn nack(&self, batch: &Batch) -> GateResult<()> {
        let mut log = self.partition(batch.partition)?.lock().expect("stream partition lock poisoned");
        log.in_flight = false;
        Ok(())
    }
}

/// Producer side of the Redis Streams transport: one stream per partition.
#[derive(Clone)]
pub struct RedisStream {
    conn: MultiplexedConnection,
    prefix: String,
    partitions: u32,
}

impl RedisStream {
    pub async fn connect(url: &str, prefix: &str, partitions: u32) -> GateResult<Self> {
        let client = redis::Client::open(url).map_err(transport_err)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(transport_err)?;
        tracing::info!(url, prefix, partitions, "connected redis stream transport");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            partitions: partitions.max(1),
        })
    }

    fn stream_key(&self, partition: u32) -> String {
        format!("{}:{}", self.prefix, partition)
    }

    /// Build a consumer that reads this transport's partitions as `consumer`
    /// within `group`, creating the group where it does not exist yet.
    ///
    /// * `claim_idle` - how long an entry may sit unacknowledged in another
    ///   consumer's pending list before this consumer takes it over
    pub async fn consumer(
        &self,
        group: &str,
        consumer: &str,
        batch_size: usize,
        claim_idle: Duration,
    ) -> GateResult<RedisStreamConsumer> {
        let mut conn = self.conn.clone();
        for partition in 0..self.partitions {
            let stream = self.stream_key(partition);
            let created: redis::RedisResult<()> =
                conn.xgroup_create_mkstream(&stream, group, "0").await;
            match created {
                Ok(()) => tracing::info!(stream = %stream, group, "created consumer group"),
                Err(e) if e.code() == Some("BUSYGROUP") => {}
                Err(e) => return Err(transport_err(e)),
            }
        }
        Ok(RedisStreamConsumer {
            stream: self.clone(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            batch_size: batch_size.max(1),
            claim_idle_ms: claim_idle.as_millis() as u64,
            cursor: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl StreamPublisher for RedisStream {
    async fn publish(&self, records: Vec<StreamRecord>) -> GateResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for record in &records {
            let stream = self.stream_key(partition_for(&record.partition_key, self.partitions));
            pipe.xadd(&stream, "*", &[("payload", record.payload.as_slice())])
                .ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(transport_err)?;
        Ok(())
    }
}

/// Consumer-group reader over a [`RedisStream`].
///
/// Unacknowledged entries stay in the group's pending list. Each partition is
/// read in this order:
///
/// 1. this consumer's own pending entries (id `0`)
/// 2. entries idle for `claim_idle` in any consumer's pending list, taken
///    over with `XAUTOCLAIM`, so entries of a consumer that died are not lost
/// 3. new entries (id `>`)
pub struct RedisStreamConsumer {
    stream: RedisStream,
    group: String,
    consumer: String,
    batch_size: usize,
    claim_idle_ms: u64,
    cursor: AtomicU32,
}

fn delivered(entry: StreamId) -> DeliveredMessage {
    // Entries trimmed from the stream come back without fields.
    let payload: Vec<u8> = entry.get("payload").unwrap_or_default();
    let timestamp = entry
        .id
        .split('-')
        .next()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);
    DeliveredMessage {
        sequence: entry.id,
        payload,
        timestamp,
    }
}

impl RedisStreamConsumer {
    async fn read(&self, stream: &str, id: &str) -> GateResult<Vec<DeliveredMessage>> {
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(self.batch_size);
        let mut conn = self.stream.conn.clone();
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[id], &opts)
            .await
            .map_err(transport_err)?;

        Ok(reply
            .keys
            .into_iter()
            .flat_map(|k| k.ids)
            .map(delivered)
            .collect())
    }

    /// Take over entries that have been pending too long in other consumers.
    async fn claim_idle(&self, stream: &str) -> GateResult<Vec<DeliveredMessage>> {
        let opts = StreamAutoClaimOptions::default().count(self.batch_size);
        let mut conn = self.stream.conn.clone();
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                stream,
                &self.group,
                &self.consumer,
                self.claim_idle_ms,
                "0-0",
                opts,
            )
            .await
            .map_err(transport_err)?;

        if !reply.claimed.is_empty() {
            tracing::info!(
                stream,
                consumer = %self.consumer,
                claimed = reply.claimed.len(),
                "claimed idle entries from another consumer"
            );
        }
        Ok(reply.claimed.into_iter().map(delivered).collect())
    }
}

#[async_trait]
impl StreamConsumer for RedisStreamConsumer {
    async fn next_batch(&self) -> GateResult<Option<Batch>> {
        let partitions = self.stream.partitions;
        for _ in 0..partitions {
            let partition = self.cursor.fetch_add(1, Ordering::Relaxed) % partitions;
            let stream = self.stream.stream_key(partition);

            let mut messages = self.read(&stream, "0").await?;
            if messages.is_empty() {
                messages = self.claim_idle(&stream).await?;
            }
            if messages.is_empty() {
                messages = self.read(&stream, ">").await?;
            }
            if let Some(batch) = Batch::from_messages(partition, messages) {
                return Ok(Some(batch));
            }
        }
        Ok(None)
    }

    async fn ack(&self, batch: &Batch) -> GateResult<()> {
        let stream = self.stream.stream_key(batch.partition);
        let ids: Vec<&str> = batch.messages.iter().map(|m| m.sequence.as_str()).collect();
        let mut conn = self.stream.conn.clone();
        let _: () = conn
            .xack(&stream, &self.group, ids.as_slice())
            .await
            .map_err(transport_err)?;
        Ok(())
    }

    async fn nack(&self, batch: &Batch) -> GateResult<()> {
        tracing::debug!(
            partition = batch.partition,
            first = %batch.first_offset,
            last = %batch.last_offset,
            "leaving batch pending for redelivery"
        );
        Ok(())
    }
}

fn transport_err(e: redis::RedisError) -> GateError {
    GateError::Transport(e.to_string())
}
