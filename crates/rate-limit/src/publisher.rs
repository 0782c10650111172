use std::sync::Arc;

use windowgate_common::{AggregationMessage, GateResult, PublishMode, StreamMessage};
use windowgate_store::{StreamPublisher, StreamRecord};

use crate::buffer::Snapshot;

/// Turns drained snapshots into stream records and hands them to the transport.
pub struct FlushPublisher {
    stream: Arc<dyn StreamPublisher>,
    mode: PublishMode,
    instance_id: String,
}

impl FlushPublisher {
    pub fn new(stream: Arc<dyn StreamPublisher>, mode: PublishMode, instance_id: String) -> Self {
        Self {
            stream,
            mode,
            instance_id,
        }
    }

    /// Encode a snapshot. Keys are emitted in sorted order.
    pub fn records(&self, snapshot: Snapshot, now: i64) -> GateResult<Vec<StreamRecord>> {
        let mut entries: Vec<_> = snapshot.into_iter().collect();
        entries.sort();

        let messages: Vec<AggregationMessage> = entries
            .into_iter()
            .map(|(key, count)| AggregationMessage {
                entity_id: key.entity_id,
                window_identifier: key.window_identifier,
                count,
                timestamp: now,
            })
            .collect();

        match self.mode {
            PublishMode::PerKey => messages
                .into_iter()
                .map(|msg| -> GateResult<StreamRecord> {
                    let partition_key = msg.entity_id.clone();
                    Ok(StreamRecord {
                        partition_key,
                        payload: StreamMessage::RequestCount(msg).encode()?,
                    })
                })
                .collect(),
            PublishMode::Batched => Ok(vec![StreamRecord {
                partition_key: self.instance_id.clone(),
                payload: StreamMessage::batch(now, &messages).encode()?,
            }]),
        }
    }

    /// Publish a snapshot, returning the number of records sent.
    pub async fn publish(&self, snapshot: Snapshot, now: i64) -> GateResult<usize> {
        let records = self.records(snapshot, now)?;
        let sent = records.len();
        self.stream.publish(records).await?;
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use windowgate_common::RateLimitKey;
    use windowgate_store::MemoryStream;

    fn snapshot() -> Snapshot {
        let mut snapshot = Snapshot::new();
        snapshot.insert(RateLimitKey::new("bob", "w"), 1);
        snapshot.insert(RateLimitKey::new("alice", "w"), 3);
        snapshot
    }

    fn publisher(mode: PublishMode) -> FlushPublisher {
        FlushPublisher::new(Arc::new(MemoryStream::new(1, 10)), mode, "instance-1".into())
    }

    #[test]
    fn per_key_records_are_partitioned_by_entity() {
        let records = publisher(PublishMode::PerKey).records(snapshot(), 42).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].partition_key, "alice");
        assert_eq!(records[1].partition_key, "bob");

        let first = StreamMessage::decode(&records[0].payload).unwrap();
        assert_eq!(
            first,
            StreamMessage::RequestCount(AggregationMessage {
                entity_id: "alice".into(),
                window_identifier: "w".into(),
                count: 3,
                timestamp: 42,
            })
        );
    }

    #[test]
    fn batched_mode_emits_single_record() {
        let records = publisher(PublishMode::Batched).records(snapshot(), 42).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].partition_key, "instance-1");

        let increments = StreamMessage::decode(&records[0].payload)
            .unwrap()
            .into_increments();
        let total: u64 = increments.into_iter().map(|r| r.unwrap().count).sum();
        assert_eq!(total, 4);
    }

    #[tokio::test]
    async fn publish_reaches_stream() {
        let stream = Arc::new(MemoryStream::new(2, 10));
        let publisher = FlushPublisher::new(stream.clone(), PublishMode::PerKey, "i".into());

        let sent = publisher.publish(snapshot(), 42).await.unwrap();

        assert_eq!(sent, 2);
        assert_eq!(stream.pending(), 2);
    }
}
