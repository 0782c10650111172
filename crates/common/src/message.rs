//! Keys and wire records shared by the serving processes and the aggregator.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};

/// Largest count a single counter may hold; Redis counters are signed 64-bit.
pub const MAX_COUNT: u64 = i64::MAX as u64;

/// Identifies one durable counter: an entity within one fixed window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RateLimitKey {
    pub entity_id: String,
    pub window_identifier: String,
}

impl RateLimitKey {
    pub fn new(entity_id: impl Into<String>, window_identifier: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            window_identifier: window_identifier.into(),
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.entity_id, self.window_identifier)
    }
}

/// Count of requests admitted for one key by one process since its last flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationMessage {
    pub entity_id: String,
    pub window_identifier: String,
    pub count: u64,
    /// Unix seconds at which the flush happened.
    pub timestamp: i64,
}

impl AggregationMessage {
    pub fn key(&self) -> RateLimitKey {
        RateLimitKey::new(self.entity_id.clone(), self.window_identifier.clone())
    }

    fn validate(self) -> GateResult<Self> {
        if self.entity_id.is_empty() {
            return Err(GateError::MessageParse("empty entity_id".into()));
        }
        if self.window_identifier.is_empty() {
            return Err(GateError::MessageParse("empty window_identifier".into()));
        }
        if self.count > MAX_COUNT {
            return Err(GateError::MessageParse(format!(
                "count {} exceeds {}",
                self.count, MAX_COUNT
            )));
        }
        Ok(self)
    }
}

/// Envelope for everything published on the aggregation stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// A single key's increment.
    RequestCount(AggregationMessage),
    /// All keys of one flush in a single record.
    Batch(BatchPayload),
}

/// Entries are kept as raw JSON so that one bad entry does not poison its siblings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPayload {
    pub timestamp: i64,
    pub requests: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct BatchEntry {
    entity_id: String,
    window_identifier: String,
    count: u64,
}

impl StreamMessage {
    /// Build a `batch` envelope from a flushed snapshot.
    pub fn batch(timestamp: i64, messages: &[AggregationMessage]) -> Self {
        let requests = messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "entity_id": m.entity_id,
                    "window_identifier": m.window_identifier,
                    "count": m.count,
                })
            })
            .collect();
        StreamMessage::Batch(BatchPayload { timestamp, requests })
    }

    pub fn encode(&self) -> GateResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a raw stream payload. Fails for anything that is not a known envelope.
    pub fn decode(payload: &[u8]) -> GateResult<Self> {
        serde_json::from_slice(payload).map_err(|e| GateError::MessageParse(e.to_string()))
    }

    /// Flatten the envelope into individually validated increments.
    pub fn into_increments(self) -> Vec<GateResult<AggregationMessage>> {
        match self {
            StreamMessage::RequestCount(msg) => vec![msg.validate()],
            StreamMessage::Batch(batch) => {
                let timestamp = batch.timestamp;
                batch
                    .requests
                    .into_iter()
                    .map(|raw| {
                        let entry: BatchEntry = serde_json::from_value(raw)
                            .map_err(|e| GateError::MessageParse(e.to_string()))?;
                        AggregationMessage {
                            entity_id: entry.entity_id,
                            window_identifier: entry.window_identifier,
                            count: entry.count,
                            timestamp,
                        }
                        .validate()
                    })
                    .collect()
            }
        }
    }
}
