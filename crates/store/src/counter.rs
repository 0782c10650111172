use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use windowgate_common::{GateError, GateResult, RateLimitKey};

/// The durable source of truth for per-key request counts.
///
/// Rows are created lazily at zero on the first increment and are only ever
/// incremented. Reading a key that was never incremented yields zero.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add `delta` to the counter for `key`. A zero delta is a no-op.
    async fn increment(&self, key: &RateLimitKey, delta: u64) -> GateResult<()>;

    /// Read the current count for `key`.
    async fn get(&self, key: &RateLimitKey) -> GateResult<u64>;
}

/// Process-local counter store, used for single-process deployments and tests.
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: DashMap<RateLimitKey, u64>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows that have been created.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &RateLimitKey, delta: u64) -> GateResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let mut count = self.counters.entry(key.clone()).or_insert(0);
        *count = count.saturating_add(delta);
        Ok(())
    }

    async fn get(&self, key: &RateLimitKey) -> GateResult<u64> {
        Ok(self.counters.get(key).map(|c| *c).unwrap_or(0))
    }
}

/// Counter store backed by Redis string counters (`INCRBY` / `GET`).
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: MultiplexedConnection,
    prefix: String,
    ttl_secs: Option<u64>,
}

impl RedisCounterStore {
    pub async fn connect(url: &str, prefix: &str, ttl_secs: Option<u64>) -> GateResult<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_err)?;
        tracing::info!(url, prefix, ?ttl_secs, "connected redis counter store");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            ttl_secs,
        })
    }

    fn redis_key(&self, key: &RateLimitKey) -> String {
        format!("{}:{}:{}", self.prefix, key.entity_id, key.window_identifier)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &RateLimitKey, delta: u64) -> GateResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let redis_key = self.redis_key(key);

        match self.ttl_secs {
            Some(ttl) => {
                let _: () = redis::pipe()
                    .atomic()
                    .incr(&redis_key, delta)
                    .ignore()
                    .expire(&redis_key, ttl as i64)
                    .ignore()
                    .query_async(&mut conn)
                    .await
                    .map_err(store_err)?;
            }
            None => {
                let _: u64 = conn.incr(&redis_key, delta).await.map_err(store_err)?;
            }
        }
        Ok(())
    }

    async fn get(&self, key: &RateLimitKey) -> GateResult<u64> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = conn.get(self.redis_key(key)).await.map_err(store_err)?;
        Ok(value.unwrap_or(0))
    }
}

fn store_err(e: redis::RedisError) -> GateError {
    GateError::Store(e.to_string())
}
