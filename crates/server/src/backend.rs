use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use windowgate_aggregator::StreamAggregator;
use windowgate_common::{AppConfig, BackendKind, GateResult};
use windowgate_store::{
    CounterStore, MemoryCounterStore, MemoryStream, RedisCounterStore, RedisStream,
    StreamPublisher,
};

/// Counter store and transport the limiter is wired against.
pub struct Backend {
    pub store: Arc<dyn CounterStore>,
    pub publisher: Arc<dyn StreamPublisher>,
    /// Present in single-process mode, where the aggregator shares the
    /// in-memory transport and store with the limiter.
    pub aggregator: Option<Arc<StreamAggregator>>,
}

impl Backend {
    pub async fn from_config(config: &AppConfig) -> GateResult<Self> {
        let backend = &config.backend;
        match backend.kind {
            BackendKind::Memory => {
                info!(partitions = backend.partitions, "using in-memory backend");
                let store = Arc::new(MemoryCounterStore::new());
                let stream = Arc::new(MemoryStream::new(
                    backend.partitions,
                    config.aggregator.batch_size,
                ));
                let aggregator = StreamAggregator::new(
                    store.clone(),
                    stream.clone(),
                    Duration::from_millis(config.aggregator.poll_interval_ms),
                );
                Ok(Self {
                    store,
                    publisher: stream,
                    aggregator: Some(Arc::new(aggregator)),
                })
            }
            BackendKind::Redis => {
                let store = RedisCounterStore::connect(
                    &backend.redis_url,
                    &backend.counter_prefix,
                    backend.counter_ttl_secs,
                )
                .await?;
                let stream =
                    RedisStream::connect(&backend.redis_url, &backend.stream_prefix, backend.partitions)
                        .await?;
                Ok(Self {
                    store: Arc::new(store),
                    publisher: Arc::new(stream),
                    aggregator: None,
                })
            }
        }
    }
}
