use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use windowgate_aggregator::StreamAggregator;
use windowgate_common::{AppConfig, BackendKind};
use windowgate_store::{RedisCounterStore, RedisStream};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/windowgate.yaml".to_string());

    info!(config_path = %config_path, "starting windowgate aggregator");

    let config = AppConfig::load(&config_path)?;
    if config.backend.kind != BackendKind::Redis {
        anyhow::bail!("the standalone aggregator requires backend.kind = redis");
    }

    let backend = &config.backend;
    let store = RedisCounterStore::connect(
        &backend.redis_url,
        &backend.counter_prefix,
        backend.counter_ttl_secs,
    )
    .await?;
    let stream =
        RedisStream::connect(&backend.redis_url, &backend.stream_prefix, backend.partitions).await?;

    let consumer_name = config
        .aggregator
        .consumer
        .clone()
        .unwrap_or_else(|| format!("aggregator-{}", uuid::Uuid::new_v4()));
    let consumer = stream
        .consumer(
            &config.aggregator.group,
            &consumer_name,
            config.aggregator.batch_size,
            Duration::from_millis(config.aggregator.claim_idle_ms),
        )
        .await?;

    let aggregator = StreamAggregator::new(
        Arc::new(store),
        Arc::new(consumer),
        Duration::from_millis(config.aggregator.poll_interval_ms),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
        let _ = shutdown_tx.send(true);
    });

    info!(consumer = %consumer_name, group = %config.aggregator.group, "aggregator ready");
    aggregator.run(shutdown_rx).await;
    info!(stats = ?aggregator.stats(), "aggregator exited");
    Ok(())
}
