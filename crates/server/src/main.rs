use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};
use windowgate_admin::AppState;
use windowgate_common::{AppConfig, FlushTrigger};
use windowgate_rate_limit::RateLimiter;
use windowgate_server::{build_app, Backend};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/windowgate.yaml".to_string());

    info!(config_path = %config_path, "starting windowgate");

    let config = AppConfig::load(&config_path)?;
    let backend = Backend::from_config(&config).await?;

    let limiter = RateLimiter::new(&config.rate_limit, backend.store.clone(), backend.publisher.clone());
    limiter.start_cleanup_task(Duration::from_secs(config.rate_limit.cleanup_interval_secs))?;

    if config.rate_limit.flush.trigger == FlushTrigger::Background {
        limiter.spawn_flush_ticker(Duration::from_secs(config.rate_limit.flush.ticker_secs));
    }

    let mut state = AppState::new(config.clone(), limiter.clone());
    if let Some(aggregator) = backend.aggregator.clone() {
        state = state.with_aggregator(aggregator);
    }
    let state = Arc::new(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let aggregator_task = backend.aggregator.clone().map(|aggregator| {
        info!("running aggregator in-process");
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { aggregator.run(shutdown).await })
    });

    if config.server.admin.enabled {
        let admin_state = state.clone();
        let admin_listen = config.server.admin.listen.clone();
        tokio::spawn(async move {
            if let Err(e) = windowgate_admin::run_admin_server(admin_state, &admin_listen).await {
                error!(error = %e, "admin API server failed");
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    info!(
        addr = %config.server.listen,
        protected_prefix = %config.server.protected_prefix,
        "windowgate listening"
    );

    axum::serve(listener, build_app(state))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
            }
        })
        .await?;

    if let Some(report) = limiter.shutdown_flush().await {
        info!(
            keys = report.keys,
            increments = report.increments,
            published = report.published,
            "flushed pending increments on shutdown"
        );
    }

    let _ = shutdown_tx.send(true);
    if let Some(task) = aggregator_task {
        let _ = task.await;
    }

    info!("windowgate stopped");
    Ok(())
}
