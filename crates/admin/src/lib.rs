//! Operator-facing HTTP API: health, Prometheus metrics, limiter statistics
//! and the running configuration.

pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use windowgate_common::AppConfig;
use windowgate_rate_limit::RateLimiter;

pub use state::{AppState, GateMetrics, SharedState};

/// Build the Axum router with all admin API routes and middleware.
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(routes::health::health_check))
        .route("/api/metrics", get(routes::metrics::get_metrics))
        .route("/api/config", get(routes::config::get_config))
        .route("/api/stats", get(routes::stats::get_stats))
        .with_state(state)
        .layer(cors)
}

/// Start the admin API server on the specified address.
///
/// This function will block until the server is shut down.
pub async fn run_admin_server(state: SharedState, listen_addr: &str) -> anyhow::Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(addr = %listen_addr, "admin API server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Convenience function to create a SharedState from an AppConfig and limiter.
pub fn new_shared_state(config: AppConfig, limiter: RateLimiter) -> SharedState {
    Arc::new(AppState::new(config, limiter))
}
