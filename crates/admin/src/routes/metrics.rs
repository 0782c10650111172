use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use prometheus::{Encoder, TextEncoder};

use crate::state::SharedState;

/// GET /api/metrics
///
/// Prometheus text exposition of the gate's request metrics.
pub async fn get_metrics(State(state): State<SharedState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = state.metrics.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = %e, "failed to encode prometheus metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string())],
            format!("failed to encode metrics: {}", e),
        );
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        String::from_utf8(buffer).unwrap_or_default(),
    )
}
