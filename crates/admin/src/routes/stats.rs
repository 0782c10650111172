use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::SharedState;

/// GET /api/stats
///
/// Request counters from Prometheus next to the limiter's own flush and
/// store statistics, plus the in-process aggregator's totals when present.
pub async fn get_stats(State(state): State<SharedState>) -> Json<Value> {
    let uptime_secs = state.start_time.elapsed().as_secs();
    let total_requests = state.metrics.requests_total.get();

    let requests_per_second = if uptime_secs > 0 {
        total_requests as f64 / uptime_secs as f64
    } else {
        0.0
    };

    Json(json!({
        "total_requests": total_requests,
        "admitted_requests": state.metrics.requests_admitted.get(),
        "rejected_requests": state.metrics.requests_rejected.get(),
        "unauthenticated_requests": state.metrics.requests_unauthenticated.get(),
        "uptime_secs": uptime_secs,
        "requests_per_second": requests_per_second,
        "limit": state.limiter.limit(),
        "window_secs": state.limiter.window().secs(),
        "pending_keys": state.limiter.buffered_keys(),
        "limiter": state.limiter.stats(),
        "aggregator": state.aggregator.as_ref().map(|a| a.stats()),
    }))
}
