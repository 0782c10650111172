use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::SharedState;

/// GET /api/health
pub async fn health_check(State(state): State<SharedState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();

    Json(json!({
        "status": "healthy",
        "uptime_secs": uptime,
        "instance_id": state.limiter.instance_id(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}
