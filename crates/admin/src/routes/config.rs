use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::state::SharedState;

/// GET /api/config
///
/// Returns the configuration the process was started with.
pub async fn get_config(State(state): State<SharedState>) -> impl IntoResponse {
    Json(serde_json::to_value(&state.config).unwrap_or(json!({"error": "serialization failed"})))
}
