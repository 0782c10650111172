//! The `windowgate` HTTP service: a demo API whose protected routes pass
//! through the fixed-window rate-limit middleware.

pub mod backend;
pub mod middleware;

use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::Router;
use windowgate_admin::SharedState;

pub use backend::Backend;

async fn hello() -> &'static str {
    "Hello!"
}

/// Build the public router with the rate-limit middleware applied.
pub fn build_app(state: SharedState) -> Router {
    Router::new()
        .route("/api/hello", get(hello))
        .route("/healthz", get(|| async { "ok" }))
        .layer(from_fn_with_state(state, middleware::rate_limit))
}
