//! Axum middleware enforcing the fixed-window limit on bearer-token callers.

use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;
use windowgate_admin::SharedState;
use windowgate_rate_limit::{parse_bearer, Decision, RateLimitInfo};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_RATELIMIT_RESET_SECONDS: HeaderName =
    HeaderName::from_static("x-ratelimit-reset-seconds");

/// Bearer token from the `Authorization` header, if any.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_bearer)
}

/// Whether `path` falls under `prefix` on a segment boundary, so `/api`
/// covers `/api` and `/api/x` but not `/apiary`.
fn is_protected(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn apply_headers(headers: &mut HeaderMap, info: &RateLimitInfo) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(info.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(info.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(info.reset_at));
    headers.insert(X_RATELIMIT_RESET_SECONDS, HeaderValue::from(info.reset_seconds));
}

/// Decide the request, then either forward it or answer 429.
///
/// Requests outside the protected prefix, and requests without a bearer
/// token, are forwarded untouched.
pub async fn rate_limit(State(state): State<SharedState>, req: Request, next: Next) -> Response {
    if !is_protected(req.uri().path(), &state.config.server.protected_prefix) {
        return next.run(req).await;
    }

    let started = Instant::now();
    state.metrics.requests_total.inc();

    let decision = state.limiter.check(bearer_token(req.headers())).await;

    let (outcome, response) = match decision {
        Decision::Unlimited => {
            state.metrics.requests_unauthenticated.inc();
            ("unlimited", next.run(req).await)
        }
        Decision::Admitted(info) => {
            state.metrics.requests_admitted.inc();
            let mut response = next.run(req).await;
            apply_headers(response.headers_mut(), &info);
            ("admitted", response)
        }
        Decision::Rejected(info) => {
            state.metrics.requests_rejected.inc();
            debug!(path = %req.uri().path(), remaining = info.remaining, "rejecting request");
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                [(CONTENT_TYPE, "text/plain; charset=utf-8")],
                Body::from("Rate limit exceeded"),
            )
                .into_response();
            let headers = response.headers_mut();
            apply_headers(headers, &info);
            headers.insert(RETRY_AFTER, HeaderValue::from(info.reset_seconds));
            ("rejected", response)
        }
    };

    state
        .metrics
        .request_duration
        .with_label_values(&[outcome])
        .observe(started.elapsed().as_secs_f64());

    response
}
