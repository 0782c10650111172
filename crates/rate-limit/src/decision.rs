use serde::Serialize;

use crate::classifier::FixedWindow;

/// Rate-limit state reported back to the caller, on admit and on reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds at which the next window starts.
    pub reset_at: i64,
    pub reset_seconds: u64,
}

impl RateLimitInfo {
    /// * `total` - requests counted in the window including the one being decided
    pub fn new(limit: u64, total: u64, now: i64, window: &FixedWindow) -> Self {
        Self {
            limit,
            remaining: limit.saturating_sub(total),
            reset_at: window.reset_at(now),
            reset_seconds: window.reset_seconds(now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No credential: the request is not subject to rate limiting.
    Unlimited,
    Admitted(RateLimitInfo),
    Rejected(RateLimitInfo),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Rejected(_))
    }

    pub fn info(&self) -> Option<&RateLimitInfo> {
        match self {
            Decision::Unlimited => None,
            Decision::Admitted(info) | Decision::Rejected(info) => Some(info),
        }
    }
}

/// `cached + pending + 1` must not exceed `limit` for the request to pass.
pub fn within_limit(limit: u64, cached: u64, pending: u64) -> bool {
    cached.saturating_add(pending).saturating_add(1) <= limit
}
