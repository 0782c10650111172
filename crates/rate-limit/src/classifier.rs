//! Request classification: who is calling, and which fixed window the call
//! falls into.

use chrono::DateTime;
use sha2::{Digest, Sha256};

/// Outcome of classifying a request's credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// No usable credential. Such requests bypass rate limiting.
    Unauthenticated,
    /// Opaque, stable identifier derived from the credential.
    Entity(String),
}

/// Classify a raw bearer token.
pub fn classify(token: Option<&str>) -> Classification {
    match token.map(str::trim) {
        Some(token) if !token.is_empty() => Classification::Entity(entity_id(token)),
        _ => Classification::Unauthenticated,
    }
}

/// One-way hash of a credential, hex encoded.
pub fn entity_id(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Extract the token from an `Authorization` header value of the form
/// `Bearer <token>`. Any other scheme yields `None`.
pub fn parse_bearer(header: &str) -> Option<&str> {
    let header = header.trim();
    let (scheme, token) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Fixed, non-overlapping time buckets of `secs` seconds aligned to the unix epoch.
///
/// Bucket `k` covers `[k * secs, (k + 1) * secs)`. Identifiers are rendered
/// from the bucket's UTC start time, so they sort chronologically and are the
/// same in every process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindow {
    secs: i64,
}

impl FixedWindow {
    /// * `secs` - window length; values below one are treated as one second
    pub fn new(secs: u64) -> Self {
        Self {
            secs: (secs as i64).max(1),
        }
    }

    pub fn secs(&self) -> u64 {
        self.secs as u64
    }

    /// Index of the bucket containing `now`.
    pub fn index(&self, now: i64) -> i64 {
        now.div_euclid(self.secs)
    }

    /// Start (unix seconds) of the bucket containing `now`.
    pub fn start(&self, now: i64) -> i64 {
        self.index(now) * self.secs
    }

    /// Fixed-width identifier of the bucket containing `now`.
    ///
    /// Minute resolution (`YYYY-MM-DD-HH-MM`) when the window is a whole
    /// number of minutes, otherwise second resolution (`YYYY-MM-DD-HH-MM-SS`).
    pub fn identifier(&self, now: i64) -> String {
        let start = DateTime::from_timestamp(self.start(now), 0).unwrap_or_default();
        if self.secs % 60 == 0 {
            start.format("%Y-%m-%d-%H-%M").to_string()
        } else {
            start.format("%Y-%m-%d-%H-%M-%S").to_string()
        }
    }

    /// Seconds until the next bucket begins; always in `1..=secs`.
    pub fn reset_seconds(&self, now: i64) -> u64 {
        (self.secs - now.rem_euclid(self.secs)) as u64
    }

    /// Unix seconds at which the next bucket begins.
    pub fn reset_at(&self, now: i64) -> i64 {
        now + self.reset_seconds(now) as i64
    }
}
