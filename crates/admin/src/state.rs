use std::sync::Arc;

use prometheus::{HistogramOpts, HistogramVec, IntCounter, Opts, Registry};
use windowgate_aggregator::StreamAggregator;
use windowgate_common::AppConfig;
use windowgate_rate_limit::RateLimiter;

/// Shared state type alias used across all route handlers.
pub type SharedState = Arc<AppState>;

/// Everything the admin handlers and the rate-limit middleware read.
pub struct AppState {
    pub config: AppConfig,
    pub metrics: GateMetrics,
    pub limiter: RateLimiter,
    /// Set when the aggregator runs inside this process.
    pub aggregator: Option<Arc<StreamAggregator>>,
    pub start_time: std::time::Instant,
}

/// Prometheus metrics for the protected routes.
pub struct GateMetrics {
    pub registry: Registry,
    pub requests_total: IntCounter,
    pub requests_admitted: IntCounter,
    pub requests_rejected: IntCounter,
    pub requests_unauthenticated: IntCounter,
    pub request_duration: HistogramVec,
}

impl GateMetrics {
    /// Create the metric set registered against a fresh Prometheus registry.
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounter::with_opts(Opts::new(
            "windowgate_requests_total",
            "Total number of requests seen by the rate limiter",
        ))
        .expect("failed to create requests_total counter");

        let requests_admitted = IntCounter::with_opts(Opts::new(
            "windowgate_requests_admitted",
            "Requests admitted within their entity's limit",
        ))
        .expect("failed to create requests_admitted counter");

        let requests_rejected = IntCounter::with_opts(Opts::new(
            "windowgate_requests_rejected",
            "Requests rejected with 429",
        ))
        .expect("failed to create requests_rejected counter");

        let requests_unauthenticated = IntCounter::with_opts(Opts::new(
            "windowgate_requests_unauthenticated",
            "Requests without a bearer token, passed through unlimited",
        ))
        .expect("failed to create requests_unauthenticated counter");

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "windowgate_request_duration_seconds",
                "Time spent deciding and serving protected requests",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0]),
            &["outcome"],
        )
        .expect("failed to create request_duration histogram");

        registry.register(Box::new(requests_total.clone())).expect("failed to register requests_total");
        registry.register(Box::new(requests_admitted.clone())).expect("failed to register requests_admitted");
        registry.register(Box::new(requests_rejected.clone())).expect("failed to register requests_rejected");
        registry
            .register(Box::new(requests_unauthenticated.clone()))
            .expect("failed to register requests_unauthenticated");
        registry.register(Box::new(request_duration.clone())).expect("failed to register request_duration");

        Self {
            registry,
            requests_total,
            requests_admitted,
            requests_rejected,
            requests_unauthenticated,
            request_duration,
        }
    }
}

impl Default for GateMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    pub fn new(config: AppConfig, limiter: RateLimiter) -> Self {
        Self {
            config,
            metrics: GateMetrics::new(),
            limiter,
            aggregator: None,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn with_aggregator(mut self, aggregator: Arc<StreamAggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }
}
