use serde::{Deserialize, Serialize};

/// Top-level windowgate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Routes under this prefix go through the rate-limit middleware.
    #[serde(default = "default_protected_prefix")]
    pub protected_prefix: String,
    #[serde(default)]
    pub admin: AdminConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            protected_prefix: default_protected_prefix(),
            admin: AdminConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_admin_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Fixed window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Maximum admitted requests per entity per window.
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
    /// Age after which a cached aggregate is re-read from the counter store.
    #[serde(default = "default_cache_invalidation_secs")]
    pub cache_invalidation_secs: u64,
    /// Upper bound on a single counter store read; a timeout counts as a failed read.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default)]
    pub publish_mode: PublishMode,
    #[serde(default)]
    pub flush: FlushConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_requests: default_max_requests(),
            cache_invalidation_secs: default_cache_invalidation_secs(),
            store_timeout_ms: default_store_timeout_ms(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            publish_mode: PublishMode::default(),
            flush: FlushConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// One `request_count` record per key, partitioned by entity.
    #[default]
    PerKey,
    /// One `batch` record per flush, partitioned by the process instance id.
    Batched,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushConfig {
    #[serde(default = "default_flush_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_batch_keys")]
    pub max_batch_keys: usize,
    #[serde(default)]
    pub trigger: FlushTrigger,
    /// Tick period of the background trigger.
    #[serde(default = "default_ticker_secs")]
    pub ticker_secs: u64,
    /// Upper bound on one publish; `0` waits indefinitely.
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_flush_interval_secs(),
            max_batch_keys: default_max_batch_keys(),
            trigger: FlushTrigger::default(),
            ticker_secs: default_ticker_secs(),
            publish_timeout_ms: default_publish_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    /// Evaluate the flush policy only when a request arrives.
    #[default]
    OnRequest,
    /// Also evaluate it from a background ticker.
    Background,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_counter_prefix")]
    pub counter_prefix: String,
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    /// Optional expiry applied to durable counters on every increment.
    #[serde(default)]
    pub counter_ttl_secs: Option<u64>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            redis_url: default_redis_url(),
            counter_prefix: default_counter_prefix(),
            stream_prefix: default_stream_prefix(),
            partitions: default_partitions(),
            counter_ttl_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Maximum messages delivered per partition batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_consumer_group")]
    pub group: String,
    /// Consumer name inside the group; a random one is generated when unset.
    #[serde(default)]
    pub consumer: Option<String>,
    /// Entries left unacknowledged by any consumer for this long are claimed
    /// and redelivered.
    #[serde(default = "default_claim_idle_ms")]
    pub claim_idle_ms: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            group: default_consumer_group(),
            consumer: None,
            claim_idle_ms: default_claim_idle_ms(),
        }
    }
}

// Default value helpers
fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_protected_prefix() -> String {
    "/api".to_string()
}
fn default_admin_listen() -> String {
    "127.0.0.1:9090".to_string()
}
fn default_true() -> bool {
    true
}
fn default_window_secs() -> u64 {
    60
}
fn default_max_requests() -> u64 {
    10
}
fn default_cache_invalidation_secs() -> u64 {
    30
}
fn default_store_timeout_ms() -> u64 {
    1000
}
fn default_cleanup_interval_secs() -> u64 {
    60
}
fn default_flush_interval_secs() -> u64 {
    5
}
fn default_max_batch_keys() -> usize {
    50
}
fn default_ticker_secs() -> u64 {
    1
}
fn default_publish_timeout_ms() -> u64 {
    1000
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_counter_prefix() -> String {
    "windowgate:count".to_string()
}
fn default_stream_prefix() -> String {
    "windowgate:stream".to_string()
}
fn default_partitions() -> u32 {
    4
}
fn default_batch_size() -> usize {
    100
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_claim_idle_ms() -> u64 {
    30_000
}
fn default_consumer_group() -> String {
    "windowgate-aggregator".to_string()
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML document.
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> anyhow::Result<()> {
        let rl = &self.rate_limit;
        if rl.window_secs == 0 {
            anyhow::bail!("rate_limit.window_secs must be greater than zero");
        }
        if rl.max_requests == 0 {
            anyhow::bail!("rate_limit.max_requests must be greater than zero");
        }
        if rl.flush.max_batch_keys == 0 {
            anyhow::bail!("rate_limit.flush.max_batch_keys must be greater than zero");
        }
        if rl.flush.trigger == FlushTrigger::Background && rl.flush.ticker_secs == 0 {
            anyhow::bail!("rate_limit.flush.ticker_secs must be greater than zero");
        }
        if !self.server.protected_prefix.starts_with('/') {
            anyhow::bail!(
                "server.protected_prefix must start with '/' (got '{}')",
                self.server.protected_prefix
            );
        }
        if self.backend.partitions == 0 {
            anyhow::bail!("backend.partitions must be greater than zero");
        }
        if self.aggregator.batch_size == 0 {
            anyhow::bail!("aggregator.batch_size must be greater than zero");
        }
        Ok(())
    }
}
