pub mod config;
pub mod error;
pub mod message;

pub use config::{
    AggregatorConfig, AppConfig, BackendConfig, BackendKind, FlushConfig, FlushTrigger,
    PublishMode, RateLimitConfig,
};
pub use error::{GateError, GateResult};
pub use message::{AggregationMessage, BatchPayload, RateLimitKey, StreamMessage, MAX_COUNT};
