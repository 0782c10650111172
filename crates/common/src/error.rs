use thiserror::Error;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("counter store error: {0}")]
    Store(String),

    #[error("stream transport error: {0}")]
    Transport(String),

    #[error("malformed aggregation message: {0}")]
    MessageParse(String),

    #[error("failed to apply increment for {key}: {reason}")]
    AggregatorWrite { key: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type GateResult<T> = Result<T, GateError>;
