//! Error types shared across the spout

use thiserror::Error;

/// Result type for spout operations
pub type SpoutResult<T> = Result<T, SpoutError>;

/// Error types surfaced by the spout and its components
#[derive(Error, Debug)]
pub enum SpoutError {
    /// Required configuration entry is absent or empty
    #[error("missing required configuration: {0}")]
    ConfigMissing(&'static str),

    /// Configuration is present but unusable
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// An argument that is fatal to the individual call, not the process
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A lifecycle rule was violated by the caller
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Log consumer failures (poll, seek, assignment)
    #[error("log consumer error: {0}")]
    LogConsumer(String),

    /// Kafka client errors
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Persistence adapter failures
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Serialization of persisted state or payloads
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors from filesystem-backed persistence
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal channel failures
    #[error("channel error: {0}")]
    Channel(String),
}

impl SpoutError {
    /// Whether a worker should log this and retry on the next tick
    /// rather than tear anything down.
    pub fn is_transient(&self) -> bool {
        match self {
            SpoutError::LogConsumer(_) => true,
            SpoutError::Kafka(_) => true,
            SpoutError::Persistence(_) => true,
            SpoutError::Io(_) => true,
            SpoutError::Channel(_) => true,
            SpoutError::ConfigMissing(_) => false,
            SpoutError::ConfigInvalid(_) => false,
            SpoutError::InvalidArgument(_) => false,
            SpoutError::IllegalState(_) => false,
            SpoutError::Serialization(_) => false,
        }
    }
}
