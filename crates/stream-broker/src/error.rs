use thiserror::Error;

/// Errors that can occur when talking to the stream broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The stream does not exist.
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// The consumer group does not exist on the stream.
    ///
    /// Callers are expected to recreate the group and retry the read; a
    /// missing group is a recoverable condition, not a fatal one.
    #[error("Consumer group '{group}' not found on stream '{queue}'")]
    GroupNotFound { queue: String, group: String },

    /// The broker is unreachable or the connection was lost mid-call.
    #[error("Broker connection error: {0}")]
    Connection(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    /// Returns true if retrying the operation after local recovery
    /// (recreating the group, reconnecting) can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BrokerError::GroupNotFound { .. } | BrokerError::Connection(_)
        )
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
