use stream_broker::BrokerError;
use thiserror::Error;

/// Errors surfaced synchronously by queue operations.
///
/// Downstream processing failures (handler errors, retries, dead-lettering)
/// are never surfaced here; they are visible only through stats and the
/// dead-letter queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue name is empty or uses a reserved character.
    #[error("Invalid queue name: {0}")]
    InvalidQueueName(String),

    /// The queue is not registered with this process.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// The queue manager is shutting down; no new work is accepted.
    #[error("Queue manager is shutting down")]
    ShuttingDown,

    /// An unrecoverable broker error.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
