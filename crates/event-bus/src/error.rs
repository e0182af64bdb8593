use message_queue::QueueError;
use thiserror::Error;

/// Errors surfaced synchronously by event bus operations.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// The event failed boundary validation at publish time.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// The underlying queue rejected the operation.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for event bus operations.
pub type Result<T> = std::result::Result<T, EventBusError>;
