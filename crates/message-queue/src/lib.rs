//! Durable message queue on top of an append-only stream broker.
//!
//! Provides reliable at-least-once delivery with competing consumers,
//! bounded exponential-backoff retry, dead-lettering, and a time-windowed
//! idempotency filter. All per-process state (registered queues, consumers,
//! idempotency markers, retry bookkeeping) is owned by a single
//! [`MessageQueue`] value constructed once per process.

pub mod error;
pub mod handler;
pub mod message;
pub mod options;
pub mod queue;

pub use error::{QueueError, Result};
pub use handler::{FnHandler, HandlerError, HandlerResult, MessageHandler};
pub use message::Message;
pub use options::{ConsumeOptions, PublishOptions, QueueOptions, QueueStats};
pub use queue::MessageQueue;
