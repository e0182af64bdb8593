use std::future::Future;

use async_trait::async_trait;

use crate::Message;

/// Error type a handler may fail with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for handler invocations.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// A message handler invoked by a consumer's dispatch loop.
///
/// Handlers run under the consumer's processing timeout. A returned error
/// (or a timeout) counts against the message's retry budget; it never
/// escapes the dispatch loop.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one message.
    async fn handle(&self, message: Message) -> HandlerResult;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, message: Message) -> HandlerResult {
        (self.0)(message).await
    }
}
