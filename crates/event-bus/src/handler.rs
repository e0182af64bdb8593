use std::future::Future;

use async_trait::async_trait;

use crate::DomainEvent;

/// Error type an event handler may fail with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A subscriber to domain events of one type.
///
/// The same handler object may be invoked synchronously (same-process
/// publish) or from a durable consumer loop (cross-process delivery); it
/// must tolerate at-least-once invocation.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Reacts to one domain event.
    async fn handle(&self, event: &DomainEvent) -> std::result::Result<(), HandlerError>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnEventHandler<F>(pub F);

#[async_trait]
impl<F, Fut> EventHandler for FnEventHandler<F>
where
    F: Fn(DomainEvent) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: &DomainEvent) -> std::result::Result<(), HandlerError> {
        (self.0)(event.clone()).await
    }
}
