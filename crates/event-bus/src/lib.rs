//! Typed pub/sub for domain events.
//!
//! Events published here fan out two ways: synchronously to handlers in the
//! same process, and durably through a shared `domain_events` queue to
//! handlers in other processes. A bounded per-aggregate history backs
//! queries and replay; it is a cache, not the system of record.

pub mod bus;
pub mod error;
pub mod event;
pub mod handler;
pub mod history;

pub use bus::{EventBus, EventStats, DOMAIN_EVENTS_QUEUE};
pub use error::{EventBusError, Result};
pub use event::{DomainEvent, DomainEventBuilder, EventId, EventMetadata};
pub use handler::{EventHandler, FnEventHandler};
