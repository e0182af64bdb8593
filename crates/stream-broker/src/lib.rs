//! Append-only stream store contract.
//!
//! This crate defines the semantics the coordination subsystem requires from
//! its durable broker: per-queue append-only streams, consumer groups with
//! at-least-once delivery and per-entry acknowledgment, and range scans by
//! entry ID. The production broker lives outside this codebase; the
//! [`InMemoryBroker`] here implements the same contract for tests and
//! single-process deployments.

pub mod broker;
pub mod entry;
pub mod error;
pub mod memory;

pub use broker::{ReadBlock, StreamBroker};
pub use entry::EntryId;
pub use error::{BrokerError, Result};
pub use memory::InMemoryBroker;
