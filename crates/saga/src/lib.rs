//! Saga orchestration for multi-step distributed transactions.
//!
//! A saga is an ordered list of forward steps with optional compensating
//! actions. Steps run strictly sequentially; when one fails after
//! exhausting its retry budget, the steps already completed are compensated
//! in reverse order. The result is all-or-nothing-via-compensation, not
//! ACID: compensation is best-effort undo, and a failing compensator leaves
//! the saga in a terminal `Failed` state for operator attention.
//!
//! Every lifecycle transition is published as a domain event through the
//! [`event_bus`], so surrounding services react without polling saga state.

pub mod definition;
pub mod error;
pub mod events;
pub mod instance;
pub mod orchestrator;
pub mod status;

pub use definition::{FnAction, RetryPolicy, SagaDefinition, StepAction, StepDefinition, StepError};
pub use error::{Result, SagaError};
pub use instance::{Saga, SagaId};
pub use orchestrator::{SagaOrchestrator, SagaStats};
pub use status::SagaStatus;
