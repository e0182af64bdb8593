use thiserror::Error;

use crate::{SagaId, SagaStatus};

/// Errors surfaced by the saga orchestrator.
///
/// Step and compensation failures are never surfaced here: they are
/// absorbed into the saga's own status and error field, and lifecycle
/// event publishing is logged rather than propagated. These variants
/// cover caller mistakes only.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No definition registered under the given name.
    #[error("saga definition '{0}' is not registered")]
    DefinitionNotFound(String),

    /// A definition with this name is already registered.
    #[error("saga definition '{0}' is already registered")]
    DuplicateDefinition(String),

    /// The definition is structurally unusable.
    #[error("invalid saga definition: {0}")]
    InvalidDefinition(String),

    /// No instance with the given ID.
    #[error("saga {0} not found")]
    SagaNotFound(SagaId),

    /// The operation is not valid for the instance's current status.
    #[error("saga {saga_id} is {actual}, expected {expected}")]
    InvalidStatus {
        saga_id: SagaId,
        expected: &'static str,
        actual: SagaStatus,
    },

    /// A lifecycle transition outside the legal DAG was attempted.
    #[error("saga {saga_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        saga_id: SagaId,
        from: SagaStatus,
        to: SagaStatus,
    },
}

/// Result type for saga operations.
pub type Result<T> = std::result::Result<T, SagaError>;
