//! Saga instances: the mutable runtime record of one saga execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use common::CorrelationId;

use crate::SagaStatus;
use crate::error::{Result, SagaError};

/// Unique identifier for a saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SagaId(Uuid);

impl SagaId {
    /// Creates a new random saga ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a saga ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SagaId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SagaId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<SagaId> for Uuid {
    fn from(id: SagaId) -> Self {
        id.0
    }
}

/// The runtime state of one saga execution.
///
/// The step list is copied out of the definition at start time, so the
/// instance is self-describing even if queried long after. Only the
/// instance's own execution task mutates it; outside readers get
/// eventually-consistent snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Saga {
    /// Unique identifier for this instance.
    pub id: SagaId,

    /// Name of the definition this instance was started from.
    pub name: String,

    /// Correlates the saga with the flow that started it.
    pub correlation_id: CorrelationId,

    /// Current lifecycle status.
    pub status: SagaStatus,

    /// Step names in execution order.
    pub step_names: Vec<String>,

    /// Index of the step currently (or last) being executed.
    pub current_step: usize,

    /// Accumulated saga data; each forward step replaces it with its output.
    pub data: Value,

    /// The error that failed the saga, if any.
    pub error: Option<String>,

    /// Names of steps whose compensating action has completed.
    pub compensated_steps: Vec<String>,

    /// When the instance was created.
    pub created_at: DateTime<Utc>,

    /// When the instance last changed.
    pub updated_at: DateTime<Utc>,

    /// When the instance reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Saga {
    /// Creates a fresh pending instance.
    pub fn new(
        name: impl Into<String>,
        correlation_id: CorrelationId,
        step_names: Vec<String>,
        initial_data: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SagaId::new(),
            name: name.into(),
            correlation_id,
            status: SagaStatus::Pending,
            step_names,
            current_step: 0,
            data: initial_data,
            error: None,
            compensated_steps: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Moves the saga to `next`, rejecting transitions outside the lifecycle
    /// DAG. Stamps `completed_at` when a terminal status is reached.
    pub fn transition(&mut self, next: SagaStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SagaError::InvalidTransition {
                saga_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Resets the instance for a retry from step 0.
    ///
    /// Only valid from `Failed`. The accumulated data is kept: steps are
    /// required to be safe to re-run from the start, and re-running against
    /// the data the saga last held is part of that contract.
    pub fn reset_for_retry(&mut self) -> Result<()> {
        self.transition(SagaStatus::Pending)?;
        self.current_step = 0;
        self.error = None;
        self.compensated_steps.clear();
        self.completed_at = None;
        Ok(())
    }

    /// Duration from creation to terminal status, if finished.
    pub fn completion_time(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|done| done - self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn saga() -> Saga {
        Saga::new(
            "fulfillment",
            CorrelationId::new(),
            vec!["reserve".into(), "charge".into()],
            json!({"order": 7}),
        )
    }

    #[test]
    fn test_new_saga_starts_pending_at_step_zero() {
        let s = saga();
        assert_eq!(s.status, SagaStatus::Pending);
        assert_eq!(s.current_step, 0);
        assert!(s.error.is_none());
        assert!(s.completed_at.is_none());
    }

    #[test]
    fn test_transition_enforces_the_dag() {
        let mut s = saga();
        s.transition(SagaStatus::Running).unwrap();
        let err = s.transition(SagaStatus::Compensating).unwrap_err();
        assert!(err.to_string().contains("running"));
        assert_eq!(s.status, SagaStatus::Running);
    }

    #[test]
    fn test_terminal_transition_stamps_completed_at() {
        let mut s = saga();
        s.transition(SagaStatus::Running).unwrap();
        s.transition(SagaStatus::Completed).unwrap();
        assert!(s.completed_at.is_some());
        assert!(s.completion_time().is_some());
    }

    #[test]
    fn test_reset_for_retry_only_from_failed() {
        let mut s = saga();
        assert!(s.reset_for_retry().is_err());

        s.transition(SagaStatus::Running).unwrap();
        s.current_step = 1;
        s.error = Some("charge declined".into());
        s.transition(SagaStatus::Failed).unwrap();

        s.reset_for_retry().unwrap();
        assert_eq!(s.status, SagaStatus::Pending);
        assert_eq!(s.current_step, 0);
        assert!(s.error.is_none());
        assert_eq!(s.data, json!({"order": 7}));
    }

    #[test]
    fn test_saga_id_roundtrips_through_serde() {
        let id = SagaId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: SagaId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
