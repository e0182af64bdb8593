//! Saga lifecycle state machine.

use serde::{Deserialize, Serialize};

/// The status of a saga instance in its lifecycle.
///
/// Legal transitions:
/// ```text
/// Pending ──► Running ──┬──► Completed
///    ▲                  └──► Failed ──► Compensating ──┬──► Compensated
///    │                         │  ▲                    └──► Failed
///    └───── retry ─────────────┘  └── cancel before start
/// ```
///
/// `Failed` is reached in two ways: a forward step exhausting its retries
/// (after which compensation runs), or a compensating action itself failing
/// (after which the saga stays `Failed` until an operator retries it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Created but no step has run yet.
    #[default]
    Pending,

    /// Forward steps are being executed.
    Running,

    /// All forward steps completed (terminal).
    Completed,

    /// A step or a compensating action failed; retriable.
    Failed,

    /// Compensating actions are being executed in reverse order.
    Compensating,

    /// All applicable compensating actions completed (terminal).
    Compensated,
}

impl SagaStatus {
    /// Returns true if `next` is a legal transition from this status.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Compensating)
                | (Failed, Pending)
                | (Compensating, Compensated)
                | (Compensating, Failed)
        )
    }

    /// Returns true if no further transition is possible.
    ///
    /// `Failed` is deliberately not terminal: it accepts a retry (back to
    /// `Pending`) or a compensation pass.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Completed | SagaStatus::Compensated)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "pending",
            SagaStatus::Running => "running",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Compensated => "compensated",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SagaStatus::*;

    const ALL: [SagaStatus; 6] = [Pending, Running, Completed, Failed, Compensating, Compensated];

    #[test]
    fn test_default_status_is_pending() {
        assert_eq!(SagaStatus::default(), Pending);
    }

    #[test]
    fn test_forward_edges() {
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
    }

    #[test]
    fn test_compensation_edges() {
        assert!(Failed.can_transition_to(Compensating));
        assert!(Compensating.can_transition_to(Compensated));
        assert!(Compensating.can_transition_to(Failed));
    }

    #[test]
    fn test_retry_and_cancel_edges() {
        assert!(Failed.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Failed));
    }

    #[test]
    fn test_compensating_never_resumes_running() {
        assert!(!Compensating.can_transition_to(Running));
        assert!(!Compensated.can_transition_to(Running));
    }

    #[test]
    fn test_terminal_statuses_accept_no_transition() {
        for from in [Completed, Compensated] {
            assert!(from.is_terminal());
            for to in ALL {
                assert!(!from.can_transition_to(to));
            }
        }
    }

    #[test]
    fn test_display_uses_lowercase_names() {
        assert_eq!(Pending.to_string(), "pending");
        assert_eq!(Compensating.to_string(), "compensating");
    }

    #[test]
    fn test_serializes_as_snake_case() {
        assert_eq!(serde_json::to_string(&Compensated).unwrap(), "\"compensated\"");
        let back: SagaStatus = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(back, Running);
    }
}
