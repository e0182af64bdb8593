//! Saga lifecycle events published through the event bus.
//!
//! Every transition of a saga instance is announced as a domain event so
//! surrounding services can react without polling orchestrator state. The
//! saga instance itself is the aggregate; its ID doubles as the aggregate ID.

use common::AggregateId;
use event_bus::DomainEvent;
use serde_json::{Value, json};

use crate::Saga;

/// Aggregate type used for all saga lifecycle events.
pub const SAGA_AGGREGATE_TYPE: &str = "Saga";

/// A saga instance began forward execution.
pub const SAGA_STARTED: &str = "saga.started";
/// A forward step completed successfully.
pub const SAGA_STEP_COMPLETED: &str = "saga.step_completed";
/// A forward step exhausted its retry budget.
pub const SAGA_STEP_FAILED: &str = "saga.step_failed";
/// All forward steps completed.
pub const SAGA_COMPLETED: &str = "saga.completed";
/// The saga failed and is no longer making forward progress.
pub const SAGA_FAILED: &str = "saga.failed";
/// Reverse-order compensation began.
pub const SAGA_COMPENSATION_STARTED: &str = "saga.compensation_started";
/// One step's compensating action completed.
pub const SAGA_STEP_COMPENSATED: &str = "saga.step_compensated";
/// All applicable compensating actions completed.
pub const SAGA_COMPENSATED: &str = "saga.compensated";
/// A compensating action failed; the saga needs operator attention.
pub const SAGA_COMPENSATION_FAILED: &str = "saga.compensation_failed";
/// The saga was cancelled by a caller.
pub const SAGA_CANCELLED: &str = "saga.cancelled";

/// Builds a lifecycle event from a saga snapshot.
///
/// `detail` contributes event-specific payload fields (step name, error
/// text) on top of the snapshot fields every lifecycle event carries.
pub fn lifecycle_event(saga: &Saga, event_type: &str, detail: Value) -> DomainEvent {
    let mut payload = json!({
        "saga_id": saga.id,
        "saga_name": saga.name,
        "status": saga.status,
        "current_step": saga.current_step,
    });
    if let (Value::Object(base), Value::Object(extra)) = (&mut payload, detail) {
        base.extend(extra);
    }

    DomainEvent::builder()
        .event_type(event_type)
        .aggregate_id(AggregateId::from_uuid(saga.id.as_uuid()))
        .aggregate_type(SAGA_AGGREGATE_TYPE)
        .payload_raw(payload)
        .correlation_id(saga.correlation_id)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::CorrelationId;
    use serde_json::json;

    #[test]
    fn test_lifecycle_event_carries_saga_snapshot_and_detail() {
        let saga = Saga::new(
            "fulfillment",
            CorrelationId::new(),
            vec!["reserve".into()],
            json!({}),
        );
        let event = lifecycle_event(&saga, SAGA_STEP_COMPLETED, json!({"step": "reserve"}));

        assert_eq!(event.event_type, SAGA_STEP_COMPLETED);
        assert_eq!(event.aggregate_type, SAGA_AGGREGATE_TYPE);
        assert_eq!(event.aggregate_id.as_uuid(), saga.id.as_uuid());
        assert_eq!(event.metadata.correlation_id, Some(saga.correlation_id));
        assert_eq!(event.payload["saga_name"], "fulfillment");
        assert_eq!(event.payload["status"], "pending");
        assert_eq!(event.payload["step"], "reserve");
    }
}
