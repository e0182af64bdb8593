use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stream_broker::EntryId;
use uuid::Uuid;

/// A message owned by a queue until acknowledged or dead-lettered.
///
/// The broker-assigned [`EntryId`] identifies one physical delivery; the
/// `logical_id` identifies the message across redeliveries and republishes
/// and is the key the idempotency filter deduplicates on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Broker-assigned entry ID, set once the message is appended.
    pub id: Option<EntryId>,

    /// Stable logical identity: caller-supplied, derived from the payload's
    /// own `id` field, or freshly generated.
    pub logical_id: String,

    /// The message payload.
    pub payload: Value,

    /// When the message was first published.
    pub enqueued_at: DateTime<Utc>,

    /// How many times delivery has failed so far.
    pub retries: u32,

    /// Retry budget; once `retries` reaches this, the message is dead-lettered.
    pub max_retries: u32,

    /// Optional delivery delay in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,

    /// Optional priority hint, carried through but not used for ordering.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,

    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,

    /// Earliest instant the message may be redelivered. Set while the
    /// message sits on a retry stream; cleared when it returns to its queue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,

    /// Queue the message originally belonged to. Set when dead-lettered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_queue: Option<String>,

    /// When the final failure happened. Set when dead-lettered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,

    /// The most recent handler error, carried for retry and DLQ inspection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Message {
    /// Creates a new message with the given payload and retry budget.
    pub fn new(payload: Value, max_retries: u32) -> Self {
        let logical_id = Self::derive_logical_id(&payload);
        Self {
            id: None,
            logical_id,
            payload,
            enqueued_at: Utc::now(),
            retries: 0,
            max_retries,
            delay_ms: None,
            priority: None,
            metadata: HashMap::new(),
            not_before: None,
            original_queue: None,
            failed_at: None,
            last_error: None,
        }
    }

    /// Returns the payload's own `id` field as the logical identity if it
    /// has one, otherwise a fresh UUID.
    fn derive_logical_id(payload: &Value) -> String {
        match payload.get("id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => Uuid::new_v4().to_string(),
        }
    }

    /// Returns true if the retry budget is exhausted.
    pub fn retries_exhausted(&self) -> bool {
        self.retries >= self.max_retries
    }

    /// Returns true if the message is eligible for delivery at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_none_or(|t| t <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_logical_id_comes_from_payload_id_field() {
        let msg = Message::new(json!({"id": "inv-42", "amount": 100}), 3);
        assert_eq!(msg.logical_id, "inv-42");

        let msg = Message::new(json!({"id": 7}), 3);
        assert_eq!(msg.logical_id, "7");
    }

    #[test]
    fn test_logical_id_generated_when_payload_has_none() {
        let a = Message::new(json!({"amount": 100}), 3);
        let b = Message::new(json!({"amount": 100}), 3);
        assert_ne!(a.logical_id, b.logical_id);
    }

    #[test]
    fn test_retries_exhausted_at_budget() {
        let mut msg = Message::new(json!({}), 2);
        assert!(!msg.retries_exhausted());
        msg.retries = 1;
        assert!(!msg.retries_exhausted());
        msg.retries = 2;
        assert!(msg.retries_exhausted());
    }

    #[test]
    fn test_is_due_respects_not_before() {
        let mut msg = Message::new(json!({}), 3);
        let now = Utc::now();
        assert!(msg.is_due(now));
        msg.not_before = Some(now + chrono::Duration::seconds(10));
        assert!(!msg.is_due(now));
        assert!(msg.is_due(now + chrono::Duration::seconds(11)));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut msg = Message::new(json!({"id": "m-1"}), 3);
        msg.metadata
            .insert("source".to_string(), json!("invoice-service"));
        let value = serde_json::to_value(&msg).unwrap();
        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }
}
