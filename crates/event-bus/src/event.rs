use chrono::{DateTime, Utc};
use common::{AggregateId, CorrelationId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a domain event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<EventId> for Uuid {
    fn from(id: EventId) -> Self {
        id.0
    }
}

/// Metadata carried by every domain event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventMetadata {
    /// The user on whose behalf the event was produced, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Correlates all events and messages belonging to one flow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,

    /// The event that directly caused this one, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<EventId>,

    /// When the event was published, serialized as unix milliseconds.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// Schema version of the payload.
    pub version: u32,
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            user_id: None,
            correlation_id: None,
            causation_id: None,
            timestamp: Utc::now(),
            version: 1,
        }
    }
}

/// An immutable record of something that happened to an aggregate.
///
/// Ordering within an aggregate is by `metadata.timestamp`, not by arrival
/// order at any particular consumer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainEvent {
    /// Unique identifier for this event.
    pub id: EventId,

    /// Dotted event taxonomy, e.g. `invoice.created`.
    pub event_type: String,

    /// The aggregate this event belongs to.
    pub aggregate_id: AggregateId,

    /// The kind of aggregate, e.g. `Invoice`.
    pub aggregate_type: String,

    /// The event payload as JSON.
    pub payload: Value,

    /// Metadata about the event.
    pub metadata: EventMetadata,
}

impl DomainEvent {
    /// Creates a new domain event builder.
    pub fn builder() -> DomainEventBuilder {
        DomainEventBuilder::default()
    }
}

/// Builder for constructing domain events.
#[derive(Debug, Default)]
pub struct DomainEventBuilder {
    id: Option<EventId>,
    event_type: Option<String>,
    aggregate_id: Option<AggregateId>,
    aggregate_type: Option<String>,
    payload: Option<Value>,
    metadata: EventMetadata,
}

impl DomainEventBuilder {
    /// Sets the event ID. If not set, a new ID is generated.
    pub fn id(mut self, id: EventId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the aggregate ID.
    pub fn aggregate_id(mut self, id: AggregateId) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    /// Sets the aggregate type.
    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets the acting user.
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.metadata.user_id = Some(user_id.into());
        self
    }

    /// Sets the correlation ID.
    pub fn correlation_id(mut self, id: CorrelationId) -> Self {
        self.metadata.correlation_id = Some(id);
        self
    }

    /// Sets the causation ID.
    pub fn causation_id(mut self, id: EventId) -> Self {
        self.metadata.causation_id = Some(id);
        self
    }

    /// Sets the event timestamp. If not set, the current time is used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.metadata.timestamp = timestamp;
        self
    }

    /// Sets the payload schema version (defaults to 1).
    pub fn version(mut self, version: u32) -> Self {
        self.metadata.version = version;
        self
    }

    /// Builds the domain event.
    ///
    /// # Panics
    ///
    /// Panics if required fields (event_type, aggregate_id, aggregate_type,
    /// payload) are not set.
    pub fn build(self) -> DomainEvent {
        DomainEvent {
            id: self.id.unwrap_or_default(),
            event_type: self.event_type.expect("event_type is required"),
            aggregate_id: self.aggregate_id.expect("aggregate_id is required"),
            aggregate_type: self.aggregate_type.expect("aggregate_type is required"),
            payload: self.payload.expect("payload is required"),
            metadata: self.metadata,
        }
    }

    /// Tries to build the event, returning None if required fields are missing.
    pub fn try_build(self) -> Option<DomainEvent> {
        Some(DomainEvent {
            id: self.id.unwrap_or_default(),
            event_type: self.event_type?,
            aggregate_id: self.aggregate_id?,
            aggregate_type: self.aggregate_type?,
            payload: self.payload?,
            metadata: self.metadata,
        })
    }
}
