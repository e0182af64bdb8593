use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{AggregateId, CorrelationId};
use tokio::sync::RwLock;

use crate::event::{DomainEvent, EventId};

#[derive(Default)]
struct Inner {
    by_aggregate: HashMap<AggregateId, Vec<DomainEvent>>,
    /// Every event ID currently held, for O(1) duplicate checks.
    seen: HashSet<EventId>,
}

/// Bounded per-aggregate event history.
///
/// This is a query/replay cache, not the system of record: each aggregate's
/// list is capped (oldest evicted first) and entries older than the maximum
/// age are dropped by the periodic sweep. The durable queue downstream of
/// the bus is the actual audit trail.
pub struct EventHistory {
    max_per_aggregate: usize,
    max_age: Duration,
    inner: RwLock<Inner>,
}

impl EventHistory {
    /// Creates a history with the given per-aggregate cap and maximum age.
    pub fn new(max_per_aggregate: usize, max_age: Duration) -> Self {
        Self {
            max_per_aggregate,
            max_age,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Records an event, evicting the aggregate's oldest entry if the cap
    /// is reached. Recording an event already held is a no-op.
    pub async fn record(&self, event: DomainEvent) {
        let mut inner = self.inner.write().await;
        if !inner.seen.insert(event.id) {
            return;
        }
        let list = inner.by_aggregate.entry(event.aggregate_id).or_default();
        list.push(event);
        if list.len() > self.max_per_aggregate {
            let evicted = list.remove(0);
            inner.seen.remove(&evicted.id);
        }
    }

    /// Returns true if an event with this ID is currently held.
    pub async fn contains(&self, id: EventId) -> bool {
        self.inner.read().await.seen.contains(&id)
    }

    /// Events for one aggregate sorted by timestamp; with a limit, the most
    /// recent entries are kept (still in ascending order).
    pub async fn by_aggregate(
        &self,
        aggregate_id: AggregateId,
        limit: Option<usize>,
    ) -> Vec<DomainEvent> {
        let inner = self.inner.read().await;
        let mut events = inner
            .by_aggregate
            .get(&aggregate_id)
            .cloned()
            .unwrap_or_default();
        Self::sort_and_limit(&mut events, limit);
        events
    }

    /// Events of one type across all aggregates, sorted by timestamp.
    pub async fn by_type(&self, event_type: &str, limit: Option<usize>) -> Vec<DomainEvent> {
        let inner = self.inner.read().await;
        let mut events: Vec<DomainEvent> = inner
            .by_aggregate
            .values()
            .flatten()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect();
        Self::sort_and_limit(&mut events, limit);
        events
    }

    /// Events sharing a correlation ID, sorted by timestamp.
    pub async fn by_correlation(&self, correlation_id: CorrelationId) -> Vec<DomainEvent> {
        let inner = self.inner.read().await;
        let mut events: Vec<DomainEvent> = inner
            .by_aggregate
            .values()
            .flatten()
            .filter(|e| e.metadata.correlation_id == Some(correlation_id))
            .cloned()
            .collect();
        Self::sort_and_limit(&mut events, None);
        events
    }

    fn sort_and_limit(events: &mut Vec<DomainEvent>, limit: Option<usize>) {
        events.sort_by_key(|e| e.metadata.timestamp);
        if let Some(limit) = limit
            && events.len() > limit
        {
            events.drain(..events.len() - limit);
        }
    }

    /// Drops entries older than the maximum age. Returns the number dropped.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now
            - chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::zero());
        let mut inner = self.inner.write().await;
        let mut dropped = 0;

        let mut expired: Vec<EventId> = Vec::new();
        for list in inner.by_aggregate.values_mut() {
            list.retain(|e| {
                let keep = e.metadata.timestamp >= cutoff;
                if !keep {
                    expired.push(e.id);
                    dropped += 1;
                }
                keep
            });
        }
        inner.by_aggregate.retain(|_, list| !list.is_empty());
        for id in expired {
            inner.seen.remove(&id);
        }
        dropped
    }

    /// Total number of events held.
    pub async fn len(&self) -> usize {
        self.inner.read().await.seen.len()
    }

    /// Returns true if no events are held.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.seen.is_empty()
    }

    /// Number of aggregates with at least one event.
    pub async fn aggregate_count(&self) -> usize {
        self.inner.read().await.by_aggregate.len()
    }

    /// Event counts keyed by event type.
    pub async fn counts_by_type(&self) -> HashMap<String, usize> {
        let inner = self.inner.read().await;
        let mut counts = HashMap::new();
        for event in inner.by_aggregate.values().flatten() {
            *counts.entry(event.event_type.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_for(aggregate_id: AggregateId, event_type: &str) -> DomainEvent {
        DomainEvent::builder()
            .event_type(event_type)
            .aggregate_id(aggregate_id)
            .aggregate_type("Invoice")
            .payload_raw(json!({}))
            .build()
    }

    #[tokio::test]
    async fn test_record_and_query_by_aggregate() {
        let history = EventHistory::new(100, Duration::from_secs(3600));
        let aggregate = AggregateId::new();
        for _ in 0..3 {
            history.record(event_for(aggregate, "invoice.created")).await;
        }
        history
            .record(event_for(AggregateId::new(), "invoice.created"))
            .await;

        let events = history.by_aggregate(aggregate, None).await;
        assert_eq!(events.len(), 3);
        assert!(
            events
                .windows(2)
                .all(|w| w[0].metadata.timestamp <= w[1].metadata.timestamp)
        );
    }

    #[tokio::test]
    async fn test_duplicate_record_is_noop() {
        let history = EventHistory::new(100, Duration::from_secs(3600));
        let event = event_for(AggregateId::new(), "invoice.created");
        history.record(event.clone()).await;
        history.record(event.clone()).await;
        assert_eq!(history.len().await, 1);
        assert!(history.contains(event.id).await);
    }

    #[tokio::test]
    async fn test_cap_evicts_oldest_first() {
        let history = EventHistory::new(2, Duration::from_secs(3600));
        let aggregate = AggregateId::new();
        let first = event_for(aggregate, "invoice.created");
        let first_id = first.id;
        history.record(first).await;
        history.record(event_for(aggregate, "invoice.updated")).await;
        history.record(event_for(aggregate, "invoice.paid")).await;

        assert_eq!(history.by_aggregate(aggregate, None).await.len(), 2);
        assert!(!history.contains(first_id).await);
    }

    #[tokio::test]
    async fn test_limit_keeps_most_recent() {
        let history = EventHistory::new(100, Duration::from_secs(3600));
        let aggregate = AggregateId::new();
        let mut ids = Vec::new();
        for n in 0..5 {
            let event = DomainEvent::builder()
                .event_type("invoice.created")
                .aggregate_id(aggregate)
                .aggregate_type("Invoice")
                .payload_raw(json!({"n": n}))
                .timestamp(Utc::now() + chrono::Duration::milliseconds(n))
                .build();
            ids.push(event.id);
            history.record(event).await;
        }
        let events = history.by_aggregate(aggregate, Some(2)).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, ids[3]);
        assert_eq!(events[1].id, ids[4]);
    }

    #[tokio::test]
    async fn test_sweep_drops_aged_entries() {
        let history = EventHistory::new(100, Duration::from_secs(60));
        let aggregate = AggregateId::new();
        let old = DomainEvent::builder()
            .event_type("invoice.created")
            .aggregate_id(aggregate)
            .aggregate_type("Invoice")
            .payload_raw(json!({}))
            .timestamp(Utc::now() - chrono::Duration::seconds(120))
            .build();
        let old_id = old.id;
        history.record(old).await;
        history.record(event_for(aggregate, "invoice.updated")).await;

        let dropped = history.sweep(Utc::now()).await;
        assert_eq!(dropped, 1);
        assert!(!history.contains(old_id).await);
        assert_eq!(history.by_aggregate(aggregate, None).await.len(), 1);
    }

    #[tokio::test]
    async fn test_by_type_and_correlation_filter() {
        let history = EventHistory::new(100, Duration::from_secs(3600));
        let correlation = CorrelationId::new();
        let correlated = DomainEvent::builder()
            .event_type("payment.settled")
            .aggregate_id(AggregateId::new())
            .aggregate_type("Payment")
            .payload_raw(json!({}))
            .correlation_id(correlation)
            .build();
        history.record(correlated).await;
        history
            .record(event_for(AggregateId::new(), "invoice.created"))
            .await;

        assert_eq!(history.by_type("payment.settled", None).await.len(), 1);
        assert_eq!(history.by_type("invoice.created", None).await.len(), 1);
        assert_eq!(history.by_correlation(correlation).await.len(), 1);
        assert_eq!(history.aggregate_count().await, 2);
        assert_eq!(
            history.counts_by_type().await.get("invoice.created"),
            Some(&1)
        );
    }
}
