use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use common::{AggregateId, CorrelationId};
use message_queue::{ConsumeOptions, FnHandler, Message, MessageQueue, PublishOptions};
use stream_broker::StreamBroker;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{EventBusError, Result};
use crate::event::DomainEvent;
use crate::handler::EventHandler;
use crate::history::EventHistory;

/// The shared queue all domain events flow through for durable fan-out.
pub const DOMAIN_EVENTS_QUEUE: &str = "domain_events";

/// Per-aggregate history cap.
const HISTORY_MAX_PER_AGGREGATE: usize = 1_000;

/// History entries older than this are swept.
const HISTORY_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// How often the history sweep runs.
const HISTORY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Observability snapshot of the bus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventStats {
    /// Events currently held in history.
    pub total_events: usize,

    /// Event counts keyed by event type.
    pub by_type: HashMap<String, usize>,

    /// Number of aggregates with history entries.
    pub aggregates: usize,

    /// Number of registered local handlers across all event types.
    pub local_handlers: usize,
}

/// Typed pub/sub for domain events over a [`MessageQueue`].
///
/// `publish` stores the event in the bounded history, appends it to the
/// shared `domain_events` queue for durable cross-process fan-out, then
/// synchronously invokes same-process subscribers in publish order.
/// Distributed subscribers get at-least-once delivery with no ordering
/// guarantee beyond what the underlying stream preserves.
pub struct EventBus<B: StreamBroker> {
    queue: Arc<MessageQueue<B>>,
    subscribers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    history: EventHistory,
    /// Distinguishes this process's consumer groups on `domain_events`:
    /// delivery is once per subscribing process, so each process gets its
    /// own group per event type.
    instance_id: String,
    shutdown: AtomicBool,
    sweeper_started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: StreamBroker + 'static> EventBus<B> {
    /// Creates a new event bus over the given queue manager.
    pub fn new(queue: Arc<MessageQueue<B>>) -> Self {
        Self::with_history_limits(queue, HISTORY_MAX_PER_AGGREGATE, HISTORY_MAX_AGE)
    }

    /// Creates a bus with custom history bounds.
    pub fn with_history_limits(
        queue: Arc<MessageQueue<B>>,
        max_per_aggregate: usize,
        max_age: Duration,
    ) -> Self {
        Self {
            queue,
            subscribers: RwLock::new(HashMap::new()),
            history: EventHistory::new(max_per_aggregate, max_age),
            instance_id: uuid::Uuid::new_v4().simple().to_string(),
            shutdown: AtomicBool::new(false),
            sweeper_started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn validate(event: &DomainEvent) -> Result<()> {
        if event.event_type.is_empty() {
            return Err(EventBusError::InvalidEvent(
                "event_type must not be empty".to_string(),
            ));
        }
        if event.aggregate_type.is_empty() {
            return Err(EventBusError::InvalidEvent(
                "aggregate_type must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Publishes a domain event.
    ///
    /// The event is stored in history, appended durably to the
    /// `domain_events` queue, and fanned out synchronously to local
    /// subscribers of its type. Local handler failures are logged and do
    /// not fail the publish.
    pub async fn publish(self: &Arc<Self>, event: DomainEvent) -> Result<()> {
        Self::validate(&event)?;
        self.ensure_sweeper().await;

        self.history.record(event.clone()).await;
        self.queue
            .publish(
                DOMAIN_EVENTS_QUEUE,
                serde_json::to_value(&event)?,
                PublishOptions::with_id(event.id.to_string()),
            )
            .await?;

        metrics::counter!("bus_events_published").increment(1);
        tracing::debug!(
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            event_id = %event.id,
            "domain event published"
        );

        let _ = self.fan_out_local(&event).await;
        Ok(())
    }

    /// Publishes a batch of events: stored and durably appended as one
    /// atomic batch, then fanned out synchronously in array order.
    pub async fn publish_batch(self: &Arc<Self>, events: Vec<DomainEvent>) -> Result<()> {
        for event in &events {
            Self::validate(event)?;
        }
        self.ensure_sweeper().await;

        let payloads = events
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for event in &events {
            self.history.record(event.clone()).await;
        }
        self.queue
            .publish_batch(DOMAIN_EVENTS_QUEUE, payloads)
            .await?;
        metrics::counter!("bus_events_published").increment(events.len() as u64);

        for event in &events {
            let _ = self.fan_out_local(event).await;
        }
        Ok(())
    }

    /// Invokes local subscribers for the event's type in registration order.
    ///
    /// Every handler runs even if an earlier one fails; the first error is
    /// returned so durable delivery can retry.
    async fn fan_out_local(&self, event: &DomainEvent) -> std::result::Result<(), String> {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .subscribers
            .read()
            .await
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();

        let mut first_error = None;
        for handler in handlers {
            if let Err(e) = handler.handle(event).await {
                tracing::warn!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    error = %e,
                    "event handler failed"
                );
                metrics::counter!("bus_handler_failures").increment(1);
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Registers a handler for an event type.
    ///
    /// The handler is invoked synchronously for events published in this
    /// process and, through a durable consumer on the `domain_events` queue
    /// (group derived from the event type), once for events published by
    /// other processes. Subscribing twice adds a second local handler but
    /// joins the same consumer group.
    pub async fn subscribe(
        self: &Arc<Self>,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        if event_type.is_empty() {
            return Err(EventBusError::InvalidEvent(
                "event_type must not be empty".to_string(),
            ));
        }
        self.ensure_sweeper().await;

        self.subscribers
            .write()
            .await
            .entry(event_type.to_string())
            .or_default()
            .push(handler);

        let bus = Arc::downgrade(self);
        let subscribed_type = event_type.to_string();
        let delegate = FnHandler(move |msg: Message| {
            let bus = bus.clone();
            let subscribed_type = subscribed_type.clone();
            async move {
                // The bus may be gone during shutdown; drop the message.
                let Some(bus) = bus.upgrade() else { return Ok(()) };
                bus.deliver_durable(&subscribed_type, msg).await
            }
        });

        self.queue
            .consume(
                DOMAIN_EVENTS_QUEUE,
                Arc::new(delegate),
                ConsumeOptions {
                    group_name: Some(format!("{event_type}-subscribers-{}", self.instance_id)),
                    ..ConsumeOptions::default()
                },
            )
            .await?;

        tracing::debug!(event_type, "subscribed");
        Ok(())
    }

    /// Handles one durable delivery from the `domain_events` queue.
    ///
    /// Events of other types and events this process already fanned out
    /// (they are in history) are acknowledged without invoking handlers.
    async fn deliver_durable(
        &self,
        subscribed_type: &str,
        msg: Message,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let event: DomainEvent = serde_json::from_value(msg.payload)?;
        if event.event_type != subscribed_type {
            return Ok(());
        }
        if self.history.contains(event.id).await {
            return Ok(());
        }
        if let Err(e) = self.fan_out_local(&event).await {
            return Err(e.into());
        }
        self.history.record(event).await;
        Ok(())
    }

    /// Removes local handlers for an event type.
    ///
    /// With `Some(handler)`, only that handler (by pointer identity) is
    /// removed; with `None`, all local handlers for the type are removed.
    /// Does not retroactively stop an in-flight durable consumer loop.
    /// Returns the number of handlers removed.
    pub async fn unsubscribe(
        &self,
        event_type: &str,
        handler: Option<&Arc<dyn EventHandler>>,
    ) -> usize {
        let mut subscribers = self.subscribers.write().await;
        let Some(handlers) = subscribers.get_mut(event_type) else {
            return 0;
        };
        let before = handlers.len();
        match handler {
            Some(target) => handlers.retain(|h| !Arc::ptr_eq(h, target)),
            None => handlers.clear(),
        }
        let removed = before - handlers.len();
        if handlers.is_empty() {
            subscribers.remove(event_type);
        }
        removed
    }

    /// Events for one aggregate, sorted by timestamp.
    pub async fn get_events_by_aggregate(
        &self,
        aggregate_id: AggregateId,
        limit: Option<usize>,
    ) -> Vec<DomainEvent> {
        self.history.by_aggregate(aggregate_id, limit).await
    }

    /// Events of one type, sorted by timestamp.
    pub async fn get_events_by_type(
        &self,
        event_type: &str,
        limit: Option<usize>,
    ) -> Vec<DomainEvent> {
        self.history.by_type(event_type, limit).await
    }

    /// Events sharing a correlation ID, sorted by timestamp.
    pub async fn get_events_by_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> Vec<DomainEvent> {
        self.history.by_correlation(correlation_id).await
    }

    /// Re-invokes local subscribers for stored events of an aggregate with
    /// schema version greater than `from_version`, in timestamp order.
    ///
    /// Replay never republishes to the durable queue and never reaches
    /// distributed subscribers. Returns the number of events replayed.
    pub async fn replay_events(
        self: &Arc<Self>,
        aggregate_id: AggregateId,
        from_version: u32,
    ) -> Result<usize> {
        let events = self.history.by_aggregate(aggregate_id, None).await;
        let mut replayed = 0;
        for event in events
            .iter()
            .filter(|e| e.metadata.version > from_version)
        {
            let _ = self.fan_out_local(event).await;
            replayed += 1;
        }
        metrics::counter!("bus_events_replayed").increment(replayed as u64);
        tracing::debug!(aggregate_id = %aggregate_id, replayed, "events replayed");
        Ok(replayed)
    }

    /// Returns an observability snapshot of the bus.
    pub async fn get_event_stats(&self) -> EventStats {
        EventStats {
            total_events: self.history.len().await,
            by_type: self.history.counts_by_type().await,
            aggregates: self.history.aggregate_count().await,
            local_handlers: self
                .subscribers
                .read()
                .await
                .values()
                .map(|v| v.len())
                .sum(),
        }
    }

    /// Runs one history sweep immediately. Returns the number of entries
    /// dropped.
    pub async fn sweep_history_once(&self) -> usize {
        self.history.sweep(Utc::now()).await
    }

    async fn ensure_sweeper(self: &Arc<Self>) {
        if self.sweeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let bus = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(HISTORY_SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(bus) = bus.upgrade() else { break };
                if bus.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let dropped = bus.sweep_history_once().await;
                if dropped > 0 {
                    tracing::debug!(dropped, "history sweep dropped aged events");
                }
            }
        });
        self.tasks.lock().await.push(handle);
    }

    /// Stops the history sweep and shuts down the underlying queue manager,
    /// including the durable consumer loops registered by `subscribe`.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        self.queue.shutdown().await;
        tracing::info!("event bus shut down");
    }
}
