use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use stream_broker::{BrokerError, EntryId, ReadBlock, StreamBroker};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::handler::MessageHandler;
use crate::message::Message;
use crate::options::{ConsumeOptions, PublishOptions, QueueOptions, QueueStats};
use crate::{QueueError, Result};

/// How often the retry sweep scans retry streams and expires old entries.
const SWEEP_INTERVAL: Duration = Duration::from_millis(1000);

/// Initial and maximum backoff applied when a broker poll fails.
const POLL_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const POLL_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Per-queue counters maintained by this process.
#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    completed: u64,
    failed: u64,
}

/// One (group, consumer) registration on a queue, kept for bookkeeping.
#[derive(Debug, Clone)]
struct ConsumerRegistration {
    group: String,
    consumer: String,
}

/// Reliable, retryable, idempotent message delivery on top of a stream broker.
///
/// One `MessageQueue` is constructed per process and shared (via `Arc`)
/// across all publishers and consumers. It owns every piece of per-process
/// bookkeeping: registered queue options, consumer registrations, the
/// idempotency marker map, and the retry-sweep task.
///
/// Delivery is at least once. The retry republish is not transactional with
/// the acknowledgment of the failed delivery: a crash between the two can
/// lose the in-flight message. Consumers must be idempotent regardless.
pub struct MessageQueue<B: StreamBroker> {
    broker: Arc<B>,
    queues: RwLock<HashMap<String, QueueOptions>>,
    consumers: RwLock<HashMap<String, Vec<ConsumerRegistration>>>,
    /// `queue/group/logical_id` marker key -> marker expiry.
    idempotency: RwLock<HashMap<String, DateTime<Utc>>>,
    counters: RwLock<HashMap<String, Counters>>,
    shutdown: AtomicBool,
    sweeper_started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: StreamBroker + 'static> MessageQueue<B> {
    /// Creates a new queue manager over the given broker.
    pub fn new(broker: B) -> Self {
        Self {
            broker: Arc::new(broker),
            queues: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
            idempotency: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            sweeper_started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Name of the dead-letter queue associated with `queue`.
    pub fn dead_letter_queue_name(queue: &str) -> String {
        format!("{queue}:dlq")
    }

    /// Name of the retry stream associated with `queue`.
    pub fn retry_stream_name(queue: &str) -> String {
        format!("{queue}:retry")
    }

    fn validate_queue_name(name: &str) -> Result<()> {
        if name.is_empty() || name.contains(':') || name.chars().any(char::is_whitespace) {
            return Err(QueueError::InvalidQueueName(name.to_string()));
        }
        Ok(())
    }

    fn check_running(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(QueueError::ShuttingDown);
        }
        Ok(())
    }

    /// Creates a queue, its consumer group, and its dead-letter queue's group.
    ///
    /// Idempotent: creating a queue that already exists leaves its
    /// configuration untouched ("already exists" is not an error).
    pub async fn create_queue(self: &Arc<Self>, name: &str, options: QueueOptions) -> Result<()> {
        self.check_running()?;
        Self::validate_queue_name(name)?;

        let group = options.group_for(name);
        self.broker
            .create_consumer_group(name, &group, EntryId::MIN)
            .await?;

        let dlq = Self::dead_letter_queue_name(name);
        self.broker
            .create_consumer_group(&dlq, &format!("{dlq}-group"), EntryId::MIN)
            .await?;

        self.queues
            .write()
            .await
            .entry(name.to_string())
            .or_insert(options);
        self.ensure_sweeper().await;
        Ok(())
    }

    async fn ensure_queue(self: &Arc<Self>, name: &str) -> Result<QueueOptions> {
        if let Some(opts) = self.queues.read().await.get(name) {
            return Ok(opts.clone());
        }
        self.create_queue(name, QueueOptions::default()).await?;
        self.queues
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))
    }

    /// Publishes a message, returning its broker-assigned entry ID.
    ///
    /// The queue is created lazily with default options if it does not
    /// exist. A message published with a delay lands on the retry stream
    /// first and is moved onto the queue by the sweep once the delay
    /// elapses.
    pub async fn publish(
        self: &Arc<Self>,
        queue: &str,
        payload: Value,
        opts: PublishOptions,
    ) -> Result<EntryId> {
        self.check_running()?;
        let qopts = self.ensure_queue(queue).await?;

        let mut msg = Message::new(payload, opts.max_retries.unwrap_or(qopts.default_max_retries));
        if let Some(id) = opts.id {
            msg.logical_id = id;
        }
        msg.delay_ms = opts.delay_ms;
        msg.priority = opts.priority;
        msg.metadata = opts.metadata;

        let id = match opts.delay_ms {
            Some(delay) => {
                msg.not_before = Some(Utc::now() + chrono::Duration::milliseconds(delay as i64));
                self.broker
                    .append(&Self::retry_stream_name(queue), serde_json::to_value(&msg)?)
                    .await?
            }
            None => {
                let id = self
                    .broker
                    .append(queue, serde_json::to_value(&msg)?)
                    .await?;
                self.broker.trim(queue, qopts.max_length).await?;
                id
            }
        };

        metrics::counter!("queue_messages_published").increment(1);
        tracing::debug!(queue, entry_id = %id, logical_id = %msg.logical_id, "message published");
        Ok(id)
    }

    /// Publishes a batch of payloads atomically in one broker round trip.
    ///
    /// Either every message is durably appended and all IDs are returned,
    /// or the call errors with none of them visible to consumers.
    pub async fn publish_batch(
        self: &Arc<Self>,
        queue: &str,
        payloads: Vec<Value>,
    ) -> Result<Vec<EntryId>> {
        self.check_running()?;
        let qopts = self.ensure_queue(queue).await?;

        let entries = payloads
            .into_iter()
            .map(|p| serde_json::to_value(Message::new(p, qopts.default_max_retries)))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let count = entries.len();

        let ids = self.broker.append_batch(queue, entries).await?;
        self.broker.trim(queue, qopts.max_length).await?;

        metrics::counter!("queue_messages_published").increment(count as u64);
        tracing::debug!(queue, count, "batch published");
        Ok(ids)
    }

    /// Registers a handler and starts a dispatch loop for this consumer.
    ///
    /// Each registration runs as its own task: a blocking group read, then
    /// per-message idempotency check, handler invocation under the
    /// processing timeout, and acknowledgment or retry routing. Multiple
    /// registrations under the same group name compete for messages.
    pub async fn consume(
        self: &Arc<Self>,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        opts: ConsumeOptions,
    ) -> Result<()> {
        self.check_running()?;
        let qopts = self.ensure_queue(queue).await?;

        let group = opts
            .group_name
            .clone()
            .unwrap_or_else(|| qopts.group_for(queue));
        let consumer = opts
            .consumer_name
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", Uuid::new_v4()));
        self.broker
            .create_consumer_group(queue, &group, EntryId::MIN)
            .await?;

        self.consumers
            .write()
            .await
            .entry(queue.to_string())
            .or_default()
            .push(ConsumerRegistration {
                group: group.clone(),
                consumer: consumer.clone(),
            });

        let processing_timeout = opts.processing_timeout.unwrap_or(qopts.visibility_timeout);
        let this = Arc::clone(self);
        let queue = queue.to_string();
        let handle = tokio::spawn(async move {
            this.run_poll_loop(
                queue,
                group,
                consumer,
                handler,
                opts.batch_size,
                opts.block_timeout,
                processing_timeout,
                qopts,
            )
            .await;
        });
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_poll_loop(
        &self,
        queue: String,
        group: String,
        consumer: String,
        handler: Arc<dyn MessageHandler>,
        batch_size: usize,
        block_timeout: Duration,
        processing_timeout: Duration,
        qopts: QueueOptions,
    ) {
        tracing::debug!(queue = %queue, group = %group, consumer = %consumer, "consumer loop started");
        let mut backoff = POLL_BACKOFF_INITIAL;

        while !self.shutdown.load(Ordering::Relaxed) {
            // Exit once the queue has been deleted out from under us.
            if !self.queues.read().await.contains_key(&queue) {
                break;
            }

            match self
                .broker
                .read_group(
                    &queue,
                    &group,
                    &consumer,
                    batch_size,
                    ReadBlock::For(block_timeout),
                )
                .await
            {
                Ok(batch) => {
                    backoff = POLL_BACKOFF_INITIAL;
                    for (entry_id, value) in batch {
                        self.dispatch(
                            &queue,
                            &group,
                            entry_id,
                            value,
                            handler.as_ref(),
                            processing_timeout,
                            &qopts,
                        )
                        .await;
                    }
                }
                Err(BrokerError::GroupNotFound { .. }) => {
                    // Recreate and retry the read rather than crashing.
                    if let Err(e) = self
                        .broker
                        .create_consumer_group(&queue, &group, EntryId::MIN)
                        .await
                    {
                        tracing::warn!(queue = %queue, group = %group, error = %e, "failed to recreate consumer group");
                        tokio::time::sleep(backoff).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(queue = %queue, error = %e, backoff_ms = backoff.as_millis() as u64, "broker poll failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(POLL_BACKOFF_MAX);
                }
            }
        }
        tracing::debug!(queue = %queue, consumer = %consumer, "consumer loop stopped");
    }

    async fn dispatch(
        &self,
        queue: &str,
        group: &str,
        entry_id: EntryId,
        value: Value,
        handler: &dyn MessageHandler,
        processing_timeout: Duration,
        qopts: &QueueOptions,
    ) {
        let mut msg: Message = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(queue, entry_id = %entry_id, error = %e, "undecodable entry, acking off the queue");
                let _ = self.broker.ack(queue, group, entry_id).await;
                return;
            }
        };
        msg.id = Some(entry_id);
        msg.not_before = None;

        // Markers are scoped per (queue, group): separate groups are
        // separate logical subscribers and must each see the message.
        let marker_key = format!("{queue}/{group}/{}", msg.logical_id);
        if !self
            .mark_in_flight(&marker_key, qopts.idempotency_window)
            .await
        {
            // Already processed (or in flight) within the window:
            // acknowledge without invoking the handler.
            tracing::debug!(queue, logical_id = %msg.logical_id, "duplicate suppressed");
            metrics::counter!("queue_messages_deduplicated").increment(1);
            let _ = self.broker.ack(queue, group, entry_id).await;
            return;
        }

        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(processing_timeout, handler.handle(msg.clone())).await;
        metrics::histogram!("queue_handler_duration_seconds").record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(Ok(())) => {
                let _ = self.broker.ack(queue, group, entry_id).await;
                self.bump(queue, |c| c.completed += 1).await;
                metrics::counter!("queue_messages_processed").increment(1);
            }
            Ok(Err(e)) => {
                self.handle_failure(queue, group, entry_id, msg, e.to_string(), qopts)
                    .await;
            }
            Err(_) => {
                let error = format!("handler timed out after {}ms", processing_timeout.as_millis());
                self.handle_failure(queue, group, entry_id, msg, error, qopts)
                    .await;
            }
        }
    }

    /// Sets the idempotency marker for a `queue/group/logical_id` key,
    /// returning false if a live marker was already present.
    async fn mark_in_flight(&self, marker_key: &str, window: Duration) -> bool {
        let now = Utc::now();
        let mut markers = self.idempotency.write().await;
        if let Some(expiry) = markers.get(marker_key)
            && *expiry > now
        {
            return false;
        }
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        markers.insert(marker_key.to_string(), now + window);
        true
    }

    /// Routes a failed delivery: back onto the retry stream with exponential
    /// backoff while budget remains, otherwise into the dead-letter queue.
    ///
    /// Each republish acknowledges the original entry, converting broker
    /// redelivery into "deliver once more after a computed delay".
    async fn handle_failure(
        &self,
        queue: &str,
        group: &str,
        entry_id: EntryId,
        mut msg: Message,
        error: String,
        qopts: &QueueOptions,
    ) {
        // Drop the marker so the retry delivery is not suppressed.
        let marker_key = format!("{queue}/{group}/{}", msg.logical_id);
        self.idempotency.write().await.remove(&marker_key);
        self.bump(queue, |c| c.failed += 1).await;
        metrics::counter!("queue_messages_failed").increment(1);

        msg.retries += 1;
        msg.last_error = Some(error.clone());
        msg.id = None;

        if !msg.retries_exhausted() {
            let factor = 2u32.saturating_pow(msg.retries);
            let delay = qopts
                .retry_base_delay
                .saturating_mul(factor)
                .min(qopts.retry_max_delay);
            msg.not_before =
                Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()));

            let payload = match serde_json::to_value(&msg) {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(queue, error = %e, "failed to encode retry message");
                    return;
                }
            };
            match self
                .broker
                .append(&Self::retry_stream_name(queue), payload)
                .await
            {
                Ok(_) => {
                    let _ = self.broker.ack(queue, group, entry_id).await;
                    metrics::counter!("queue_messages_retried").increment(1);
                    tracing::debug!(
                        queue,
                        logical_id = %msg.logical_id,
                        retries = msg.retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "message scheduled for retry"
                    );
                }
                Err(e) => {
                    // Leave the original unacknowledged rather than lose it.
                    tracing::error!(queue, error = %e, "failed to republish to retry stream");
                }
            }
        } else {
            msg.original_queue = Some(queue.to_string());
            msg.failed_at = Some(Utc::now());

            let payload = match serde_json::to_value(&msg) {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(queue, error = %e, "failed to encode dead-letter message");
                    return;
                }
            };
            match self
                .broker
                .append(&Self::dead_letter_queue_name(queue), payload)
                .await
            {
                Ok(_) => {
                    let _ = self.broker.ack(queue, group, entry_id).await;
                    metrics::counter!("queue_messages_dead_lettered").increment(1);
                    tracing::warn!(
                        queue,
                        logical_id = %msg.logical_id,
                        retries = msg.retries,
                        error = %error,
                        "message dead-lettered"
                    );
                }
                Err(e) => {
                    tracing::error!(queue, error = %e, "failed to publish to dead-letter queue");
                }
            }
        }
    }

    async fn bump(&self, queue: &str, f: impl FnOnce(&mut Counters)) {
        let mut counters = self.counters.write().await;
        f(counters.entry(queue.to_string()).or_default());
    }

    /// Starts the periodic sweep task exactly once per manager.
    async fn ensure_sweeper(self: &Arc<Self>) {
        if self.sweeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            while !this.shutdown.load(Ordering::Relaxed) {
                tick.tick().await;
                this.sweep_once().await;
            }
        });
        self.tasks.lock().await.push(handle);
    }

    /// Runs one sweep iteration immediately: moves due retry-stream entries
    /// back onto their queues, expires aged entries, and purges stale
    /// idempotency markers.
    pub async fn sweep_once(&self) {
        let now = Utc::now();
        self.idempotency
            .write()
            .await
            .retain(|_, expiry| *expiry > now);

        let queues: Vec<(String, QueueOptions)> = self
            .queues
            .read()
            .await
            .iter()
            .map(|(name, opts)| (name.clone(), opts.clone()))
            .collect();

        for (queue, opts) in queues {
            if let Err(e) = self.sweep_queue(&queue, &opts, now).await {
                tracing::warn!(queue = %queue, error = %e, "retry sweep failed");
            }
        }
    }

    async fn sweep_queue(&self, queue: &str, opts: &QueueOptions, now: DateTime<Utc>) -> Result<()> {
        let retry = Self::retry_stream_name(queue);
        let entries = self.broker.range_read(&retry, EntryId::MIN, EntryId::MAX).await?;

        let mut moved = Vec::new();
        for (entry_id, value) in entries {
            let Ok(mut msg) = serde_json::from_value::<Message>(value) else {
                moved.push(entry_id);
                continue;
            };
            if msg.is_due(now) {
                msg.not_before = None;
                msg.id = None;
                self.broker.append(queue, serde_json::to_value(&msg)?).await?;
                moved.push(entry_id);
                metrics::counter!("queue_messages_redelivered").increment(1);
            }
        }
        if !moved.is_empty() {
            self.broker.delete_entries(&retry, &moved).await?;
        }

        // Entry IDs encode append time, so age expiry is a range delete.
        let age = chrono::Duration::from_std(opts.max_age).unwrap_or(chrono::Duration::zero());
        let cutoff_ms = (now - age).timestamp_millis().max(0) as u64;
        if cutoff_ms > 0 {
            let old = self
                .broker
                .range_read(queue, EntryId::MIN, EntryId::new(cutoff_ms, u64::MAX))
                .await?;
            if !old.is_empty() {
                let ids: Vec<EntryId> = old.into_iter().map(|(id, _)| id).collect();
                let expired = self.broker.delete_entries(queue, &ids).await?;
                tracing::debug!(queue, expired, "expired aged entries");
            }
        }
        Ok(())
    }

    /// Returns best-effort statistics for a registered queue.
    pub async fn get_queue_stats(&self, queue: &str) -> Result<QueueStats> {
        let opts = self
            .queues
            .read()
            .await
            .get(queue)
            .cloned()
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
        let group = opts.group_for(queue);

        let len = self.broker.stream_len(queue).await?;
        let processing = self.broker.pending_count(queue, &group).await?;
        let dead_lettered = self
            .broker
            .stream_len(&Self::dead_letter_queue_name(queue))
            .await?;
        let counters = self
            .counters
            .read()
            .await
            .get(queue)
            .copied()
            .unwrap_or_default();

        Ok(QueueStats {
            pending: len.saturating_sub(processing),
            processing,
            completed: counters.completed,
            failed: counters.failed,
            dead_lettered,
        })
    }

    /// Reads up to `limit` messages from a queue's dead-letter queue for
    /// inspection, oldest first. Does not consume them.
    pub async fn read_dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<Message>> {
        let dlq = Self::dead_letter_queue_name(queue);
        let entries = self.broker.range_read(&dlq, EntryId::MIN, EntryId::MAX).await?;
        entries
            .into_iter()
            .take(limit)
            .map(|(entry_id, value)| {
                let mut msg: Message = serde_json::from_value(value)?;
                msg.id = Some(entry_id);
                Ok(msg)
            })
            .collect()
    }

    /// Redrives every dead-lettered message back onto its queue with a fresh
    /// retry budget. Returns the number of messages redriven.
    pub async fn redrive_dead_letters(self: &Arc<Self>, queue: &str) -> Result<usize> {
        let qopts = self.ensure_queue(queue).await?;
        let dlq = Self::dead_letter_queue_name(queue);
        let entries = self.broker.range_read(&dlq, EntryId::MIN, EntryId::MAX).await?;

        let mut redriven = Vec::new();
        for (entry_id, value) in entries {
            let Ok(mut msg) = serde_json::from_value::<Message>(value) else {
                continue;
            };
            msg.id = None;
            msg.retries = 0;
            msg.max_retries = qopts.default_max_retries;
            msg.original_queue = None;
            msg.failed_at = None;
            self.broker.append(queue, serde_json::to_value(&msg)?).await?;
            redriven.push(entry_id);
        }
        if !redriven.is_empty() {
            self.broker.delete_entries(&dlq, &redriven).await?;
            tracing::info!(queue, count = redriven.len(), "dead letters redriven");
        }
        Ok(redriven.len())
    }

    /// Removes all messages from a queue and its retry stream, keeping the
    /// queue registered with its existing options.
    pub async fn clear_queue(&self, queue: &str) -> Result<()> {
        let opts = self
            .queues
            .read()
            .await
            .get(queue)
            .cloned()
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;

        self.broker.delete_stream(queue).await?;
        self.broker
            .delete_stream(&Self::retry_stream_name(queue))
            .await?;
        self.broker
            .create_consumer_group(queue, &opts.group_for(queue), EntryId::MIN)
            .await?;
        self.counters.write().await.remove(queue);
        tracing::info!(queue, "queue cleared");
        Ok(())
    }

    /// Deletes a queue, its retry stream, and its dead-letter queue, and
    /// deregisters all local bookkeeping. Running consumer loops for the
    /// queue exit on their next iteration.
    pub async fn delete_queue(&self, queue: &str) -> Result<()> {
        if self.queues.write().await.remove(queue).is_none() {
            return Err(QueueError::QueueNotFound(queue.to_string()));
        }
        self.consumers.write().await.remove(queue);
        self.counters.write().await.remove(queue);

        self.broker.delete_stream(queue).await?;
        self.broker
            .delete_stream(&Self::retry_stream_name(queue))
            .await?;
        self.broker
            .delete_stream(&Self::dead_letter_queue_name(queue))
            .await?;
        tracing::info!(queue, "queue deleted");
        Ok(())
    }

    /// Number of consumer registrations currently held for a queue.
    pub async fn consumer_count(&self, queue: &str) -> usize {
        self.consumers
            .read()
            .await
            .get(queue)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Returns true if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Requests shutdown and waits for all poll loops and the sweep task to
    /// finish their current iteration and exit.
    ///
    /// In-flight handler invocations are allowed to complete; no new poll
    /// iterations start.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("message queue shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FnHandler;
    use serde_json::json;
    use stream_broker::InMemoryBroker;

    fn manager() -> Arc<MessageQueue<InMemoryBroker>> {
        Arc::new(MessageQueue::new(InMemoryBroker::new()))
    }

    #[tokio::test]
    async fn test_queue_names_are_validated() {
        let mq = manager();
        let err = mq
            .publish("", json!({}), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidQueueName(_)));

        let err = mq
            .publish("bad:name", json!({}), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidQueueName(_)));
    }

    #[tokio::test]
    async fn test_publish_creates_queue_lazily() {
        let mq = manager();
        mq.publish("invoices", json!({"id": "inv-1"}), PublishOptions::default())
            .await
            .unwrap();
        let stats = mq.get_queue_stats("invoices").await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.dead_lettered, 0);
    }

    #[tokio::test]
    async fn test_create_queue_is_idempotent() {
        let mq = manager();
        mq.create_queue("payments", QueueOptions::default())
            .await
            .unwrap();
        mq.create_queue("payments", QueueOptions::default())
            .await
            .unwrap();
        assert_eq!(mq.get_queue_stats("payments").await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_delayed_publish_lands_on_retry_stream_until_due() {
        let mq = manager();
        mq.create_queue("q", QueueOptions::default()).await.unwrap();
        mq.publish("q", json!({"id": "m-1"}), PublishOptions::with_delay_ms(5))
            .await
            .unwrap();
        assert_eq!(mq.get_queue_stats("q").await.unwrap().pending, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        mq.sweep_once().await;
        assert_eq!(mq.get_queue_stats("q").await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_stats_on_unknown_queue_errors() {
        let mq = manager();
        assert!(matches!(
            mq.get_queue_stats("nope").await.unwrap_err(),
            QueueError::QueueNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_queue_removes_bookkeeping() {
        let mq = manager();
        mq.create_queue("q", QueueOptions::default()).await.unwrap();
        mq.delete_queue("q").await.unwrap();
        assert!(matches!(
            mq.get_queue_stats("q").await.unwrap_err(),
            QueueError::QueueNotFound(_)
        ));
        assert!(matches!(
            mq.delete_queue("q").await.unwrap_err(),
            QueueError::QueueNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_is_rejected() {
        let mq = manager();
        mq.shutdown().await;
        assert!(matches!(
            mq.publish("q", json!({}), PublishOptions::default())
                .await
                .unwrap_err(),
            QueueError::ShuttingDown
        ));
    }

    #[tokio::test]
    async fn test_handler_error_does_not_escape_dispatch() {
        let mq = manager();
        let opts = QueueOptions {
            retry_base_delay: Duration::from_millis(1),
            ..QueueOptions::default()
        };
        mq.create_queue("q", opts).await.unwrap();
        mq.consume(
            "q",
            Arc::new(FnHandler(|_msg: Message| async {
                Err::<(), _>("boom".into())
            })),
            ConsumeOptions {
                block_timeout: Duration::from_millis(20),
                ..ConsumeOptions::default()
            },
        )
        .await
        .unwrap();

        mq.publish("q", json!({"id": "m-1"}), PublishOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The loop is still alive and the failure was counted.
        let stats = mq.get_queue_stats("q").await.unwrap();
        assert!(stats.failed >= 1);
        mq.shutdown().await;
    }
}
