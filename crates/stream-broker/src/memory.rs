use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Notify, RwLock};

use crate::broker::{ReadBlock, StreamBroker};
use crate::{BrokerError, EntryId, Result};

/// One consumer group's delivery state on a stream.
#[derive(Debug, Default)]
struct Group {
    /// The highest entry ID delivered to any member of the group.
    last_delivered: EntryId,
    /// Delivered-but-unacknowledged entries, keyed to the consumer holding them.
    pending: HashMap<EntryId, String>,
}

#[derive(Debug, Default)]
struct Stream {
    /// Entries in append order (sorted by ID).
    entries: Vec<(EntryId, Value)>,
    groups: HashMap<String, Group>,
    /// Highest ID ever assigned, including trimmed/deleted entries.
    last_id: EntryId,
}

/// In-memory stream broker for tests and single-process deployments.
///
/// Implements the same contract as an external broker: per-queue streams,
/// consumer groups with pending-entry tracking, blocking group reads, and
/// range scans. State lives behind a single `RwLock`; blocked readers are
/// woken through a shared [`Notify`] whenever any stream is appended to.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    streams: Arc<RwLock<HashMap<String, Stream>>>,
    appended: Arc<Notify>,
}

impl InMemoryBroker {
    /// Creates a new empty in-memory broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of streams currently held.
    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }

    /// Drops all streams and groups.
    pub async fn clear(&self) {
        self.streams.write().await.clear();
        self.appended.notify_waiters();
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn append_locked(stream: &mut Stream, payload: Value) -> EntryId {
        let id = EntryId::next_after(stream.last_id, Self::now_ms());
        stream.last_id = id;
        stream.entries.push((id, payload));
        id
    }

    /// Attempts one non-blocking group read under the write lock.
    async fn try_read_group(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<(EntryId, Value)>> {
        let mut streams = self.streams.write().await;
        let stream = streams
            .get_mut(queue)
            .ok_or_else(|| BrokerError::GroupNotFound {
                queue: queue.to_string(),
                group: group.to_string(),
            })?;
        // Split borrow: collect the batch before touching group state.
        let last_delivered = stream
            .groups
            .get(group)
            .ok_or_else(|| BrokerError::GroupNotFound {
                queue: queue.to_string(),
                group: group.to_string(),
            })?
            .last_delivered;

        let batch: Vec<(EntryId, Value)> = stream
            .entries
            .iter()
            .filter(|(id, _)| *id > last_delivered)
            .take(count)
            .cloned()
            .collect();

        if !batch.is_empty() {
            let g = stream.groups.get_mut(group).unwrap();
            for (id, _) in &batch {
                g.pending.insert(*id, consumer.to_string());
                g.last_delivered = (*id).max(g.last_delivered);
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl StreamBroker for InMemoryBroker {
    async fn append(&self, queue: &str, payload: Value) -> Result<EntryId> {
        let mut streams = self.streams.write().await;
        let stream = streams.entry(queue.to_string()).or_default();
        let id = Self::append_locked(stream, payload);
        drop(streams);
        self.appended.notify_waiters();
        tracing::trace!(queue, entry_id = %id, "entry appended");
        Ok(id)
    }

    async fn append_batch(&self, queue: &str, payloads: Vec<Value>) -> Result<Vec<EntryId>> {
        let mut streams = self.streams.write().await;
        let stream = streams.entry(queue.to_string()).or_default();
        // Single lock acquisition: the batch is visible all-or-nothing.
        let ids: Vec<EntryId> = payloads
            .into_iter()
            .map(|p| Self::append_locked(stream, p))
            .collect();
        drop(streams);
        self.appended.notify_waiters();
        tracing::trace!(queue, count = ids.len(), "batch appended");
        Ok(ids)
    }

    async fn create_consumer_group(&self, queue: &str, group: &str, start: EntryId) -> Result<()> {
        let mut streams = self.streams.write().await;
        let stream = streams.entry(queue.to_string()).or_default();
        if !stream.groups.contains_key(group) {
            stream.groups.insert(
                group.to_string(),
                Group {
                    last_delivered: start,
                    pending: HashMap::new(),
                },
            );
            tracing::debug!(queue, group, start = %start, "consumer group created");
        }
        Ok(())
    }

    async fn read_group(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: ReadBlock,
    ) -> Result<Vec<(EntryId, Value)>> {
        let deadline = match block {
            ReadBlock::NoWait => None,
            ReadBlock::For(d) => Some(Instant::now() + d),
        };

        loop {
            // Register for wakeups before scanning so an append between the
            // scan and the wait is not missed.
            let notified = self.appended.notified();

            let batch = self.try_read_group(queue, group, consumer, count).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let Some(deadline) = deadline else {
                return Ok(Vec::new());
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn ack(&self, queue: &str, group: &str, id: EntryId) -> Result<bool> {
        let mut streams = self.streams.write().await;
        let removed = streams
            .get_mut(queue)
            .and_then(|s| s.groups.get_mut(group))
            .map(|g| g.pending.remove(&id).is_some())
            .unwrap_or(false);
        Ok(removed)
    }

    async fn range_read(
        &self,
        queue: &str,
        start: EntryId,
        end: EntryId,
    ) -> Result<Vec<(EntryId, Value)>> {
        let streams = self.streams.read().await;
        let Some(stream) = streams.get(queue) else {
            return Ok(Vec::new());
        };
        Ok(stream
            .entries
            .iter()
            .filter(|(id, _)| *id >= start && *id <= end)
            .cloned()
            .collect())
    }

    async fn delete_entries(&self, queue: &str, ids: &[EntryId]) -> Result<usize> {
        let mut streams = self.streams.write().await;
        let Some(stream) = streams.get_mut(queue) else {
            return Ok(0);
        };
        let before = stream.entries.len();
        stream.entries.retain(|(id, _)| !ids.contains(id));
        for group in stream.groups.values_mut() {
            for id in ids {
                group.pending.remove(id);
            }
        }
        Ok(before - stream.entries.len())
    }

    async fn trim(&self, queue: &str, max_length: usize) -> Result<usize> {
        let mut streams = self.streams.write().await;
        let Some(stream) = streams.get_mut(queue) else {
            return Ok(0);
        };
        if stream.entries.len() <= max_length {
            return Ok(0);
        }
        let evict = stream.entries.len() - max_length;
        let evicted: Vec<EntryId> = stream.entries.drain(..evict).map(|(id, _)| id).collect();
        for group in stream.groups.values_mut() {
            for id in &evicted {
                group.pending.remove(id);
            }
        }
        tracing::debug!(queue, evicted = evict, max_length, "stream trimmed");
        Ok(evict)
    }

    async fn stream_len(&self, queue: &str) -> Result<usize> {
        let streams = self.streams.read().await;
        Ok(streams.get(queue).map(|s| s.entries.len()).unwrap_or(0))
    }

    async fn pending_count(&self, queue: &str, group: &str) -> Result<usize> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(queue)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0))
    }

    async fn delete_stream(&self, queue: &str) -> Result<()> {
        if self.streams.write().await.remove(queue).is_some() {
            tracing::debug!(queue, "stream deleted");
        }
        Ok(())
    }
}
