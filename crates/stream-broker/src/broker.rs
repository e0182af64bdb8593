use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{EntryId, Result};

/// Blocking behavior for a consumer-group read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadBlock {
    /// Return immediately, possibly with an empty batch.
    #[default]
    NoWait,
    /// Wait cooperatively up to the given duration for new entries.
    For(Duration),
}

/// Core trait for stream broker implementations.
///
/// A broker maintains one append-only stream per queue name and delivers
/// entries to named consumer groups with at-least-once semantics: an entry
/// handed to a group member stays pending until it is acknowledged, and the
/// broker delivers each entry to exactly one member of a given group.
///
/// All implementations must be thread-safe (`Send + Sync`).
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Appends a single entry to the stream, creating the stream if absent.
    ///
    /// Returns the broker-assigned entry ID.
    async fn append(&self, queue: &str, payload: Value) -> Result<EntryId>;

    /// Appends a batch of entries atomically in one round trip.
    ///
    /// Either every payload is durably appended and all IDs are returned,
    /// or the call errors and no entry is visible to consumers.
    async fn append_batch(&self, queue: &str, payloads: Vec<Value>) -> Result<Vec<EntryId>>;

    /// Creates a consumer group on the stream, starting delivery after
    /// `start` (use [`EntryId::MIN`] to deliver everything).
    ///
    /// Idempotent: creating a group that already exists is not an error,
    /// and the existing group's position is left untouched. The stream is
    /// created empty if it does not exist yet.
    async fn create_consumer_group(&self, queue: &str, group: &str, start: EntryId) -> Result<()>;

    /// Reads up to `count` entries not yet delivered to the group.
    ///
    /// Delivered entries become pending for `consumer` until acknowledged.
    /// With [`ReadBlock::For`], the call waits cooperatively for new entries
    /// up to the given duration before returning an empty batch.
    ///
    /// Errors with [`BrokerError::GroupNotFound`](crate::BrokerError) if the
    /// group (or the stream) is missing.
    async fn read_group(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: ReadBlock,
    ) -> Result<Vec<(EntryId, Value)>>;

    /// Acknowledges an entry for the group, removing it from the pending set.
    ///
    /// Returns true if the entry was pending, false if it was unknown or
    /// already acknowledged.
    async fn ack(&self, queue: &str, group: &str, id: EntryId) -> Result<bool>;

    /// Reads entries in `[start, end]` regardless of group state.
    async fn range_read(
        &self,
        queue: &str,
        start: EntryId,
        end: EntryId,
    ) -> Result<Vec<(EntryId, Value)>>;

    /// Removes entries from the stream outright.
    ///
    /// Returns the number of entries actually removed. Pending references
    /// held by consumer groups are dropped along with the entry.
    async fn delete_entries(&self, queue: &str, ids: &[EntryId]) -> Result<usize>;

    /// Trims the stream to at most `max_length` entries, evicting oldest
    /// first. Returns the number of entries evicted.
    async fn trim(&self, queue: &str, max_length: usize) -> Result<usize>;

    /// Returns the number of entries currently in the stream.
    ///
    /// Returns 0 for a stream that does not exist.
    async fn stream_len(&self, queue: &str) -> Result<usize>;

    /// Returns the number of entries pending (delivered, unacknowledged)
    /// for the group. Returns 0 if the group does not exist.
    async fn pending_count(&self, queue: &str, group: &str) -> Result<usize>;

    /// Deletes the stream and all its consumer groups.
    ///
    /// Deleting a stream that does not exist is not an error.
    async fn delete_stream(&self, queue: &str) -> Result<()>;
}
