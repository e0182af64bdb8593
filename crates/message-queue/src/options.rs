use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

/// Configuration for a queue, fixed at creation time.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Maximum number of entries kept on the stream; oldest are evicted.
    pub max_length: usize,

    /// Entries older than this are expired by the periodic sweep.
    pub max_age: Duration,

    /// Consumer-group name used by default for this queue's consumers.
    pub group_name: Option<String>,

    /// How long a logical message ID is remembered as already processed.
    pub idempotency_window: Duration,

    /// Default bound on a single handler invocation.
    pub visibility_timeout: Duration,

    /// Default retry budget for messages published without an explicit one.
    pub default_max_retries: u32,

    /// Base delay for exponential retry backoff.
    pub retry_base_delay: Duration,

    /// Cap on the computed retry delay.
    pub retry_max_delay: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_length: 10_000,
            max_age: Duration::from_secs(24 * 60 * 60),
            group_name: None,
            idempotency_window: Duration::from_secs(5 * 60),
            visibility_timeout: Duration::from_secs(30),
            default_max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
        }
    }
}

impl QueueOptions {
    /// Resolves the consumer-group name for a queue.
    pub fn group_for(&self, queue: &str) -> String {
        self.group_name
            .clone()
            .unwrap_or_else(|| format!("{queue}-group"))
    }
}

/// Per-publish overrides.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Delay before the message becomes eligible for delivery.
    pub delay_ms: Option<u64>,

    /// Priority hint, carried in the message.
    pub priority: Option<u8>,

    /// Retry budget override.
    pub max_retries: Option<u32>,

    /// Free-form metadata attached to the message.
    pub metadata: HashMap<String, Value>,

    /// Caller-supplied logical ID for idempotency.
    pub id: Option<String>,
}

impl PublishOptions {
    /// Options with a caller-supplied logical ID.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Options with a delivery delay.
    pub fn with_delay_ms(delay_ms: u64) -> Self {
        Self {
            delay_ms: Some(delay_ms),
            ..Self::default()
        }
    }
}

/// Configuration for one consumer registration.
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    /// Consumer-group name; defaults to the queue's configured group.
    pub group_name: Option<String>,

    /// Name identifying this member within the group; generated if absent.
    pub consumer_name: Option<String>,

    /// Maximum entries fetched per poll iteration.
    pub batch_size: usize,

    /// How long one poll blocks waiting for new entries.
    pub block_timeout: Duration,

    /// Bound on a single handler invocation; defaults to the queue's
    /// visibility timeout.
    pub processing_timeout: Option<Duration>,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            group_name: None,
            consumer_name: None,
            batch_size: 10,
            block_timeout: Duration::from_millis(500),
            processing_timeout: None,
        }
    }
}

/// Best-effort per-queue statistics derived from stream metadata and local
/// counters, not a transactional count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Entries on the stream not yet delivered to the group. Acknowledged
    /// entries stay on the stream until trimmed or age-expired, so this
    /// overcounts by however many of those remain.
    pub pending: usize,

    /// Entries delivered and awaiting acknowledgment.
    pub processing: usize,

    /// Messages processed successfully by this process.
    pub completed: u64,

    /// Handler failures observed by this process (including retried ones).
    pub failed: u64,

    /// Entries currently on the dead-letter queue.
    pub dead_lettered: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let opts = QueueOptions::default();
        assert_eq!(opts.max_length, 10_000);
        assert_eq!(opts.max_age, Duration::from_secs(86_400));
        assert_eq!(opts.idempotency_window, Duration::from_secs(300));
        assert_eq!(opts.visibility_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_group_name_falls_back_to_queue_derived() {
        let opts = QueueOptions::default();
        assert_eq!(opts.group_for("invoices"), "invoices-group");

        let opts = QueueOptions {
            group_name: Some("billing".to_string()),
            ..QueueOptions::default()
        };
        assert_eq!(opts.group_for("invoices"), "billing");
    }
}
