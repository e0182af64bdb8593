//! End-to-end delivery tests against the in-memory broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use message_queue::{
    ConsumeOptions, FnHandler, Message, MessageQueue, PublishOptions, QueueOptions,
};
use serde_json::json;
use stream_broker::InMemoryBroker;
use tokio::sync::Mutex;

fn fast_queue_options() -> QueueOptions {
    QueueOptions {
        retry_base_delay: Duration::from_millis(1),
        retry_max_delay: Duration::from_millis(4),
        ..QueueOptions::default()
    }
}

fn fast_consume_options() -> ConsumeOptions {
    ConsumeOptions {
        block_timeout: Duration::from_millis(20),
        ..ConsumeOptions::default()
    }
}

fn manager() -> Arc<MessageQueue<InMemoryBroker>> {
    Arc::new(MessageQueue::new(InMemoryBroker::new()))
}

/// Drives retry sweeps until `check` passes or the deadline expires.
async fn drive_until<F>(mq: &Arc<MessageQueue<InMemoryBroker>>, mut check: F)
where
    F: AsyncFnMut() -> bool,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        mq.sweep_once().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}

#[tokio::test]
async fn test_successful_handler_acks_messages() {
    let mq = manager();
    let processed = Arc::new(AtomicU32::new(0));

    mq.create_queue("q", fast_queue_options()).await.unwrap();
    let counter = Arc::clone(&processed);
    mq.consume(
        "q",
        Arc::new(FnHandler(move |_msg: Message| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })),
        fast_consume_options(),
    )
    .await
    .unwrap();

    for n in 0..3 {
        mq.publish("q", json!({"id": format!("m-{n}")}), PublishOptions::default())
            .await
            .unwrap();
    }

    drive_until(&mq, async || processed.load(Ordering::SeqCst) == 3).await;
    let stats = mq.get_queue_stats("q").await.unwrap();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.dead_lettered, 0);
    mq.shutdown().await;
}

#[tokio::test]
async fn test_failing_messages_dead_letter_with_exhausted_retries() {
    let mq = manager();
    mq.create_queue("q", fast_queue_options()).await.unwrap();
    mq.consume(
        "q",
        Arc::new(FnHandler(|_msg: Message| async {
            Err::<(), _>("always fails".into())
        })),
        fast_consume_options(),
    )
    .await
    .unwrap();

    for n in 0..5 {
        mq.publish(
            "q",
            json!({"id": format!("m-{n}")}),
            PublishOptions {
                max_retries: Some(2),
                ..PublishOptions::default()
            },
        )
        .await
        .unwrap();
    }

    drive_until(&mq, async || {
        mq.get_queue_stats("q").await.unwrap().dead_lettered == 5
    })
    .await;
    mq.shutdown().await;

    let dead = mq.read_dead_letters("q", 100).await.unwrap();
    assert_eq!(dead.len(), 5);
    for msg in &dead {
        assert_eq!(msg.retries, 2);
        assert_eq!(msg.max_retries, 2);
        assert_eq!(msg.original_queue.as_deref(), Some("q"));
        assert_eq!(msg.last_error.as_deref(), Some("always fails"));
        assert!(msg.failed_at.is_some());
    }

    // Each logical message is dead-lettered exactly once.
    let mut ids: Vec<&str> = dead.iter().map(|m| m.logical_id.as_str()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 5);
}

#[tokio::test]
async fn test_idempotency_window_suppresses_duplicate_logical_ids() {
    let mq = manager();
    let invocations = Arc::new(AtomicU32::new(0));

    mq.create_queue("q", fast_queue_options()).await.unwrap();
    let counter = Arc::clone(&invocations);
    mq.consume(
        "q",
        Arc::new(FnHandler(move |_msg: Message| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })),
        fast_consume_options(),
    )
    .await
    .unwrap();

    mq.publish("q", json!({"n": 1}), PublishOptions::with_id("dup-1"))
        .await
        .unwrap();
    mq.publish("q", json!({"n": 1}), PublishOptions::with_id("dup-1"))
        .await
        .unwrap();

    drive_until(&mq, async || {
        // Both deliveries acked: nothing left processing.
        let stats = mq.get_queue_stats("q").await.unwrap();
        stats.processing == 0 && stats.completed >= 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    mq.shutdown().await;
}

#[tokio::test]
async fn test_competing_consumers_never_double_process() {
    let mq = manager();
    let seen: Arc<Mutex<HashMap<String, u32>>> = Arc::new(Mutex::new(HashMap::new()));

    // Idempotency must not mask group semantics here, so every message
    // carries a distinct logical ID and we count raw invocations.
    mq.create_queue("q", fast_queue_options()).await.unwrap();
    for consumer in ["worker-a", "worker-b"] {
        let seen = Arc::clone(&seen);
        mq.consume(
            "q",
            Arc::new(FnHandler(move |msg: Message| {
                let seen = Arc::clone(&seen);
                async move {
                    *seen.lock().await.entry(msg.logical_id.clone()).or_insert(0) += 1;
                    Ok(())
                }
            })),
            ConsumeOptions {
                consumer_name: Some(consumer.to_string()),
                ..fast_consume_options()
            },
        )
        .await
        .unwrap();
    }
    assert_eq!(mq.consumer_count("q").await, 2);

    for n in 0..20 {
        mq.publish("q", json!({"id": format!("m-{n}")}), PublishOptions::default())
            .await
            .unwrap();
    }

    drive_until(&mq, async || seen.lock().await.len() == 20).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    mq.shutdown().await;

    let seen = seen.lock().await;
    for (id, count) in seen.iter() {
        assert_eq!(*count, 1, "message {id} processed {count} times");
    }
}

#[tokio::test]
async fn test_handler_timeout_counts_as_failure() {
    let mq = manager();
    mq.create_queue("q", fast_queue_options()).await.unwrap();
    mq.consume(
        "q",
        Arc::new(FnHandler(|_msg: Message| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })),
        ConsumeOptions {
            processing_timeout: Some(Duration::from_millis(20)),
            ..fast_consume_options()
        },
    )
    .await
    .unwrap();

    mq.publish(
        "q",
        json!({"id": "slow-1"}),
        PublishOptions {
            max_retries: Some(1),
            ..PublishOptions::default()
        },
    )
    .await
    .unwrap();

    drive_until(&mq, async || {
        mq.get_queue_stats("q").await.unwrap().dead_lettered == 1
    })
    .await;
    mq.shutdown().await;

    let dead = mq.read_dead_letters("q", 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].last_error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_publish_batch_delivers_every_message() {
    let mq = manager();
    let processed = Arc::new(AtomicU32::new(0));

    mq.create_queue("q", fast_queue_options()).await.unwrap();
    let counter = Arc::clone(&processed);
    mq.consume(
        "q",
        Arc::new(FnHandler(move |_msg: Message| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })),
        fast_consume_options(),
    )
    .await
    .unwrap();

    let ids = mq
        .publish_batch(
            "q",
            vec![json!({"id": "b-1"}), json!({"id": "b-2"}), json!({"id": "b-3"})],
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);

    drive_until(&mq, async || processed.load(Ordering::SeqCst) == 3).await;
    mq.shutdown().await;
}

#[tokio::test]
async fn test_redrive_returns_dead_letters_to_the_queue() {
    let mq = manager();
    let attempts = Arc::new(AtomicU32::new(0));

    mq.create_queue("q", fast_queue_options()).await.unwrap();
    // Fail the first delivery cascade, succeed after redrive.
    let counter = Arc::clone(&attempts);
    mq.consume(
        "q",
        Arc::new(FnHandler(move |_msg: Message| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 1 {
                    Err("transient outage".into())
                } else {
                    Ok(())
                }
            }
        })),
        fast_consume_options(),
    )
    .await
    .unwrap();

    mq.publish(
        "q",
        json!({"id": "r-1"}),
        PublishOptions {
            max_retries: Some(1),
            ..PublishOptions::default()
        },
    )
    .await
    .unwrap();

    drive_until(&mq, async || {
        mq.get_queue_stats("q").await.unwrap().dead_lettered == 1
    })
    .await;

    let redriven = mq.redrive_dead_letters("q").await.unwrap();
    assert_eq!(redriven, 1);

    drive_until(&mq, async || {
        mq.get_queue_stats("q").await.unwrap().dead_lettered == 0
            && attempts.load(Ordering::SeqCst) >= 2
    })
    .await;
    mq.shutdown().await;
    assert!(mq.read_dead_letters("q", 10).await.unwrap().is_empty());
}
