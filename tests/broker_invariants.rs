//! # Broker Invariant Tests
//!
//! Driver-contract properties exercised end to end through the manager on
//! the in-memory driver.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use unified_broker::messaging::codec::from_unix;
use unified_broker::{BrokerError, BrokerManager, DriverKind, Job, Message};

use common::{eventually, memory_config, memory_manager, Sink};

#[tokio::test]
async fn test_round_trip_fidelity() {
    let manager = memory_manager().await;
    let sink = Sink::new();
    manager.subscribe("orders", sink.handler()).await.unwrap();

    let mut original = Message::new("orders", br#"{"sku":"A-1"}"#.to_vec())
        .with_header("trace", "abc")
        .with_metadata("tenant", json!(7))
        .with_max_retries(5)
        .with_timestamp(from_unix(1_700_000_000));
    original.retry_count = 1;

    manager.publish("orders", original.clone()).await.unwrap();
    assert!(eventually(Duration::from_secs(2), || sink.len() == 1).await);

    let received = &sink.messages()[0];
    assert_eq!(received.id, original.id);
    assert_eq!(received.payload, original.payload);
    assert_eq!(received.timestamp.timestamp(), original.timestamp.timestamp());
    assert_eq!(received.headers, original.headers);
    assert_eq!(received.metadata, original.metadata);
    assert_eq!(received.retry_count, 1);
    assert_eq!(received.max_retries, 5);

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_group_members_split_messages() {
    let manager = memory_manager().await;
    let members: Vec<Sink> = (0..3).map(|_| Sink::new()).collect();
    for sink in &members {
        manager
            .subscribe_with_group("work", "g", sink.handler())
            .await
            .unwrap();
    }

    let mut published = Vec::new();
    for n in 0..30 {
        let message = Message::new("work", format!("{n}").into_bytes());
        published.push(message.id.clone());
        manager.publish("work", message).await.unwrap();
    }

    let total = || members.iter().map(Sink::len).sum::<usize>();
    assert!(eventually(Duration::from_secs(2), || total() == 30).await);

    let mut delivered: Vec<String> = members.iter().flat_map(Sink::ids).collect();
    delivered.sort();
    published.sort();
    assert_eq!(delivered, published);
    assert!(members.iter().all(|m| m.len() > 0));

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_distinct_groups_each_receive_everything() {
    let manager = memory_manager().await;
    let sinks: Vec<Sink> = (0..3).map(|_| Sink::new()).collect();
    for (i, sink) in sinks.iter().enumerate() {
        manager
            .subscribe_with_group("events", &format!("group-{i}"), sink.handler())
            .await
            .unwrap();
    }
    let anonymous = Sink::new();
    manager.subscribe("events", anonymous.handler()).await.unwrap();

    for n in 0..10 {
        manager.publish_json("events", &json!({ "n": n })).await.unwrap();
    }

    assert!(
        eventually(Duration::from_secs(2), || {
            sinks.iter().all(|s| s.len() == 10) && anonymous.len() == 10
        })
        .await
    );

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_delay_floor() {
    let manager = memory_manager().await;
    let arrivals = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&arrivals);
    manager
        .subscribe("later", move |_msg: Message| {
            sink.lock().push(Instant::now());
            std::future::ready(Ok::<(), anyhow::Error>(()))
        })
        .await
        .unwrap();

    let delay = Duration::from_millis(300);
    let started = Instant::now();
    manager
        .publish_with_delay("later", Message::new("later", Vec::new()), delay)
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(3), || arrivals.lock().len() == 1).await);
    let waited = arrivals.lock()[0].duration_since(started);
    assert!(waited >= delay, "delivered after {waited:?}");
    assert!(waited < delay + Duration::from_secs(2));

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_priority_jobs_run_first() {
    let manager = memory_manager().await;
    for n in 0..3 {
        manager
            .enqueue_job("q", Job::new("q", "h", format!("f{n}").into_bytes()))
            .await
            .unwrap();
    }
    for n in 0..3 {
        manager
            .enqueue_job(
                "q",
                Job::new("q", "h", format!("p{n}").into_bytes()).with_priority(10),
            )
            .await
            .unwrap();
    }

    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&order);
    manager
        .process_jobs("q", move |job: Job| {
            sink.lock().push(String::from_utf8_lossy(&job.payload).into_owned());
            std::future::ready(Ok::<(), anyhow::Error>(()))
        })
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(2), || order.lock().len() == 6).await);
    let order = order.lock().clone();
    assert!(order[..3].iter().all(|p| p.starts_with('p')));
    assert!(order[3..].iter().all(|p| p.starts_with('f')));

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_retry_cap() {
    let manager = memory_manager().await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    manager
        .subscribe("flaky", move |_msg: Message| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err::<(), _>(anyhow::anyhow!("always fails")))
        })
        .await
        .unwrap();

    manager
        .publish("flaky", Message::new("flaky", Vec::new()).with_max_retries(3))
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 4).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let stats = manager.stats().await;
    assert_eq!(stats["memory"].messages_failed, 4);

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_configured_retry_cap_applies_to_json_publishes() {
    let mut config = memory_config();
    config.retry.max_retries = 1;
    let manager = BrokerManager::new(config).await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    manager
        .subscribe("capped", move |msg: Message| {
            assert_eq!(msg.max_retries, 1);
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err::<(), _>(anyhow::anyhow!("always fails")))
        })
        .await
        .unwrap();

    manager.publish_json("capped", &json!({"n": 1})).await.unwrap();

    assert!(eventually(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 2).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_job_is_retried_with_attempts() {
    let manager = memory_manager().await;
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&attempts);
    manager
        .process_jobs("retry", move |job: Job| {
            sink.lock().push(job.attempts);
            let result = if job.attempts < 2 {
                Err(anyhow::anyhow!("transient"))
            } else {
                Ok(())
            };
            std::future::ready(result)
        })
        .await
        .unwrap();

    manager
        .enqueue_job("retry", Job::new("retry", "h", Vec::new()).with_max_attempts(3))
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(2), || attempts.lock().len() == 2).await);
    assert_eq!(*attempts.lock(), vec![1, 2]);

    let driver = manager.driver(DriverKind::Memory).await.unwrap();
    use unified_broker::Driver;
    // The processed counter lands after the handler returns.
    assert!(eventually(Duration::from_secs(1), || driver.stats().jobs_processed == 1).await);
    assert_eq!(driver.stats().jobs_failed, 1);

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_close_idempotence() {
    let manager = memory_manager().await;
    let driver = manager.driver(DriverKind::Memory).await.unwrap();

    manager.close().await.unwrap();
    manager.close().await.unwrap();

    assert!(matches!(
        manager.publish("t", Message::new("t", Vec::new())).await,
        Err(BrokerError::BrokerClosed { .. })
    ));
    assert!(matches!(
        manager.enqueue_job("q", Job::new("q", "h", Vec::new())).await,
        Err(BrokerError::BrokerClosed { .. })
    ));

    use unified_broker::Driver;
    assert!(matches!(
        driver.publish("t", Message::new("t", Vec::new())).await,
        Err(BrokerError::BrokerClosed { .. })
    ));
    driver.close().await.unwrap();
}

#[tokio::test]
async fn test_health_snapshot_follows_backend() {
    let manager = memory_manager().await;
    let driver = manager.driver(DriverKind::Memory).await.unwrap();
    let memory = driver.as_memory().unwrap().clone();

    assert_eq!(manager.health_check().await.get("memory"), Some(&true));

    memory.set_available(false);
    // Two probe intervals plus slack
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(manager.health_check().await.get("memory"), Some(&false));
    let status = &manager.health_status().await["memory"];
    assert!(status.last_error.is_some());

    memory.set_available(true);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(manager.health_check().await.get("memory"), Some(&true));

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_stats_monotonic_and_connections_drop() {
    let manager = memory_manager().await;
    let sink = Sink::new();
    manager.subscribe("s", sink.handler()).await.unwrap();

    let mut last: HashMap<&str, u64> = HashMap::new();
    for round in 0..5 {
        manager.publish_json("s", &json!({ "round": round })).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = manager.default_stats().await.unwrap();
        assert!(stats.messages_published >= last.get("published").copied().unwrap_or(0));
        assert!(stats.messages_consumed >= last.get("consumed").copied().unwrap_or(0));
        last.insert("published", stats.messages_published);
        last.insert("consumed", stats.messages_consumed);
    }
    assert_eq!(last["published"], 5);

    let driver = manager.driver(DriverKind::Memory).await.unwrap();
    use unified_broker::Driver;
    assert_eq!(driver.stats().active_connections, 1);
    manager.close().await.unwrap();
    assert_eq!(driver.stats().active_connections, 0);
    assert_eq!(driver.stats().messages_published, 5);
}

#[tokio::test]
async fn test_broadcast_encodes_once_and_reports_failed_topic() {
    let manager = memory_manager().await;
    let a = Sink::new();
    let b = Sink::new();
    manager.subscribe("a", a.handler()).await.unwrap();
    manager.subscribe("b", b.handler()).await.unwrap();

    manager
        .broadcast(&["a", "b"], &json!({"event": "deploy"}))
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(2), || a.len() == 1 && b.len() == 1).await);
    assert_eq!(a.messages()[0].payload, b.messages()[0].payload);
    assert_ne!(a.messages()[0].id, b.messages()[0].id);

    let memory = manager
        .driver(DriverKind::Memory)
        .await
        .unwrap()
        .as_memory()
        .unwrap()
        .clone();
    memory.set_available(false);
    match manager.broadcast(&["a", "b"], &json!({})).await {
        Err(BrokerError::FanOutFailed { target, source }) => {
            assert_eq!(target, "a");
            assert!(matches!(*source, BrokerError::NotConnected { .. }));
        }
        other => panic!("expected fan-out failure, got {other:?}"),
    }

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_subscription_stops_receiving() {
    let manager = memory_manager().await;
    let sink = Sink::new();
    let handle = manager.subscribe("c", sink.handler()).await.unwrap();
    assert_eq!(handle.target(), "c");

    manager.publish_json("c", &json!(1)).await.unwrap();
    assert!(eventually(Duration::from_secs(1), || sink.len() == 1).await);

    handle.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle.join())
        .await
        .unwrap();

    manager.publish_json("c", &json!(2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.len(), 1);

    manager.close().await.unwrap();
}
