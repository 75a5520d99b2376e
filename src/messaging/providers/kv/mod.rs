//! # KV Driver
//!
//! Key-value store implementation of the [`Driver`] contract using `redis`.
//!
//! - **Pub/sub**: JSON envelopes on a channel named after the topic. Every
//!   subscriber sees every message; group labels only namespace the
//!   subscription key, so groups here are fan-out, not competing consumers.
//! - **Delay**: sorted set `delayed:<topic>` drained by one [`DelayDispatcher`]
//!   per topic per process.
//! - **Jobs**: FIFO list `queue:<name>`, priority set `priority:<name>`
//!   (score = -priority), and delayed set `delayed_jobs:<name>`.
//!
//! There is no back-pressure: a slow subscriber buffers in its pub/sub
//! connection.

mod conn;
pub mod delay;
pub mod keys;

pub use delay::DelayDispatcher;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use self::conn::{map_error, KvConnection};
use super::core::{DriverCore, Outcome, StopSignal};
use crate::config::{DriverKind, KvConfig};
use crate::error::{BrokerError, BrokerResult};
use crate::messaging::codec::{JsonCodec, MessageEnvelope};
use crate::messaging::message::{Job, Message, TopicConfig, TopicInfo};
use crate::messaging::retry::RetryPolicy;
use crate::messaging::stats::BrokerStats;
use crate::messaging::subscription::SubscriptionHandle;
use crate::messaging::traits::{Driver, JobHandler, MessageHandler};

const DRIVER: &str = "kv";

#[derive(Debug, Clone, Copy)]
struct TopicRecord {
    created_at: DateTime<Utc>,
    published: u64,
}

impl TopicRecord {
    fn new() -> Self {
        Self {
            created_at: Utc::now(),
            published: 0,
        }
    }
}

/// Decode a channel payload, wrapping foreign payloads in a fresh message
fn decode_payload(topic: &str, payload: &[u8]) -> Message {
    match JsonCodec.decode_message(payload) {
        Ok(message) => message,
        Err(e) => {
            debug!(driver = DRIVER, topic = %topic, error = %e, "Payload is not an envelope; wrapping raw bytes");
            Message::new(topic, payload.to_vec())
        }
    }
}

struct KvInner {
    core: DriverCore,
    config: KvConfig,
    client: Client,
    conn: KvConnection,
    /// Subscription key to owning subscription id
    subscriptions: DashMap<String, Uuid>,
    /// Sorted-set key of every running dispatcher
    dispatchers: DashSet<String>,
    topics: DashMap<String, TopicRecord>,
    queues: DashSet<String>,
}

impl KvInner {
    fn note_topic(&self, topic: &str) -> dashmap::mapref::one::RefMut<'_, String, TopicRecord> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(TopicRecord::new)
    }

    /// Start `dispatcher` unless one already drains the same key
    fn ensure_dispatcher(self: &Arc<Self>, dispatcher: DelayDispatcher) {
        if !self.dispatchers.insert(dispatcher.key().to_string()) {
            return;
        }
        let conn = self.conn.clone();
        let stop = self.core.lifetime();
        self.core.spawn_background(dispatcher.run(conn, stop));
    }

    async fn send(&self, topic: &str, message: &Message) -> BrokerResult<()> {
        let payload = JsonCodec.encode_message(message)?;
        let receivers: i64 = self
            .conn
            .query("publish", redis::cmd("PUBLISH").arg(topic).arg(payload))
            .await?;
        self.note_topic(topic).published += 1;
        debug!(driver = DRIVER, topic = %topic, message_id = %message.id, receivers, "Published");
        Ok(())
    }

    async fn send_delayed(
        self: &Arc<Self>,
        topic: &str,
        message: &Message,
        delay: Duration,
    ) -> BrokerResult<()> {
        if delay.is_zero() {
            return self.send(topic, message).await;
        }

        let envelope = MessageEnvelope::try_from(message)?.delayed(Utc::now(), delay);
        let due = envelope.execute_at.unwrap_or_default();
        let payload = JsonCodec.encode(&envelope)?;
        let _: i64 = self
            .conn
            .query(
                "zadd",
                redis::cmd("ZADD").arg(keys::delayed(topic)).arg(due).arg(payload),
            )
            .await?;

        self.note_topic(topic).published += 1;
        self.ensure_dispatcher(DelayDispatcher::for_topic(topic, self.config.poll_interval()));
        Ok(())
    }

    async fn push_job(self: &Arc<Self>, queue: &str, job: &Job) -> BrokerResult<()> {
        let payload = JsonCodec.encode_job(job)?;
        let cmd = if !job.delay.is_zero() {
            let due = crate::messaging::codec::due_at(Utc::now(), job.delay);
            self.ensure_dispatcher(DelayDispatcher::for_jobs(queue, self.config.poll_interval()));
            let mut cmd = redis::cmd("ZADD");
            cmd.arg(keys::delayed_jobs(queue)).arg(due).arg(payload);
            cmd
        } else if job.is_priority() {
            let mut cmd = redis::cmd("ZADD");
            cmd.arg(keys::priority(queue))
                .arg(keys::priority_score(job.priority))
                .arg(payload);
            cmd
        } else {
            let mut cmd = redis::cmd("LPUSH");
            cmd.arg(keys::queue(queue)).arg(payload);
            cmd
        };

        let _: i64 = self.conn.query("enqueue_job", &cmd).await?;
        self.queues.insert(queue.to_string());
        Ok(())
    }

    /// Open a pub/sub connection subscribed to `topic`
    async fn open_pubsub(&self, topic: &str) -> BrokerResult<redis::aio::PubSub> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| map_error("pubsub_connect", e))?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| map_error("subscribe", e))?;
        Ok(pubsub)
    }

    async fn run_subscriber(
        self: Arc<Self>,
        topic: String,
        key: String,
        id: Uuid,
        first: redis::aio::PubSub,
        handler: Arc<dyn MessageHandler>,
        stop: StopSignal,
    ) {
        let mut pubsub = Some(first);

        while !stop.is_stopped() {
            let Some(current) = pubsub.take() else {
                if !stop.sleep(self.config.poll_interval()).await {
                    break;
                }
                match self.open_pubsub(&topic).await {
                    Ok(resumed) => {
                        info!(driver = DRIVER, topic = %topic, "Subscription resumed");
                        pubsub = Some(resumed);
                    }
                    Err(e) => warn!(driver = DRIVER, topic = %topic, error = %e, "Resubscribe failed"),
                }
                continue;
            };

            let mut stream = current.into_on_message();
            loop {
                let received = tokio::select! {
                    _ = stop.wait() => break,
                    received = stream.next() => received,
                };
                let Some(msg) = received else {
                    warn!(driver = DRIVER, topic = %topic, "Pub/sub connection lost");
                    break;
                };

                let message = decode_payload(&topic, msg.get_payload_bytes());
                if let Outcome::Retry(retry, delay) =
                    self.core.dispatch_message(handler.as_ref(), message).await
                {
                    if let Err(e) = self.send_delayed(&topic, &retry, delay).await {
                        warn!(driver = DRIVER, topic = %topic, message_id = %retry.id, error = %e, "Retry republish failed");
                    }
                }
            }
        }

        self.subscriptions.remove_if(&key, |_, owner| *owner == id);
        debug!(driver = DRIVER, topic = %topic, key = %key, "Subscriber stopped");
    }

    async fn subscribe_inner(
        self: &Arc<Self>,
        topic: &str,
        group: Option<&str>,
        handler: Arc<dyn MessageHandler>,
        cancel: &CancellationToken,
    ) -> BrokerResult<SubscriptionHandle> {
        self.core.ensure_open()?;

        let key = keys::subscription(topic, group);
        let id = Uuid::new_v4();
        match self.subscriptions.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(BrokerError::already_subscribed(key));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let pubsub = match self.open_pubsub(topic).await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                self.subscriptions.remove_if(&key, |_, owner| *owner == id);
                return Err(e);
            }
        };
        self.note_topic(topic);
        self.ensure_dispatcher(DelayDispatcher::for_topic(topic, self.config.poll_interval()));

        info!(driver = DRIVER, topic = %topic, group = ?group, "Subscribed");
        let inner = Arc::clone(self);
        let owned_topic = topic.to_string();
        Ok(self.core.spawn_consumer(topic, group, cancel, move |stop| {
            inner.run_subscriber(owned_topic, key, id, pubsub, handler, stop)
        }))
    }

    /// Pop the highest-priority job without blocking
    async fn pop_priority(&self, queue: &str) -> BrokerResult<Option<String>> {
        let popped: Vec<(String, f64)> = self
            .conn
            .query("zpopmin", redis::cmd("ZPOPMIN").arg(keys::priority(queue)).arg(1))
            .await?;
        Ok(popped.into_iter().next().map(|(entry, _)| entry))
    }

    async fn blocking_conn(&self) -> BrokerResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| map_error("worker_connect", e))
    }

    /// Next job: priority set first, then a bounded blocking pop on the list
    async fn claim(
        &self,
        queue: &str,
        blocking: &mut Option<MultiplexedConnection>,
    ) -> BrokerResult<Option<String>> {
        if let Some(entry) = self.pop_priority(queue).await? {
            return Ok(Some(entry));
        }

        if blocking.is_none() {
            *blocking = Some(self.blocking_conn().await?);
        }
        let Some(conn) = blocking.as_mut() else {
            return Ok(None);
        };

        let popped: redis::RedisResult<Option<(String, String)>> = redis::cmd("BRPOP")
            .arg(keys::queue(queue))
            .arg(self.config.block_timeout().as_secs_f64())
            .query_async(conn)
            .await;

        match popped {
            Ok(popped) => Ok(popped.map(|(_, entry)| entry)),
            Err(e) => {
                *blocking = None;
                Err(map_error("brpop", e))
            }
        }
    }

    async fn run_worker(
        self: Arc<Self>,
        queue: String,
        handler: Arc<dyn JobHandler>,
        stop: StopSignal,
    ) {
        let mut blocking = None;

        while !stop.is_stopped() {
            let claimed = tokio::select! {
                _ = stop.wait() => break,
                claimed = self.claim(&queue, &mut blocking) => claimed,
            };

            let entry = match claimed {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    warn!(driver = DRIVER, queue = %queue, error = %e, "Job claim failed");
                    if !stop.sleep(self.config.poll_interval()).await {
                        break;
                    }
                    continue;
                }
            };

            let job = match JsonCodec.decode_job(entry.as_bytes()) {
                Ok(job) => job,
                Err(e) => {
                    warn!(driver = DRIVER, queue = %queue, error = %e, "Discarding undecodable job");
                    continue;
                }
            };

            if let Outcome::Retry(job, _) = self.core.dispatch_job(handler.as_ref(), job).await {
                if let Err(e) = self.push_job(&queue, &job).await {
                    warn!(driver = DRIVER, queue = %queue, job_id = %job.id, error = %e, "Job re-enqueue failed");
                }
            }
        }
        debug!(driver = DRIVER, queue = %queue, "Job worker stopped");
    }
}

/// Key-value store driver
#[derive(Clone)]
pub struct KvDriver {
    inner: Arc<KvInner>,
}

impl std::fmt::Debug for KvDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvDriver")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("db", &self.inner.config.db)
            .finish()
    }
}

impl KvDriver {
    pub async fn connect(config: &KvConfig, retry: RetryPolicy) -> BrokerResult<Self> {
        let client = conn::build_client(config).await?;
        let conn = KvConnection::connect(&client, config).await?;

        let core = DriverCore::new(DriverKind::Kv, retry);
        core.stats.set_active_connections(1);
        if let Some(interval) = conn.reap_interval() {
            let pool = conn.clone();
            let stop = core.lifetime();
            core.spawn_background(async move {
                while stop.sleep(interval).await {
                    let closed = pool.reap_idle();
                    if closed > 0 {
                        debug!(driver = DRIVER, closed, "Closed idle pool connections");
                    }
                }
            });
        }
        info!(
            driver = DRIVER,
            host = %config.host,
            port = config.port,
            db = config.db,
            pool_size = conn.pool_size(),
            "KV broker driver ready"
        );

        Ok(Self {
            inner: Arc::new(KvInner {
                core,
                config: config.clone(),
                client,
                conn,
                subscriptions: DashMap::new(),
                dispatchers: DashSet::new(),
                topics: DashMap::new(),
                queues: DashSet::new(),
            }),
        })
    }

    /// Number of delay dispatchers running in this process
    pub fn dispatcher_count(&self) -> usize {
        self.inner.dispatchers.len()
    }
}

#[async_trait]
impl Driver for KvDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Kv
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.core.retry
    }

    async fn publish(&self, topic: &str, mut message: Message) -> BrokerResult<()> {
        self.inner.core.ensure_open()?;
        message.ensure_id();
        self.inner.send(topic, &message).await?;
        self.inner.core.stats.record_published();
        Ok(())
    }

    async fn publish_with_delay(
        &self,
        topic: &str,
        mut message: Message,
        delay: Duration,
    ) -> BrokerResult<()> {
        self.inner.core.ensure_open()?;
        message.ensure_id();
        self.inner.send_delayed(topic, &message, delay).await?;
        self.inner.core.stats.record_published();
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> BrokerResult<SubscriptionHandle> {
        self.inner.subscribe_inner(topic, None, handler, &cancel).await
    }

    async fn subscribe_with_group(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> BrokerResult<SubscriptionHandle> {
        self.inner
            .subscribe_inner(topic, Some(group), handler, &cancel)
            .await
    }

    async fn enqueue_job(&self, queue: &str, mut job: Job) -> BrokerResult<()> {
        self.inner.core.ensure_open()?;
        job.queue = queue.to_string();
        self.inner.push_job(queue, &job).await?;
        self.inner.core.stats.record_job_enqueued();
        Ok(())
    }

    async fn process_jobs(
        &self,
        queue: &str,
        handler: Arc<dyn JobHandler>,
        cancel: CancellationToken,
    ) -> BrokerResult<SubscriptionHandle> {
        self.inner.core.ensure_open()?;
        self.inner.queues.insert(queue.to_string());
        self.inner
            .ensure_dispatcher(DelayDispatcher::for_jobs(queue, self.inner.config.poll_interval()));

        info!(driver = DRIVER, queue = %queue, "Processing jobs");
        let inner = Arc::clone(&self.inner);
        let owned_queue = queue.to_string();
        Ok(self.inner.core.spawn_consumer(queue, None, &cancel, move |stop| {
            inner.run_worker(owned_queue, handler, stop)
        }))
    }

    async fn create_topic(&self, topic: &str, _config: &TopicConfig) -> BrokerResult<()> {
        // Channels are implicit; only the local record changes
        self.inner.core.ensure_open()?;
        self.inner.note_topic(topic);
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> BrokerResult<()> {
        self.inner.core.ensure_open()?;
        let _: i64 = self
            .inner
            .conn
            .query("del", redis::cmd("DEL").arg(keys::delayed(topic)))
            .await?;
        self.inner.topics.remove(topic);
        Ok(())
    }

    async fn topic_info(&self, topic: &str) -> BrokerResult<TopicInfo> {
        self.inner.core.ensure_open()?;
        let record = self.inner.topics.get(topic).map(|r| *r.value());

        let record = match record {
            Some(record) => record,
            None => {
                let counts: Vec<(String, i64)> = self
                    .inner
                    .conn
                    .query("pubsub_numsub", redis::cmd("PUBSUB").arg("NUMSUB").arg(topic))
                    .await?;
                let active = counts.iter().any(|(_, subscribers)| *subscribers > 0);
                if !active {
                    return Err(BrokerError::topic_not_found(topic));
                }
                *self.inner.note_topic(topic)
            }
        };

        Ok(TopicInfo {
            name: topic.to_string(),
            partitions: 1,
            replication_factor: 1,
            message_count: record.published,
            created_at: record.created_at,
        })
    }

    async fn ping(&self) -> BrokerResult<()> {
        self.inner.core.ensure_open()?;
        let _: String = self.inner.conn.query("ping", &redis::cmd("PING")).await?;
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.inner.core.begin_close() {
            return Ok(());
        }
        self.inner.subscriptions.clear();
        self.inner.dispatchers.clear();
        info!(driver = DRIVER, "KV broker driver closed");
        Ok(())
    }

    fn stats(&self) -> BrokerStats {
        let config = &self.inner.config;
        let info = HashMap::from([
            ("host".to_string(), json!(config.host)),
            ("port".to_string(), json!(config.port)),
            ("db".to_string(), json!(config.db)),
            ("pool_size".to_string(), json!(self.inner.conn.pool_size())),
            ("open_connections".to_string(), json!(self.inner.conn.open_connections())),
            ("subscriptions".to_string(), json!(self.inner.subscriptions.len())),
            ("dispatchers".to_string(), json!(self.inner.dispatchers.len())),
        ]);
        self.inner.core.stats.snapshot(
            DRIVER,
            self.inner.topics.len() as u64,
            self.inner.queues.len() as u64,
            info,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::sync::mpsc;

    #[test]
    fn test_decode_payload_reads_envelope() {
        let original = Message::new("orders", b"{\"n\":1}".to_vec()).with_header("trace", "t");
        let bytes = JsonCodec.encode_message(&original).unwrap();
        assert_eq!(decode_payload("orders", &bytes), original);
    }

    #[test]
    fn test_decode_payload_wraps_foreign_bytes() {
        let decoded = decode_payload("orders", b"plain text");
        assert_eq!(decoded.topic, "orders");
        assert_eq!(decoded.payload, b"plain text");
        assert!(!decoded.id.is_empty());
    }

    // Integration tests require a Redis server. Run with:
    //   REDIS_HOST=localhost cargo test kv -- --ignored

    fn config_from_env() -> KvConfig {
        KvConfig {
            host: std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
            poll_interval_ms: 200,
            ..Default::default()
        }
    }

    fn collector<T: Send + 'static>() -> (mpsc::UnboundedSender<T>, mpsc::UnboundedReceiver<T>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    #[ignore = "requires Redis running"]
    async fn test_kv_echo_in_order() {
        let driver = KvDriver::connect(&config_from_env(), RetryPolicy::immediate(0))
            .await
            .unwrap();
        let (tx, mut rx) = collector::<Value>();
        let handler = move |msg: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg.json::<Value>()?);
                Ok::<(), anyhow::Error>(())
            }
        };

        let topic = format!("s1_{}", Uuid::new_v4());
        let _sub = driver
            .subscribe(&topic, Arc::new(handler), CancellationToken::new())
            .await
            .unwrap();
        driver.publish_json(&topic, &json!({"n": 1})).await.unwrap();
        driver.publish_json(&topic, &json!({"n": 2})).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let value = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(value);
        }
        assert_eq!(seen, vec![json!({"n": 1}), json!({"n": 2})]);
        driver.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Redis running"]
    async fn test_kv_duplicate_group_rejected() {
        let driver = KvDriver::connect(&config_from_env(), RetryPolicy::default())
            .await
            .unwrap();
        let handler = Arc::new(|_msg: Message| async { Ok(()) });
        let topic = format!("dup_{}", Uuid::new_v4());

        let _first = driver
            .subscribe_with_group(&topic, "g", handler.clone(), CancellationToken::new())
            .await
            .unwrap();
        let second = driver
            .subscribe_with_group(&topic, "g", handler, CancellationToken::new())
            .await;
        assert!(matches!(second, Err(BrokerError::AlreadySubscribed { .. })));
        driver.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Redis running"]
    async fn test_kv_priority_jobs_first() {
        let driver = KvDriver::connect(&config_from_env(), RetryPolicy::immediate(0))
            .await
            .unwrap();
        let queue = format!("q_{}", Uuid::new_v4());
        driver
            .enqueue_job(&queue, Job::new(&queue, "h", b"a".to_vec()))
            .await
            .unwrap();
        driver
            .enqueue_job(&queue, Job::new(&queue, "h", b"b".to_vec()).with_priority(10))
            .await
            .unwrap();

        let (tx, mut rx) = collector::<Vec<u8>>();
        let handler = move |job: Job| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(job.payload);
                Ok::<(), anyhow::Error>(())
            }
        };
        let _worker = driver
            .process_jobs(&queue, Arc::new(handler), CancellationToken::new())
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some(b"b".as_slice()));
        assert_eq!(second.as_deref(), Some(b"a".as_slice()));
        driver.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Redis running"]
    async fn test_kv_single_dispatcher_per_topic() {
        let driver = KvDriver::connect(&config_from_env(), RetryPolicy::default())
            .await
            .unwrap();
        let topic = format!("delay_{}", Uuid::new_v4());
        for _ in 0..3 {
            driver
                .publish_with_delay(&topic, Message::new(&topic, Vec::new()), Duration::from_secs(1))
                .await
                .unwrap();
        }
        assert_eq!(driver.dispatcher_count(), 1);
        driver.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Redis running"]
    async fn test_kv_due_job_moves_in_one_step() {
        let driver = KvDriver::connect(&config_from_env(), RetryPolicy::default())
            .await
            .unwrap();
        let conn = &driver.inner.conn;
        let queue = format!("move_{}", Uuid::new_v4());
        let entry = JsonCodec.encode_job(&Job::new(&queue, "h", b"x".to_vec())).unwrap();
        let _: i64 = conn
            .query(
                "zadd",
                redis::cmd("ZADD").arg(keys::delayed_jobs(&queue)).arg(0).arg(&entry),
            )
            .await
            .unwrap();

        let dispatcher = DelayDispatcher::for_jobs(&queue, Duration::from_secs(1));
        assert_eq!(dispatcher.dispatch_due(conn, Utc::now().timestamp()).await.unwrap(), 1);

        let parked: i64 = conn
            .query("zcard", redis::cmd("ZCARD").arg(keys::delayed_jobs(&queue)))
            .await
            .unwrap();
        let queued: Vec<Vec<u8>> = conn
            .query("lrange", redis::cmd("LRANGE").arg(keys::queue(&queue)).arg(0).arg(-1))
            .await
            .unwrap();
        assert_eq!(parked, 0);
        assert_eq!(queued, vec![entry]);

        // A second pass finds nothing left to claim
        assert_eq!(dispatcher.dispatch_due(conn, Utc::now().timestamp()).await.unwrap(), 0);

        let _: i64 = conn
            .query("del", redis::cmd("DEL").arg(keys::queue(&queue)))
            .await
            .unwrap();
        driver.close().await.unwrap();
    }
}
