//! # Partitioned-Log Driver
//!
//! Kafka-protocol implementation of the [`Driver`] contract using `rdkafka`.
//!
//! - **Publish**: record key = message id; identity, retry state, user
//!   headers, and `meta_` metadata travel as record headers.
//! - **Groups**: each subscription runs its own consumer in the group (the
//!   configured `group_id` when anonymous), so members of one group split
//!   partitions and distinct groups each see every record.
//! - **Delay**: records go to `<topic>.delayed` and a [`DelayRelay`] per
//!   satellite topic republishes them when due.
//! - **Jobs**: topic `jobs.<queue>` consumed by group `<group_id>.jobs`.
//!   Priority is not expressible on a log and is ignored.

pub mod client;
pub mod delay;

pub use delay::{DelayRelay, OffsetTracker};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::metadata::Metadata;
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::client::{Consumed, Delivery, Record};
use self::delay::{satellite_topic, DELAYED_UNTIL, ORIGINAL_DELAY};
use super::core::{DriverCore, Outcome, StopSignal};
use crate::config::{DriverKind, LogConfig};
use crate::error::{BrokerError, BrokerResult};
use crate::messaging::codec::{due_at, format_duration, JsonCodec};
use crate::messaging::headers::{from_wire_headers, to_wire_headers, META_PREFIX};
use crate::messaging::message::{Job, Message, TopicConfig, TopicInfo};
use crate::messaging::retry::RetryPolicy;
use crate::messaging::stats::BrokerStats;
use crate::messaging::subscription::SubscriptionHandle;
use crate::messaging::traits::{Driver, JobHandler, MessageHandler};

const DRIVER: &str = "log";

/// Pause after a failed receive before polling again
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

pub fn job_topic(queue: &str) -> String {
    format!("jobs.{queue}")
}

fn message_record(message: &Message) -> Record {
    Record {
        key: message.id.clone(),
        payload: message.payload.clone(),
        headers: to_wire_headers(message),
    }
}

/// Satellite copy of `message` carrying its due time
fn delayed_message(message: &Message, delay: Duration) -> Message {
    message
        .clone()
        .with_metadata(DELAYED_UNTIL, json!(due_at(Utc::now(), delay)))
        .with_metadata(ORIGINAL_DELAY, json!(format_duration(delay)))
}

fn job_record(job: &Job) -> BrokerResult<Record> {
    let mut headers = vec![("job_id".to_string(), job.id.clone())];
    if !job.delay.is_zero() {
        headers.push((
            format!("{META_PREFIX}{DELAYED_UNTIL}"),
            due_at(Utc::now(), job.delay).to_string(),
        ));
        headers.push((
            format!("{META_PREFIX}{ORIGINAL_DELAY}"),
            json!(format_duration(job.delay)).to_string(),
        ));
    }
    Ok(Record {
        key: job.id.clone(),
        payload: JsonCodec.encode_job(job)?,
        headers,
    })
}

fn consumed_message(topic: &str, record: Consumed) -> Message {
    from_wire_headers(topic, record.payload, record.headers)
}

#[derive(Debug, Clone)]
enum ConsumeTarget {
    Topic(String),
    Jobs(String),
}

struct LogInner {
    core: DriverCore,
    config: LogConfig,
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    /// Metadata lookups only
    metadata_client: Arc<BaseConsumer>,
    /// Satellite topics with a running relay
    relays: DashSet<String>,
    topics: DashMap<String, DateTime<Utc>>,
    queues: DashSet<String>,
}

impl LogInner {
    fn delivery(&self) -> Delivery {
        Delivery::for_config(&self.config)
    }

    fn timeout(&self) -> Duration {
        self.config.operation_timeout()
    }

    fn note_topic(&self, topic: &str) {
        self.topics.entry(topic.to_string()).or_insert_with(Utc::now);
    }

    /// Start the relay for `topic` unless one is already running
    fn ensure_relay(&self, topic: &str) -> BrokerResult<()> {
        let satellite = satellite_topic(topic);
        if self.relays.contains(&satellite) {
            return Ok(());
        }
        let relay = DelayRelay::new(&self.config, topic, self.producer.clone())?;
        if self.relays.insert(satellite) {
            self.core.spawn_background(relay.run(self.core.lifetime()));
        }
        Ok(())
    }

    async fn send(&self, topic: &str, message: &Message) -> BrokerResult<()> {
        client::produce(&self.producer, topic, &message_record(message), self.delivery()).await?;
        self.note_topic(topic);
        Ok(())
    }

    async fn send_delayed(&self, topic: &str, message: &Message, delay: Duration) -> BrokerResult<()> {
        if delay.is_zero() {
            return self.send(topic, message).await;
        }
        self.ensure_relay(topic)?;
        let parked = delayed_message(message, delay);
        client::produce(
            &self.producer,
            &satellite_topic(topic),
            &message_record(&parked),
            self.delivery(),
        )
        .await?;
        self.note_topic(topic);
        Ok(())
    }

    async fn send_job(&self, queue: &str, job: &Job) -> BrokerResult<()> {
        let topic = job_topic(queue);
        let record = job_record(job)?;
        let target = if job.delay.is_zero() {
            topic
        } else {
            self.ensure_relay(&topic)?;
            satellite_topic(&topic)
        };
        client::produce(&self.producer, &target, &record, self.delivery()).await?;
        self.queues.insert(queue.to_string());
        Ok(())
    }

    fn build_consumer(&self, group: &str, topic: &str) -> BrokerResult<StreamConsumer> {
        let consumer: StreamConsumer =
            client::consumer_config(&self.config, group, self.config.enable_auto_commit)
                .create()
                .map_err(|e| BrokerError::connection(DRIVER, format!("consumer: {e}")))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| BrokerError::backend(DRIVER, "subscribe", e))?;
        Ok(consumer)
    }

    fn commit(&self, consumer: &StreamConsumer, topic: &str, partition: i32, offset: i64) {
        if self.config.enable_auto_commit {
            return;
        }
        let mut offsets = TopicPartitionList::new();
        if offsets
            .add_partition_offset(topic, partition, Offset::Offset(offset + 1))
            .is_ok()
        {
            if let Err(e) = consumer.commit(&offsets, CommitMode::Async) {
                warn!(driver = DRIVER, topic = %topic, partition, error = %e, "Commit failed");
            }
        }
    }

    async fn handle_message(&self, topic: &str, record: Consumed, handler: &dyn MessageHandler) {
        let message = consumed_message(topic, record);
        if let Outcome::Retry(retry, delay) = self.core.dispatch_message(handler, message).await {
            if let Err(e) = self.send_delayed(topic, &retry, delay).await {
                warn!(driver = DRIVER, topic = %topic, message_id = %retry.id, error = %e, "Retry republish failed");
            }
        }
    }

    async fn handle_job(&self, queue: &str, record: Consumed, handler: &dyn JobHandler) {
        let job = match JsonCodec.decode_job(&record.payload) {
            Ok(job) => job,
            Err(e) => {
                warn!(driver = DRIVER, queue = %queue, error = %e, "Discarding undecodable job");
                return;
            }
        };
        if let Outcome::Retry(job, _) = self.core.dispatch_job(handler, job).await {
            if let Err(e) = self.send_job(queue, &job).await {
                warn!(driver = DRIVER, queue = %queue, job_id = %job.id, error = %e, "Job re-enqueue failed");
            }
        }
    }

    /// Receive until stopped; librdkafka rejoins the group after rebalances
    async fn consume(
        self: Arc<Self>,
        target: ConsumeTarget,
        consumer: StreamConsumer,
        message_handler: Option<Arc<dyn MessageHandler>>,
        job_handler: Option<Arc<dyn JobHandler>>,
        stop: StopSignal,
    ) {
        let topic = match &target {
            ConsumeTarget::Topic(topic) => topic.clone(),
            ConsumeTarget::Jobs(queue) => job_topic(queue),
        };

        loop {
            let received = tokio::select! {
                _ = stop.wait() => break,
                received = consumer.recv() => received.map(|m| Consumed::from_borrowed(&m)),
            };

            let record = match received {
                Ok(record) => record,
                Err(e) => {
                    warn!(driver = DRIVER, topic = %topic, error = %e, "Receive failed");
                    if !stop.sleep(RECEIVE_BACKOFF).await {
                        break;
                    }
                    continue;
                }
            };

            let (partition, offset) = (record.partition, record.offset);
            match (&target, &message_handler, &job_handler) {
                (ConsumeTarget::Topic(topic), Some(handler), _) => {
                    self.handle_message(topic, record, handler.as_ref()).await;
                }
                (ConsumeTarget::Jobs(queue), _, Some(handler)) => {
                    self.handle_job(queue, record, handler.as_ref()).await;
                }
                _ => {}
            }
            self.commit(&consumer, &topic, partition, offset);
        }

        consumer.unsubscribe();
        debug!(driver = DRIVER, topic = %topic, "Consumer stopped");
    }

    fn subscribe_inner(
        self: &Arc<Self>,
        topic: &str,
        group: Option<&str>,
        handler: Arc<dyn MessageHandler>,
        cancel: &CancellationToken,
    ) -> BrokerResult<SubscriptionHandle> {
        self.core.ensure_open()?;
        let consumer_group = group.unwrap_or(&self.config.group_id).to_string();
        let consumer = self.build_consumer(&consumer_group, topic)?;
        self.ensure_relay(topic)?;
        self.note_topic(topic);

        info!(driver = DRIVER, topic = %topic, group = %consumer_group, "Subscribed");
        let inner = Arc::clone(self);
        let target = ConsumeTarget::Topic(topic.to_string());
        Ok(self.core.spawn_consumer(topic, group, cancel, move |stop| {
            inner.consume(target, consumer, Some(handler), None, stop)
        }))
    }

    async fn metadata(&self, topic: Option<&str>) -> BrokerResult<Metadata> {
        let metadata_client = Arc::clone(&self.metadata_client);
        let topic = topic.map(str::to_string);
        let timeout = self.timeout();
        tokio::task::spawn_blocking(move || {
            metadata_client.fetch_metadata(topic.as_deref(), Timeout::After(timeout))
        })
        .await
        .map_err(|e| BrokerError::backend(DRIVER, "fetch_metadata", e))?
        .map_err(|e| client::map_error("fetch_metadata", e, 0))
    }

    fn admin_options(&self) -> AdminOptions {
        AdminOptions::new().operation_timeout(Some(Timeout::After(self.timeout())))
    }
}

/// Partitioned-log driver
#[derive(Clone)]
pub struct LogDriver {
    inner: Arc<LogInner>,
}

impl std::fmt::Debug for LogDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogDriver")
            .field("brokers", &self.inner.config.brokers)
            .field("group_id", &self.inner.config.group_id)
            .finish()
    }
}

impl LogDriver {
    /// Build the producer and admin client and verify the cluster answers
    pub async fn connect(config: &LogConfig, retry: RetryPolicy) -> BrokerResult<Self> {
        let producer: FutureProducer = client::producer_config(config)
            .create()
            .map_err(|e| BrokerError::connection(DRIVER, format!("producer: {e}")))?;
        let admin: AdminClient<DefaultClientContext> = client::base_config(config)
            .create()
            .map_err(|e| BrokerError::connection(DRIVER, format!("admin client: {e}")))?;
        let metadata_client: BaseConsumer = client::metadata_config(config)
            .create()
            .map_err(|e| BrokerError::connection(DRIVER, format!("metadata client: {e}")))?;

        let core = DriverCore::new(DriverKind::Log, retry);
        let inner = Arc::new(LogInner {
            core,
            config: config.clone(),
            producer,
            admin,
            metadata_client: Arc::new(metadata_client),
            relays: DashSet::new(),
            topics: DashMap::new(),
            queues: DashSet::new(),
        });

        let metadata = inner
            .metadata(None)
            .await
            .map_err(|e| BrokerError::connection(DRIVER, e.to_string()))?;
        inner.core.stats.set_active_connections(metadata.brokers().len() as u64);

        info!(
            driver = DRIVER,
            brokers = %config.brokers.join(","),
            reachable = metadata.brokers().len(),
            "Log broker driver ready"
        );
        Ok(Self { inner })
    }

    /// Number of delay relays running in this process
    pub fn relay_count(&self) -> usize {
        self.inner.relays.len()
    }
}

#[async_trait]
impl Driver for LogDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Log
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
        self.inner.subscribe_inner(topic, None, handler, &cancel)
    }

    async fn subscribe_with_group(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> BrokerResult<SubscriptionHandle> {
        self.inner.subscribe_inner(topic, Some(group), handler, &cancel)
    }

    async fn enqueue_job(&self, queue: &str, mut job: Job) -> BrokerResult<()> {
        self.inner.core.ensure_open()?;
        job.queue = queue.to_string();
        self.inner.send_job(queue, &job).await?;
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
        let topic = job_topic(queue);
        let group = format!("{}.jobs", self.inner.config.group_id);
        let consumer = self.inner.build_consumer(&group, &topic)?;
        self.inner.ensure_relay(&topic)?;
        self.inner.queues.insert(queue.to_string());

        info!(driver = DRIVER, queue = %queue, "Processing jobs");
        let inner = Arc::clone(&self.inner);
        let target = ConsumeTarget::Jobs(queue.to_string());
        Ok(self.inner.core.spawn_consumer(queue, None, &cancel, move |stop| {
            inner.consume(target, consumer, None, Some(handler), stop)
        }))
    }

    async fn create_topic(&self, topic: &str, config: &TopicConfig) -> BrokerResult<()> {
        self.inner.core.ensure_open()?;

        if let Ok(info) = self.topic_info(topic).await {
            debug!(driver = DRIVER, topic = %topic, partitions = info.partitions, "Topic already exists");
            self.inner.note_topic(topic);
            return Ok(());
        }

        let mut new_topic = NewTopic::new(
            topic,
            config.partitions,
            TopicReplication::Fixed(config.replication_factor),
        );
        for (key, value) in &config.entries {
            new_topic = new_topic.set(key, value);
        }

        let results = self
            .inner
            .admin
            .create_topics(&[new_topic], &self.inner.admin_options())
            .await
            .map_err(|e| client::map_error("create_topic", e, 0))?;

        for result in results {
            match result {
                Ok(_) | Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((name, code)) => {
                    return Err(BrokerError::backend(DRIVER, "create_topic", format!("{name}: {code}")));
                }
            }
        }

        self.inner.note_topic(topic);
        info!(driver = DRIVER, topic = %topic, partitions = config.partitions, "Topic created");
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> BrokerResult<()> {
        self.inner.core.ensure_open()?;
        let results = self
            .inner
            .admin
            .delete_topics(&[topic], &self.inner.admin_options())
            .await
            .map_err(|e| client::map_error("delete_topic", e, 0))?;

        for result in results {
            match result {
                Ok(_) => {}
                Err((_, RDKafkaErrorCode::UnknownTopicOrPartition)) => {
                    return Err(BrokerError::topic_not_found(topic));
                }
                Err((name, code)) => {
                    return Err(BrokerError::backend(DRIVER, "delete_topic", format!("{name}: {code}")));
                }
            }
        }

        self.inner.topics.remove(topic);
        info!(driver = DRIVER, topic = %topic, "Topic deleted");
        Ok(())
    }

    async fn topic_info(&self, topic: &str) -> BrokerResult<TopicInfo> {
        self.inner.core.ensure_open()?;
        let metadata = self.inner.metadata(Some(topic)).await?;

        let found = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic && t.error().is_none() && !t.partitions().is_empty());
        let Some(found) = found else {
            return Err(BrokerError::topic_not_found(topic));
        };

        let replication_factor = found
            .partitions()
            .first()
            .map(|p| p.replicas().len() as i32)
            .unwrap_or(1);

        Ok(TopicInfo {
            name: topic.to_string(),
            partitions: found.partitions().len() as i32,
            replication_factor,
            message_count: 0,
            created_at: self
                .inner
                .topics
                .get(topic)
                .map(|t| *t.value())
                .unwrap_or_else(Utc::now),
        })
    }

    async fn ping(&self) -> BrokerResult<()> {
        self.inner.core.ensure_open()?;
        let metadata = self.inner.metadata(None).await?;
        if metadata.brokers().is_empty() {
            return Err(BrokerError::not_connected(DRIVER));
        }
        self.inner
            .core
            .stats
            .set_active_connections(metadata.brokers().len() as u64);
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.inner.core.begin_close() {
            return Ok(());
        }
        self.inner.relays.clear();

        // Records queued in the producer are delivered before it goes away
        let producer = self.inner.producer.clone();
        let timeout = self.inner.timeout();
        let flushed = tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| BrokerError::backend(DRIVER, "flush", e))?;
        if let Err(e) = flushed {
            warn!(driver = DRIVER, error = %e, "Producer flush incomplete at close");
            return Err(client::map_error("flush", e, 0));
        }

        info!(driver = DRIVER, "Log broker driver closed");
        Ok(())
    }

    fn stats(&self) -> BrokerStats {
        let config = &self.inner.config;
        let info = HashMap::from([
            ("brokers".to_string(), json!(config.brokers)),
            ("group_id".to_string(), json!(config.group_id)),
            ("compression".to_string(), json!(config.compression.as_str())),
            ("required_acks".to_string(), json!(config.required_acks)),
            ("return_successes".to_string(), json!(config.return_successes)),
            ("delay_relays".to_string(), json!(self.inner.relays.len())),
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
    use crate::messaging::codec::from_unix;
    use crate::messaging::headers::MESSAGE_ID;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[test]
    fn test_message_record_keys_by_id() {
        let message = Message::new("orders", b"{}".to_vec())
            .with_header("trace", "t")
            .with_timestamp(from_unix(1_700_000_000));
        let record = message_record(&message);
        assert_eq!(record.key, message.id);
        assert!(record.headers.iter().any(|(k, v)| k == MESSAGE_ID && v == &message.id));

        let consumed = Consumed {
            partition: 0,
            offset: 4,
            key: Some(record.key.clone()),
            payload: record.payload.clone(),
            headers: record.headers.clone(),
        };
        assert_eq!(consumed_message("orders", consumed), message);
    }

    #[test]
    fn test_delayed_message_carries_due_time() {
        let message = Message::new("orders", Vec::new());
        let parked = delayed_message(&message, Duration::from_secs(3));
        let due = parked.metadata.get(DELAYED_UNTIL).and_then(|v| v.as_i64()).unwrap();
        assert!(due >= Utc::now().timestamp() + 2);
        assert_eq!(parked.metadata.get(ORIGINAL_DELAY), Some(&json!("3s")));

        let record = message_record(&parked);
        assert_eq!(delay::due_time(&record.headers), Some(due));
    }

    #[test]
    fn test_delayed_job_record_has_due_header() {
        let job = Job::new("emails", "send", b"x".to_vec()).with_delay(Duration::from_secs(5));
        let record = job_record(&job).unwrap();
        assert!(delay::due_time(&record.headers).is_some());
        assert_eq!(JsonCodec.decode_job(&record.payload).unwrap().id, job.id);
        assert_eq!(job_topic("emails"), "jobs.emails");
    }

    // Integration tests require a Kafka-compatible cluster. Run with:
    //   LOG_BROKERS=localhost:9092 cargo test log -- --ignored

    fn config_from_env() -> LogConfig {
        LogConfig {
            brokers: std::env::var("LOG_BROKERS")
                .unwrap_or_else(|_| "localhost:9092".to_string())
                .split(',')
                .map(str::to_string)
                .collect(),
            group_id: format!("test-{}", Uuid::new_v4()),
            initial_offset: crate::config::InitialOffset::Oldest,
            ..Default::default()
        }
    }

    #[tokio::test]
    #[ignore = "requires Kafka running"]
    async fn test_log_group_split() {
        let driver = LogDriver::connect(&config_from_env(), RetryPolicy::immediate(0))
            .await
            .unwrap();
        let topic = format!("split_{}", Uuid::new_v4());
        driver
            .create_topic(&topic, &TopicConfig::default().with_partitions(3))
            .await
            .unwrap();
        assert_eq!(driver.topic_info(&topic).await.unwrap().partitions, 3);

        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, String)>();
        let mut subs = Vec::new();
        for member in 0..2 {
            let tx = tx.clone();
            let handler = move |msg: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((member, msg.id));
                    Ok::<(), anyhow::Error>(())
                }
            };
            subs.push(
                driver
                    .subscribe_with_group(&topic, "g", Arc::new(handler), CancellationToken::new())
                    .await
                    .unwrap(),
            );
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        for n in 0..100 {
            driver
                .publish(&topic, Message::new(&topic, format!("{n}").into_bytes()))
                .await
                .unwrap();
        }

        let mut by_member: HashMap<usize, Vec<String>> = HashMap::new();
        for _ in 0..100 {
            let (member, id) = tokio::time::timeout(Duration::from_secs(20), rx.recv())
                .await
                .unwrap()
                .unwrap();
            by_member.entry(member).or_default().push(id);
        }
        assert_eq!(by_member.len(), 2);
        assert_eq!(by_member.values().map(Vec::len).sum::<usize>(), 100);
        driver.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Kafka running"]
    async fn test_log_topic_info_missing() {
        let driver = LogDriver::connect(&config_from_env(), RetryPolicy::default())
            .await
            .unwrap();
        let result = driver.topic_info(&format!("missing_{}", Uuid::new_v4())).await;
        assert!(matches!(result, Err(BrokerError::TopicNotFound { .. })));
        driver.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Kafka running"]
    async fn test_log_unconfirmed_publishes_flushed_on_close() {
        let topic = format!("flush_{}", Uuid::new_v4());
        let writer_config = LogConfig {
            return_successes: false,
            ..config_from_env()
        };
        let writer = LogDriver::connect(&writer_config, RetryPolicy::immediate(0))
            .await
            .unwrap();
        writer.create_topic(&topic, &TopicConfig::default()).await.unwrap();
        for n in 0..20 {
            writer
                .publish(&topic, Message::new(&topic, format!("{n}").into_bytes()))
                .await
                .unwrap();
        }
        writer.close().await.unwrap();

        let reader = LogDriver::connect(&config_from_env(), RetryPolicy::immediate(0))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let handler = move |msg: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg.id);
                Ok::<(), anyhow::Error>(())
            }
        };
        let _sub = reader
            .subscribe(&topic, Arc::new(handler), CancellationToken::new())
            .await
            .unwrap();

        for _ in 0..20 {
            tokio::time::timeout(Duration::from_secs(20), rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        reader.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Kafka running"]
    async fn test_log_topic_lookup_does_not_create_topic() {
        let driver = LogDriver::connect(&config_from_env(), RetryPolicy::default())
            .await
            .unwrap();
        let topic = format!("lookup_{}", Uuid::new_v4());
        for _ in 0..2 {
            assert!(matches!(
                driver.topic_info(&topic).await,
                Err(BrokerError::TopicNotFound { .. })
            ));
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        driver.close().await.unwrap();
    }
}
