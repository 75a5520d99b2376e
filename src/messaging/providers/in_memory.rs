//! # In-Memory Driver
//!
//! Process-local implementation of the full driver contract, used for tests
//! and single-process development.
//!
//! ## Semantics
//!
//! - **Fan-out**: every anonymous subscriber receives every message
//! - **Groups**: members of a group take turns (round-robin), one delivery per group
//! - **Delay**: messages and jobs are parked on a timer until due
//! - **Jobs**: priority jobs (priority > 0) are claimed before FIFO jobs
//! - **Outages**: [`InMemoryDriver::set_available`] simulates losing the backend

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::core::{DriverCore, Outcome, StopSignal};
use crate::config::DriverKind;
use crate::error::{BrokerError, BrokerResult};
use crate::messaging::message::{Job, Message, TopicConfig, TopicInfo};
use crate::messaging::retry::RetryPolicy;
use crate::messaging::stats::BrokerStats;
use crate::messaging::subscription::SubscriptionHandle;
use crate::messaging::traits::{Driver, JobHandler, MessageHandler};

/// How long an idle job worker waits before re-checking its queue
const IDLE_POLL: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct Subscriber {
    id: Uuid,
    group: Option<String>,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Debug)]
struct TopicState {
    created_at: DateTime<Utc>,
    published: u64,
    subscribers: Vec<Subscriber>,
    /// Next member index per group
    cursors: HashMap<String, usize>,
}

impl TopicState {
    fn new() -> Self {
        Self {
            created_at: Utc::now(),
            published: 0,
            subscribers: Vec::new(),
            cursors: HashMap::new(),
        }
    }

    fn deliver(&mut self, message: &Message) {
        self.published += 1;
        self.subscribers.retain(|s| !s.tx.is_closed());

        let mut grouped: HashMap<&str, Vec<usize>> = HashMap::new();
        for (index, subscriber) in self.subscribers.iter().enumerate() {
            match &subscriber.group {
                None => {
                    let _ = subscriber.tx.send(message.clone());
                }
                Some(group) => grouped.entry(group.as_str()).or_default().push(index),
            }
        }

        for (group, members) in grouped {
            let cursor = self.cursors.entry(group.to_string()).or_insert(0);
            let chosen = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            let _ = self.subscribers[chosen].tx.send(message.clone());
        }
    }
}

#[derive(Debug)]
struct PriorityJob {
    priority: i32,
    seq: u64,
    job: Job,
}

impl PartialEq for PriorityJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PriorityJob {}

impl PartialOrd for PriorityJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityJob {
    // Max-heap: higher priority first, then earlier enqueue.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    priority: BinaryHeap<PriorityJob>,
    fifo: VecDeque<Job>,
    seq: u64,
}

#[derive(Debug)]
struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl JobQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn push(&self, job: Job) {
        {
            let mut state = self.state.lock();
            state.seq += 1;
            if job.is_priority() {
                let seq = state.seq;
                state.priority.push(PriorityJob {
                    priority: job.priority,
                    seq,
                    job,
                });
            } else {
                state.fifo.push_back(job);
            }
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Job> {
        let mut state = self.state.lock();
        match state.priority.pop() {
            Some(entry) => Some(entry.job),
            None => state.fifo.pop_front(),
        }
    }

    fn len(&self) -> usize {
        let state = self.state.lock();
        state.priority.len() + state.fifo.len()
    }
}

#[derive(Debug)]
struct MemoryInner {
    core: DriverCore,
    available: AtomicBool,
    topics: DashMap<String, TopicState>,
    queues: DashMap<String, Arc<JobQueue>>,
}

impl MemoryInner {
    fn ensure_ready(&self) -> BrokerResult<()> {
        self.core.ensure_open()?;
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BrokerError::not_connected(self.core.name()))
        }
    }

    fn deliver(&self, topic: &str, message: &Message) {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(TopicState::new)
            .deliver(message);
    }

    /// Deliver now or park on a timer until due
    fn schedule(self: &Arc<Self>, topic: &str, message: Message, delay: Duration) {
        if delay.is_zero() {
            self.deliver(topic, &message);
            return;
        }
        let inner = Arc::clone(self);
        let topic = topic.to_string();
        let stop = self.core.lifetime();
        self.core.spawn_background(async move {
            if stop.sleep(delay).await {
                inner.deliver(&topic, &message);
            }
        });
    }

    fn queue(&self, name: &str) -> Arc<JobQueue> {
        Arc::clone(
            self.queues
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(JobQueue::new()))
                .value(),
        )
    }

    fn schedule_job(self: &Arc<Self>, queue: &str, job: Job) {
        let target = self.queue(queue);
        if job.delay.is_zero() {
            target.push(job);
            return;
        }
        let stop = self.core.lifetime();
        let delay = job.delay;
        self.core.spawn_background(async move {
            if stop.sleep(delay).await {
                target.push(job);
            }
        });
    }

    async fn run_subscriber(
        self: Arc<Self>,
        topic: String,
        id: Uuid,
        mut rx: mpsc::UnboundedReceiver<Message>,
        handler: Arc<dyn MessageHandler>,
        stop: StopSignal,
    ) {
        loop {
            let message = tokio::select! {
                _ = stop.wait() => break,
                received = rx.recv() => match received {
                    Some(message) => message,
                    None => break,
                },
            };

            if let Outcome::Retry(retry, delay) =
                self.core.dispatch_message(handler.as_ref(), message).await
            {
                self.schedule(&topic, retry, delay);
            }
        }

        if let Some(mut state) = self.topics.get_mut(&topic) {
            state.subscribers.retain(|s| s.id != id);
        }
        debug!(topic = %topic, subscriber = %id, "In-memory subscriber stopped");
    }

    async fn run_worker(
        self: Arc<Self>,
        name: String,
        queue: Arc<JobQueue>,
        handler: Arc<dyn JobHandler>,
        stop: StopSignal,
    ) {
        while !stop.is_stopped() {
            let Some(job) = queue.pop() else {
                tokio::select! {
                    _ = stop.wait() => break,
                    _ = queue.notify.notified() => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
                continue;
            };

            if let Outcome::Retry(job, _) = self.core.dispatch_job(handler.as_ref(), job).await {
                self.schedule_job(&name, job);
            }
        }
        debug!(queue = %name, "In-memory job worker stopped");
    }

    fn subscribe_inner(
        self: &Arc<Self>,
        topic: &str,
        group: Option<&str>,
        handler: Arc<dyn MessageHandler>,
        cancel: &CancellationToken,
    ) -> BrokerResult<SubscriptionHandle> {
        self.ensure_ready()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.topics
            .entry(topic.to_string())
            .or_insert_with(TopicState::new)
            .subscribers
            .push(Subscriber {
                id,
                group: group.map(str::to_string),
                tx,
            });

        let inner = Arc::clone(self);
        let owned_topic = topic.to_string();
        Ok(self
            .core
            .spawn_consumer(topic, group, cancel, move |stop| {
                inner.run_subscriber(owned_topic, id, rx, handler, stop)
            }))
    }
}

/// Process-local driver
#[derive(Debug, Clone)]
pub struct InMemoryDriver {
    inner: Arc<MemoryInner>,
}

impl Default for InMemoryDriver {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl InMemoryDriver {
    pub fn new(retry: RetryPolicy) -> Self {
        let core = DriverCore::new(DriverKind::Memory, retry);
        core.stats.set_active_connections(1);
        info!("In-memory broker driver ready");
        Self {
            inner: Arc::new(MemoryInner {
                core,
                available: AtomicBool::new(true),
                topics: DashMap::new(),
                queues: DashMap::new(),
            }),
        }
    }

    /// Simulate losing (false) or regaining (true) the backend
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Release);
        self.inner
            .core
            .stats
            .set_active_connections(u64::from(available && !self.inner.core.is_closed()));
    }

    /// Jobs waiting in `queue`, not counting parked delayed jobs
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner.queues.get(queue).map(|q| q.len()).unwrap_or(0)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .map(|t| t.subscribers.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Driver for InMemoryDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Memory
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.core.retry
    }

    async fn publish(&self, topic: &str, mut message: Message) -> BrokerResult<()> {
        self.inner.ensure_ready()?;
        message.ensure_id();
        self.inner.deliver(topic, &message);
        self.inner.core.stats.record_published();
        Ok(())
    }

    async fn publish_with_delay(
        &self,
        topic: &str,
        mut message: Message,
        delay: Duration,
    ) -> BrokerResult<()> {
        self.inner.ensure_ready()?;
        message.ensure_id();
        self.inner.schedule(topic, message, delay);
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
        self.inner.ensure_ready()?;
        job.queue = queue.to_string();
        self.inner.schedule_job(queue, job);
        self.inner.core.stats.record_job_enqueued();
        Ok(())
    }

    async fn process_jobs(
        &self,
        queue: &str,
        handler: Arc<dyn JobHandler>,
        cancel: CancellationToken,
    ) -> BrokerResult<SubscriptionHandle> {
        self.inner.ensure_ready()?;
        let target = self.inner.queue(queue);
        let inner = Arc::clone(&self.inner);
        let name = queue.to_string();
        Ok(self
            .inner
            .core
            .spawn_consumer(queue, None, &cancel, move |stop| {
                inner.run_worker(name, target, handler, stop)
            }))
    }

    async fn create_topic(&self, topic: &str, _config: &TopicConfig) -> BrokerResult<()> {
        self.inner.ensure_ready()?;
        self.inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(TopicState::new);
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> BrokerResult<()> {
        self.inner.ensure_ready()?;
        // Dropping the senders ends every consumer on the topic.
        self.inner.topics.remove(topic);
        Ok(())
    }

    async fn topic_info(&self, topic: &str) -> BrokerResult<TopicInfo> {
        self.inner.ensure_ready()?;
        let state = self
            .inner
            .topics
            .get(topic)
            .ok_or_else(|| BrokerError::topic_not_found(topic))?;
        Ok(TopicInfo {
            name: topic.to_string(),
            partitions: 1,
            replication_factor: 1,
            message_count: state.published,
            created_at: state.created_at,
        })
    }

    async fn ping(&self) -> BrokerResult<()> {
        self.inner.ensure_ready()
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.inner.core.begin_close() {
            self.inner.topics.clear();
            self.inner.queues.clear();
            info!("In-memory broker driver closed");
        }
        Ok(())
    }

    fn stats(&self) -> BrokerStats {
        let subscribers: usize = self
            .inner
            .topics
            .iter()
            .map(|t| t.subscribers.len())
            .sum();
        let mut info = HashMap::new();
        info.insert("subscribers".to_string(), serde_json::json!(subscribers));
        info.insert(
            "available".to_string(),
            serde_json::json!(self.inner.available.load(Ordering::Relaxed)),
        );
        self.inner.core.stats.snapshot(
            self.inner.core.name(),
            self.inner.topics.len() as u64,
            self.inner.queues.len() as u64,
            info,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn collecting_handler(sink: Arc<Mutex<Vec<Message>>>) -> Arc<dyn MessageHandler> {
        Arc::new(move |msg: Message| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(msg);
                Ok::<(), anyhow::Error>(())
            }
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_priority_jobs_claimed_first() {
        let driver = InMemoryDriver::default();
        driver
            .enqueue_job("q", Job::new("q", "h", b"a".to_vec()))
            .await
            .unwrap();
        driver
            .enqueue_job("q", Job::new("q", "h", b"b".to_vec()).with_priority(10))
            .await
            .unwrap();
        driver
            .enqueue_job("q", Job::new("q", "h", b"c".to_vec()).with_priority(5))
            .await
            .unwrap();
        assert_eq!(driver.queue_depth("q"), 3);

        let order = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&order);
        let handle = driver
            .process_jobs(
                "q",
                Arc::new(move |job: Job| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.lock().push(String::from_utf8_lossy(&job.payload).into_owned());
                        Ok::<(), anyhow::Error>(())
                    }
                }),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        settle().await;
        handle.shutdown().await;
        assert_eq!(*order.lock(), vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn test_group_round_robin() {
        let driver = InMemoryDriver::default();
        let a = Arc::new(Mutex::new(Vec::new()));
        let b = Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();
        driver
            .subscribe_with_group("t", "g", collecting_handler(Arc::clone(&a)), token.clone())
            .await
            .unwrap();
        driver
            .subscribe_with_group("t", "g", collecting_handler(Arc::clone(&b)), token.clone())
            .await
            .unwrap();

        for i in 0u8..10 {
            driver
                .publish("t", Message::new("t", vec![i]))
                .await
                .unwrap();
        }
        settle().await;

        assert_eq!(a.lock().len(), 5);
        assert_eq!(b.lock().len(), 5);
        token.cancel();
    }

    #[tokio::test]
    async fn test_cancel_removes_subscriber() {
        let driver = InMemoryDriver::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = driver
            .subscribe(
                "t",
                Arc::new(move |_msg: Message| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), anyhow::Error>(())
                    }
                }),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(driver.subscriber_count("t"), 1);

        handle.shutdown().await;
        assert_eq!(driver.subscriber_count("t"), 0);

        driver.publish("t", Message::new("t", Vec::new())).await.unwrap();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unavailable_backend() {
        let driver = InMemoryDriver::default();
        driver.set_available(false);
        assert!(matches!(
            driver.ping().await,
            Err(BrokerError::NotConnected { .. })
        ));
        assert!(driver.publish("t", Message::new("t", Vec::new())).await.is_err());
        driver.set_available(true);
        assert!(driver.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_topic_info() {
        let driver = InMemoryDriver::default();
        assert!(matches!(
            driver.topic_info("missing").await,
            Err(BrokerError::TopicNotFound { .. })
        ));
        driver.create_topic("t", &TopicConfig::default()).await.unwrap();
        driver.publish("t", Message::new("t", Vec::new())).await.unwrap();
        let info = driver.topic_info("t").await.unwrap();
        assert_eq!(info.partitions, 1);
        assert_eq!(info.message_count, 1);

        driver.delete_topic("t").await.unwrap();
        assert!(driver.topic_info("t").await.is_err());
    }
}
