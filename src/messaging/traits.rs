//! # Driver and Handler Traits
//!
//! Core trait definitions for backend-agnostic messaging.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::codec::JsonCodec;
use super::message::{Job, Message, TopicConfig, TopicInfo};
use super::retry::RetryPolicy;
use super::stats::BrokerStats;
use super::subscription::SubscriptionHandle;
use crate::config::DriverKind;
use crate::error::BrokerResult;

/// Callback invoked once per delivered message
///
/// Closures of the form `|msg: Message| async move { ... }` implement this
/// trait directly.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        (self)(message).await
    }
}

/// Callback invoked once per claimed job
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, job: Job) -> anyhow::Result<()> {
        (self)(job).await
    }
}

/// Operations every backend adapter provides
///
/// Foreground operations return in bounded time; callers impose deadlines by
/// dropping or racing the future. Subscribe-style operations spawn a consumer
/// task bound to a child of the supplied token, and also stop when the
/// driver is closed.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    fn kind(&self) -> DriverKind;

    /// Back-off and retry ceiling for failed deliveries
    fn retry_policy(&self) -> &RetryPolicy;

    /// Message built by this driver's helpers; carries the configured retry ceiling
    fn new_message(&self, topic: &str, payload: Vec<u8>) -> Message {
        Message::new(topic, payload).with_max_retries(self.retry_policy().max_retries)
    }

    /// Deliver to every current subscriber of `topic`
    async fn publish(&self, topic: &str, message: Message) -> BrokerResult<()>;

    /// Wrap a JSON value in a fresh message and publish it
    ///
    /// Object keys serialize in sorted order, which keeps the encoding canonical.
    async fn publish_json(&self, topic: &str, data: &serde_json::Value) -> BrokerResult<()> {
        let payload = JsonCodec.encode(data)?;
        self.publish(topic, self.new_message(topic, payload)).await
    }

    /// Publish so that no subscriber sees the message before now + `delay`
    async fn publish_with_delay(
        &self,
        topic: &str,
        message: Message,
        delay: Duration,
    ) -> BrokerResult<()>;

    /// Anonymous subscription
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> BrokerResult<SubscriptionHandle>;

    /// Competing-consumer subscription within `group`
    async fn subscribe_with_group(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> BrokerResult<SubscriptionHandle>;

    async fn enqueue_job(&self, queue: &str, job: Job) -> BrokerResult<()>;

    /// Claim jobs from `queue` until cancelled
    async fn process_jobs(
        &self,
        queue: &str,
        handler: Arc<dyn JobHandler>,
        cancel: CancellationToken,
    ) -> BrokerResult<SubscriptionHandle>;

    async fn create_topic(&self, topic: &str, config: &TopicConfig) -> BrokerResult<()>;

    async fn delete_topic(&self, topic: &str) -> BrokerResult<()>;

    async fn topic_info(&self, topic: &str) -> BrokerResult<TopicInfo>;

    async fn ping(&self) -> BrokerResult<()>;

    /// Idempotent hard shutdown
    async fn close(&self) -> BrokerResult<()>;

    fn stats(&self) -> BrokerStats;
}
