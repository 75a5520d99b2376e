//! Driver-bound operation scope.
//!
//! A [`DriverScope`] pins one driver plus a deadline and a cancellation
//! token. Every foreground call races both; subscriptions started through
//! the scope also stop when its token is cancelled.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::DriverKind;
use crate::error::{BrokerError, BrokerResult};
use crate::messaging::codec::JsonCodec;
use crate::messaging::message::{Job, Message, TopicConfig, TopicInfo};
use crate::messaging::provider::BrokerDriver;
use crate::messaging::stats::BrokerStats;
use crate::messaging::subscription::SubscriptionHandle;
use crate::messaging::traits::{Driver, JobHandler, MessageHandler};

#[derive(Debug, Clone)]
pub struct DriverScope {
    driver: Arc<BrokerDriver>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl DriverScope {
    pub(crate) fn new(driver: Arc<BrokerDriver>, timeout: Duration) -> Self {
        Self {
            driver,
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn kind(&self) -> DriverKind {
        self.driver.kind()
    }

    pub fn driver(&self) -> &Arc<BrokerDriver> {
        &self.driver
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> BrokerResult<T>
    where
        F: Future<Output = BrokerResult<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(BrokerError::cancelled(operation));
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BrokerError::cancelled(operation)),
            result = tokio::time::timeout(self.timeout, fut) => match result {
                Ok(result) => result,
                Err(_) => Err(BrokerError::timeout(
                    operation,
                    u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                )),
            },
        }
    }

    pub async fn publish(&self, topic: &str, message: Message) -> BrokerResult<()> {
        self.bounded("publish", self.driver.publish(topic, message)).await
    }

    pub async fn publish_json<T: Serialize + ?Sized>(&self, topic: &str, data: &T) -> BrokerResult<()> {
        let payload = JsonCodec.encode(data)?;
        self.publish(topic, self.driver.new_message(topic, payload)).await
    }

    pub async fn publish_with_delay(
        &self,
        topic: &str,
        message: Message,
        delay: Duration,
    ) -> BrokerResult<()> {
        self.bounded(
            "publish_with_delay",
            self.driver.publish_with_delay(topic, message, delay),
        )
        .await
    }

    pub async fn subscribe<H: MessageHandler>(
        &self,
        topic: &str,
        handler: H,
    ) -> BrokerResult<SubscriptionHandle> {
        self.bounded(
            "subscribe",
            self.driver
                .subscribe(topic, Arc::new(handler), self.cancel.clone()),
        )
        .await
    }

    pub async fn subscribe_with_group<H: MessageHandler>(
        &self,
        topic: &str,
        group: &str,
        handler: H,
    ) -> BrokerResult<SubscriptionHandle> {
        self.bounded(
            "subscribe_with_group",
            self.driver
                .subscribe_with_group(topic, group, Arc::new(handler), self.cancel.clone()),
        )
        .await
    }

    pub async fn enqueue_job(&self, queue: &str, job: Job) -> BrokerResult<()> {
        self.bounded("enqueue_job", self.driver.enqueue_job(queue, job))
            .await
    }

    pub async fn process_jobs<H: JobHandler>(
        &self,
        queue: &str,
        handler: H,
    ) -> BrokerResult<SubscriptionHandle> {
        self.bounded(
            "process_jobs",
            self.driver
                .process_jobs(queue, Arc::new(handler), self.cancel.clone()),
        )
        .await
    }

    pub async fn create_topic(&self, topic: &str, config: &TopicConfig) -> BrokerResult<()> {
        self.bounded("create_topic", self.driver.create_topic(topic, config))
            .await
    }

    pub async fn delete_topic(&self, topic: &str) -> BrokerResult<()> {
        self.bounded("delete_topic", self.driver.delete_topic(topic))
            .await
    }

    pub async fn topic_info(&self, topic: &str) -> BrokerResult<TopicInfo> {
        self.bounded("topic_info", self.driver.topic_info(topic)).await
    }

    pub async fn ping(&self) -> BrokerResult<()> {
        self.bounded("ping", self.driver.ping()).await
    }

    pub fn stats(&self) -> BrokerStats {
        self.driver.stats()
    }
}
