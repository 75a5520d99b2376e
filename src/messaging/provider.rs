//! # Broker Driver Enum
//!
//! Enum dispatch over the concrete drivers. The manager stores
//! `Arc<BrokerDriver>` values and never needs a trait object for the driver
//! itself; handlers stay `Arc<dyn ...>` because they are user-supplied.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::message::{Job, Message, TopicConfig, TopicInfo};
use super::providers::{AmqpDriver, InMemoryDriver, KvDriver, LogDriver};
use super::retry::RetryPolicy;
use super::stats::BrokerStats;
use super::subscription::SubscriptionHandle;
use super::traits::{Driver, JobHandler, MessageHandler};
use crate::config::{BrokerConfig, DriverKind};
use crate::error::{BrokerError, BrokerResult};

/// One constructed driver
///
/// # Variants
///
/// - `Amqp` - exchanges and queues on an AMQP broker
/// - `Log` - partitioned topics with consumer groups
/// - `Kv` - key-value store pub/sub and lists
/// - `Memory` - in-process, for tests and single-node use
#[derive(Debug, Clone)]
pub enum BrokerDriver {
    Amqp(AmqpDriver),
    Log(LogDriver),
    Kv(KvDriver),
    Memory(InMemoryDriver),
}

impl BrokerDriver {
    /// Build the driver for `kind` from its configuration block
    pub async fn connect(kind: DriverKind, config: &BrokerConfig) -> BrokerResult<Self> {
        config.validate_for(kind)?;
        let retry = RetryPolicy::from(&config.retry);
        let missing = || BrokerError::configuration(kind.as_str(), "configuration block missing");

        let driver = match kind {
            DriverKind::Amqp => {
                let amqp = config.amqp.as_ref().ok_or_else(missing)?;
                Self::Amqp(AmqpDriver::connect(amqp, retry).await?)
            }
            DriverKind::Log => {
                let log = config.log.as_ref().ok_or_else(missing)?;
                Self::Log(LogDriver::connect(log, retry).await?)
            }
            DriverKind::Kv => {
                let kv = config.kv.as_ref().ok_or_else(missing)?;
                Self::Kv(KvDriver::connect(kv, retry).await?)
            }
            DriverKind::Memory => Self::Memory(InMemoryDriver::new(retry)),
        };

        info!(driver = %kind, "Broker driver constructed");
        Ok(driver)
    }

    /// Driver name for logging and stats keys
    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// The in-memory driver, for its test hooks
    pub fn as_memory(&self) -> Option<&InMemoryDriver> {
        match self {
            Self::Memory(d) => Some(d),
            _ => None,
        }
    }
}

impl From<InMemoryDriver> for BrokerDriver {
    fn from(driver: InMemoryDriver) -> Self {
        Self::Memory(driver)
    }
}

#[async_trait]
impl Driver for BrokerDriver {
    fn kind(&self) -> DriverKind {
        match self {
            Self::Amqp(_) => DriverKind::Amqp,
            Self::Log(_) => DriverKind::Log,
            Self::Kv(_) => DriverKind::Kv,
            Self::Memory(_) => DriverKind::Memory,
        }
    }

    fn retry_policy(&self) -> &RetryPolicy {
        match self {
            Self::Amqp(d) => d.retry_policy(),
            Self::Log(d) => d.retry_policy(),
            Self::Kv(d) => d.retry_policy(),
            Self::Memory(d) => d.retry_policy(),
        }
    }

    async fn publish(&self, topic: &str, message: Message) -> BrokerResult<()> {
        match self {
            Self::Amqp(d) => d.publish(topic, message).await,
            Self::Log(d) => d.publish(topic, message).await,
            Self::Kv(d) => d.publish(topic, message).await,
            Self::Memory(d) => d.publish(topic, message).await,
        }
    }

    async fn publish_with_delay(
        &self,
        topic: &str,
        message: Message,
        delay: Duration,
    ) -> BrokerResult<()> {
        match self {
            Self::Amqp(d) => d.publish_with_delay(topic, message, delay).await,
            Self::Log(d) => d.publish_with_delay(topic, message, delay).await,
            Self::Kv(d) => d.publish_with_delay(topic, message, delay).await,
            Self::Memory(d) => d.publish_with_delay(topic, message, delay).await,
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> BrokerResult<SubscriptionHandle> {
        match self {
            Self::Amqp(d) => d.subscribe(topic, handler, cancel).await,
            Self::Log(d) => d.subscribe(topic, handler, cancel).await,
            Self::Kv(d) => d.subscribe(topic, handler, cancel).await,
            Self::Memory(d) => d.subscribe(topic, handler, cancel).await,
        }
    }

    async fn subscribe_with_group(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> BrokerResult<SubscriptionHandle> {
        match self {
            Self::Amqp(d) => d.subscribe_with_group(topic, group, handler, cancel).await,
            Self::Log(d) => d.subscribe_with_group(topic, group, handler, cancel).await,
            Self::Kv(d) => d.subscribe_with_group(topic, group, handler, cancel).await,
            Self::Memory(d) => d.subscribe_with_group(topic, group, handler, cancel).await,
        }
    }

    async fn enqueue_job(&self, queue: &str, job: Job) -> BrokerResult<()> {
        match self {
            Self::Amqp(d) => d.enqueue_job(queue, job).await,
            Self::Log(d) => d.enqueue_job(queue, job).await,
            Self::Kv(d) => d.enqueue_job(queue, job).await,
            Self::Memory(d) => d.enqueue_job(queue, job).await,
        }
    }

    async fn process_jobs(
        &self,
        queue: &str,
        handler: Arc<dyn JobHandler>,
        cancel: CancellationToken,
    ) -> BrokerResult<SubscriptionHandle> {
        match self {
            Self::Amqp(d) => d.process_jobs(queue, handler, cancel).await,
            Self::Log(d) => d.process_jobs(queue, handler, cancel).await,
            Self::Kv(d) => d.process_jobs(queue, handler, cancel).await,
            Self::Memory(d) => d.process_jobs(queue, handler, cancel).await,
        }
    }

    async fn create_topic(&self, topic: &str, config: &TopicConfig) -> BrokerResult<()> {
        match self {
            Self::Amqp(d) => d.create_topic(topic, config).await,
            Self::Log(d) => d.create_topic(topic, config).await,
            Self::Kv(d) => d.create_topic(topic, config).await,
            Self::Memory(d) => d.create_topic(topic, config).await,
        }
    }

    async fn delete_topic(&self, topic: &str) -> BrokerResult<()> {
        match self {
            Self::Amqp(d) => d.delete_topic(topic).await,
            Self::Log(d) => d.delete_topic(topic).await,
            Self::Kv(d) => d.delete_topic(topic).await,
            Self::Memory(d) => d.delete_topic(topic).await,
        }
    }

    async fn topic_info(&self, topic: &str) -> BrokerResult<TopicInfo> {
        match self {
            Self::Amqp(d) => d.topic_info(topic).await,
            Self::Log(d) => d.topic_info(topic).await,
            Self::Kv(d) => d.topic_info(topic).await,
            Self::Memory(d) => d.topic_info(topic).await,
        }
    }

    async fn ping(&self) -> BrokerResult<()> {
        match self {
            Self::Amqp(d) => d.ping().await,
            Self::Log(d) => d.ping().await,
            Self::Kv(d) => d.ping().await,
            Self::Memory(d) => d.ping().await,
        }
    }

    async fn close(&self) -> BrokerResult<()> {
        match self {
            Self::Amqp(d) => d.close().await,
            Self::Log(d) => d.close().await,
            Self::Kv(d) => d.close().await,
            Self::Memory(d) => d.close().await,
        }
    }

    fn stats(&self) -> BrokerStats {
        match self {
            Self::Amqp(d) => d.stats(),
            Self::Log(d) => d.stats(),
            Self::Kv(d) => d.stats(),
            Self::Memory(d) => d.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_memory() {
        let driver = BrokerDriver::connect(DriverKind::Memory, &BrokerConfig::in_memory())
            .await
            .unwrap();
        assert_eq!(driver.name(), "memory");
        assert!(driver.as_memory().is_some());
        driver.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_without_block_is_invalid_configuration() {
        let result = BrokerDriver::connect(DriverKind::Amqp, &BrokerConfig::in_memory()).await;
        assert!(matches!(
            result,
            Err(BrokerError::InvalidConfiguration { .. })
        ));
    }
}
