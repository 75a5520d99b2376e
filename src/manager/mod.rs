//! # Broker Manager
//!
//! Façade over the configured drivers. The manager constructs the default
//! driver at startup and any other driver on first use, runs one
//! [`HealthMonitor`] per installed driver, and offers single-driver
//! delegation, cross-topic broadcast, and cross-driver mirroring.
//!
//! ```rust,no_run
//! use unified_broker::{BrokerConfig, BrokerManager};
//!
//! # async fn example() -> unified_broker::BrokerResult<()> {
//! let manager = BrokerManager::new(BrokerConfig::in_memory()).await?;
//! manager
//!     .subscribe("orders", |msg: unified_broker::Message| async move {
//!         println!("{}", String::from_utf8_lossy(&msg.payload));
//!         Ok::<(), anyhow::Error>(())
//!     })
//!     .await?;
//! manager.publish_json("orders", &serde_json::json!({"n": 1})).await?;
//! manager.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod health;
pub mod scope;

pub use health::{HealthMonitor, HealthStatus};
pub use scope::DriverScope;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::{BrokerConfig, DriverKind};
use crate::error::{BrokerError, BrokerResult};
use crate::messaging::codec::JsonCodec;
use crate::messaging::message::{Job, Message, TopicConfig, TopicInfo};
use crate::messaging::provider::BrokerDriver;
use crate::messaging::stats::BrokerStats;
use crate::messaging::subscription::SubscriptionHandle;
use crate::messaging::traits::{Driver, JobHandler, MessageHandler};

const COMPONENT: &str = "manager";

#[derive(Debug)]
struct Installed {
    driver: Arc<BrokerDriver>,
    monitor: HealthMonitor,
}

#[derive(Debug, Default)]
struct ManagerState {
    drivers: HashMap<DriverKind, Installed>,
    default: Option<DriverKind>,
}

/// Entry point for applications
#[derive(Debug)]
pub struct BrokerManager {
    config: BrokerConfig,
    state: RwLock<ManagerState>,
    closed: AtomicBool,
}

impl BrokerManager {
    /// Validate the configuration and construct the default driver
    ///
    /// A disabled configuration yields a manager with no drivers; every
    /// delegating call then fails with `DefaultUnavailable`.
    pub async fn new(config: BrokerConfig) -> BrokerResult<Self> {
        let manager = Self {
            config,
            state: RwLock::new(ManagerState::default()),
            closed: AtomicBool::new(false),
        };

        if !manager.config.enabled {
            info!("Broker disabled by configuration");
            return Ok(manager);
        }

        let kind = manager.config.driver;
        {
            let mut state = manager.state.write().await;
            let driver = BrokerDriver::connect(kind, &manager.config).await?;
            manager.install(&mut state, driver);
            state.default = Some(kind);
        }

        info!(default = %kind, "Broker manager ready");
        Ok(manager)
    }

    /// Adopt an already-constructed driver and make it the default
    pub async fn with_driver(config: BrokerConfig, driver: BrokerDriver) -> BrokerResult<Self> {
        config.validate_for(driver.kind())?;
        let manager = Self {
            config,
            state: RwLock::new(ManagerState::default()),
            closed: AtomicBool::new(false),
        };
        {
            let mut state = manager.state.write().await;
            let kind = driver.kind();
            manager.install(&mut state, driver);
            state.default = Some(kind);
        }
        Ok(manager)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(BrokerError::closed(COMPONENT))
        } else {
            Ok(())
        }
    }

    fn install(&self, state: &mut ManagerState, driver: BrokerDriver) -> Arc<BrokerDriver> {
        let kind = driver.kind();
        let driver = Arc::new(driver);
        let monitor = HealthMonitor::start(Arc::clone(&driver), &self.config.health);
        state.drivers.insert(
            kind,
            Installed {
                driver: Arc::clone(&driver),
                monitor,
            },
        );
        driver
    }

    /// Installed driver for `kind`, constructing it from configuration if needed
    ///
    /// The backend connects without holding the state lock. When two callers
    /// race, the first to install wins and the other connection is closed.
    async fn obtain(&self, kind: DriverKind) -> BrokerResult<Arc<BrokerDriver>> {
        self.ensure_open()?;
        if let Some(driver) = self.driver(kind).await {
            return Ok(driver);
        }

        let driver = BrokerDriver::connect(kind, &self.config)
            .await
            .map_err(|e| {
                warn!(driver = %kind, error = %e, "Driver construction failed");
                BrokerError::driver_not_configured(kind.as_str(), e.to_string())
            })?;

        let mut state = self.state.write().await;
        let outcome = match self.ensure_open() {
            Err(closed) => Err(closed),
            Ok(()) => match state.drivers.get(&kind) {
                Some(installed) => Ok(Arc::clone(&installed.driver)),
                None => {
                    info!(driver = %kind, "Driver constructed on demand");
                    return Ok(self.install(&mut state, driver));
                }
            },
        };
        drop(state);

        if let Err(e) = driver.close().await {
            debug!(driver = %kind, error = %e, "Closing surplus driver failed");
        }
        outcome
    }

    /// Read-only lookup; never constructs
    pub async fn driver(&self, kind: DriverKind) -> Option<Arc<BrokerDriver>> {
        self.state
            .read()
            .await
            .drivers
            .get(&kind)
            .map(|installed| Arc::clone(&installed.driver))
    }

    pub async fn default_kind(&self) -> Option<DriverKind> {
        self.state.read().await.default
    }

    /// Make `kind` the default, constructing it first if needed
    ///
    /// On construction failure the previous default stays in place.
    pub async fn set_default(&self, kind: DriverKind) -> BrokerResult<()> {
        self.obtain(kind).await?;
        let mut state = self.state.write().await;
        self.ensure_open()?;
        let previous = state.default.replace(kind);
        info!(driver = %kind, previous = ?previous, "Default driver changed");
        Ok(())
    }

    /// Scope over the default driver with the configured deadline
    pub async fn scope(&self) -> BrokerResult<DriverScope> {
        self.ensure_open()?;
        let state = self.state.read().await;
        let installed = state
            .default
            .and_then(|kind| state.drivers.get(&kind))
            .ok_or(BrokerError::DefaultUnavailable)?;
        Ok(DriverScope::new(
            Arc::clone(&installed.driver),
            self.config.operation_timeout(),
        ))
    }

    /// Scope over `kind` without touching the default
    pub async fn via(&self, kind: DriverKind) -> BrokerResult<DriverScope> {
        let driver = self.obtain(kind).await?;
        Ok(DriverScope::new(driver, self.config.operation_timeout()))
    }

    pub async fn publish(&self, topic: &str, message: Message) -> BrokerResult<()> {
        self.scope().await?.publish(topic, message).await
    }

    pub async fn publish_json<T: Serialize + ?Sized>(&self, topic: &str, data: &T) -> BrokerResult<()> {
        self.scope().await?.publish_json(topic, data).await
    }

    pub async fn publish_with_delay(
        &self,
        topic: &str,
        message: Message,
        delay: Duration,
    ) -> BrokerResult<()> {
        self.scope()
            .await?
            .publish_with_delay(topic, message, delay)
            .await
    }

    pub async fn subscribe<H: MessageHandler>(
        &self,
        topic: &str,
        handler: H,
    ) -> BrokerResult<SubscriptionHandle> {
        self.scope().await?.subscribe(topic, handler).await
    }

    pub async fn subscribe_with_group<H: MessageHandler>(
        &self,
        topic: &str,
        group: &str,
        handler: H,
    ) -> BrokerResult<SubscriptionHandle> {
        self.scope()
            .await?
            .subscribe_with_group(topic, group, handler)
            .await
    }

    pub async fn enqueue_job(&self, queue: &str, job: Job) -> BrokerResult<()> {
        self.scope().await?.enqueue_job(queue, job).await
    }

    pub async fn process_jobs<H: JobHandler>(
        &self,
        queue: &str,
        handler: H,
    ) -> BrokerResult<SubscriptionHandle> {
        self.scope().await?.process_jobs(queue, handler).await
    }

    pub async fn create_topic(&self, topic: &str, config: &TopicConfig) -> BrokerResult<()> {
        self.scope().await?.create_topic(topic, config).await
    }

    pub async fn delete_topic(&self, topic: &str) -> BrokerResult<()> {
        self.scope().await?.delete_topic(topic).await
    }

    pub async fn topic_info(&self, topic: &str) -> BrokerResult<TopicInfo> {
        self.scope().await?.topic_info(topic).await
    }

    pub async fn ping(&self) -> BrokerResult<()> {
        self.scope().await?.ping().await
    }

    /// Default driver's counters
    pub async fn default_stats(&self) -> BrokerResult<BrokerStats> {
        Ok(self.scope().await?.stats())
    }

    /// Publish one payload to several topics on the default driver
    ///
    /// The payload is encoded once. Stops at the first failure and reports
    /// that topic; earlier publishes are not rolled back.
    pub async fn broadcast<T: Serialize + ?Sized>(&self, topics: &[&str], data: &T) -> BrokerResult<()> {
        let scope = self.scope().await?;
        let payload = JsonCodec.encode(data)?;
        for topic in topics {
            scope
                .publish(topic, scope.driver().new_message(topic, payload.clone()))
                .await
                .map_err(|e| BrokerError::fan_out(*topic, e))?;
        }
        Ok(())
    }

    /// Publish one payload to the same topic on several drivers
    ///
    /// Same partial-failure behavior as [`broadcast`](Self::broadcast); the
    /// failed target is named by driver.
    pub async fn mirror<T: Serialize + ?Sized>(
        &self,
        drivers: &[DriverKind],
        topic: &str,
        data: &T,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        let payload = JsonCodec.encode(data)?;
        for kind in drivers {
            let result = match self.via(*kind).await {
                Ok(scope) => {
                    let message = scope.driver().new_message(topic, payload.clone());
                    scope.publish(topic, message).await
                }
                Err(e) => Err(e),
            };
            result.map_err(|e| BrokerError::fan_out(kind.as_str(), e))?;
        }
        Ok(())
    }

    /// Cached probe outcome per installed driver
    pub async fn health_check(&self) -> HashMap<String, bool> {
        self.state
            .read()
            .await
            .drivers
            .iter()
            .map(|(kind, installed)| (kind.to_string(), installed.monitor.is_healthy()))
            .collect()
    }

    pub async fn health_status(&self) -> HashMap<String, HealthStatus> {
        self.state
            .read()
            .await
            .drivers
            .iter()
            .map(|(kind, installed)| (kind.to_string(), installed.monitor.snapshot()))
            .collect()
    }

    /// Snapshot of every installed driver's counters
    pub async fn stats(&self) -> HashMap<String, BrokerStats> {
        self.state
            .read()
            .await
            .drivers
            .iter()
            .map(|(kind, installed)| (kind.to_string(), installed.driver.stats()))
            .collect()
    }

    /// Stop every health monitor, then close every driver
    ///
    /// Returns the last driver error. Later calls are no-ops.
    pub async fn close(&self) -> BrokerResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let installed: Vec<(DriverKind, Installed)> = {
            let mut state = self.state.write().await;
            state.default = None;
            state.drivers.drain().collect()
        };

        let mut drivers = Vec::with_capacity(installed.len());
        for (kind, entry) in installed {
            entry.monitor.stop().await;
            drivers.push((kind, entry.driver));
        }

        let mut last_error = None;
        for (kind, driver) in drivers {
            if let Err(e) = driver.close().await {
                error!(driver = %kind, error = %e, "Driver close failed");
                last_error = Some(e);
            }
        }

        info!("Broker manager closed");
        last_error.map_or(Ok(()), Err)
    }
}
