//! # Driver Health Monitor
//!
//! One background ticker per installed driver. Each tick pings the driver
//! under a deadline and stores the outcome; [`HealthMonitor::snapshot`]
//! reads the stored outcome without probing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::messaging::provider::BrokerDriver;
use crate::messaging::traits::Driver;

/// Most recent probe outcome for one driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub driver: String,
    pub healthy: bool,
    /// None until the first probe completes
    pub last_checked: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct ProbeState {
    healthy: AtomicBool,
    detail: RwLock<(Option<DateTime<Utc>>, Option<String>)>,
}

impl ProbeState {
    fn record(&self, outcome: Result<(), String>) -> bool {
        let healthy = outcome.is_ok();
        let was = self.healthy.swap(healthy, Ordering::AcqRel);
        *self.detail.write() = (Some(Utc::now()), outcome.err());
        was != healthy
    }
}

/// Periodic liveness probe for one driver
#[derive(Debug)]
pub struct HealthMonitor {
    driver: &'static str,
    state: Arc<ProbeState>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    /// Start probing `driver`; it counts as healthy until a probe says otherwise
    pub fn start(driver: Arc<BrokerDriver>, config: &HealthConfig) -> Self {
        let name = driver.name();
        let state = Arc::new(ProbeState {
            healthy: AtomicBool::new(true),
            detail: RwLock::new((None, None)),
        });
        let token = CancellationToken::new();

        let task = tokio::spawn(run(
            driver,
            config.clone(),
            Arc::clone(&state),
            token.clone(),
        ));

        info!(
            driver = name,
            interval_ms = config.interval_ms,
            ping_timeout_ms = config.ping_timeout_ms,
            "Health monitor started"
        );

        Self {
            driver: name,
            state,
            token,
            task: Some(task),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state.healthy.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> HealthStatus {
        let (last_checked, last_error) = self.state.detail.read().clone();
        HealthStatus {
            driver: self.driver.to_string(),
            healthy: self.is_healthy(),
            last_checked,
            last_error,
        }
    }

    /// Stop the ticker and wait for it to exit
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!(driver = self.driver, "Health monitor stopped");
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run(
    driver: Arc<BrokerDriver>,
    config: HealthConfig,
    state: Arc<ProbeState>,
    token: CancellationToken,
) {
    let mut ticker = interval(config.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the driver was just constructed.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let outcome = match tokio::time::timeout(config.ping_timeout(), driver.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("ping timed out after {}ms", config.ping_timeout_ms)),
        };

        match &outcome {
            Ok(()) => debug!(driver = driver.name(), "Health probe succeeded"),
            Err(e) => debug!(driver = driver.name(), error = %e, "Health probe failed"),
        }

        let failure = outcome.as_ref().err().cloned();
        if state.record(outcome) {
            match failure {
                None => info!(driver = driver.name(), "Driver healthy again"),
                Some(e) => warn!(driver = driver.name(), error = %e, "Driver unhealthy"),
            }
        }
    }
}
