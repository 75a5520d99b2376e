//! Shared helpers for the end-to-end suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use unified_broker::config::{HealthConfig, RetryConfig};
use unified_broker::{BrokerConfig, BrokerManager, Message};

/// In-memory configuration with fast retries and health probes
pub fn memory_config() -> BrokerConfig {
    BrokerConfig::in_memory()
        .with_retry(RetryConfig {
            max_retries: 3,
            initial_interval_ms: 10,
            max_interval_ms: 50,
            multiplier: 2.0,
            random_factor: 0.0,
        })
        .with_health(HealthConfig {
            interval_ms: 50,
            ping_timeout_ms: 100,
        })
}

pub async fn memory_manager() -> BrokerManager {
    unified_broker::logging::init_tracing();
    BrokerManager::new(memory_config())
        .await
        .expect("in-memory manager should start")
}

/// Messages recorded by a subscriber
#[derive(Debug, Clone, Default)]
pub struct Sink {
    messages: Arc<Mutex<Vec<Message>>>,
}

impl Sink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(
        &self,
    ) -> impl Fn(Message) -> std::future::Ready<anyhow::Result<()>> + Send + Sync + 'static {
        let messages = Arc::clone(&self.messages);
        move |msg: Message| {
            messages.lock().push(msg);
            std::future::ready(Ok(()))
        }
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    pub fn ids(&self) -> Vec<String> {
        self.messages.lock().iter().map(|m| m.id.clone()).collect()
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
