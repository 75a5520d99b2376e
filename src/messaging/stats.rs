//! # Broker Statistics
//!
//! Lock-free counters owned by each driver, and the plain snapshot type
//! handed to callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Point-in-time copy of a driver's counters and gauges
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerStats {
    pub driver: String,
    pub messages_published: u64,
    pub messages_consumed: u64,
    pub messages_failed: u64,
    pub jobs_enqueued: u64,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    /// Handlers currently running
    pub in_flight: u64,
    pub active_connections: u64,
    pub topic_count: u64,
    pub queue_count: u64,
    pub uptime: Duration,
    pub driver_info: HashMap<String, serde_json::Value>,
}

/// Counters updated from driver hot paths
#[derive(Debug)]
pub struct AtomicBrokerStats {
    started_at: Instant,
    published: AtomicU64,
    consumed: AtomicU64,
    failed: AtomicU64,
    jobs_enqueued: AtomicU64,
    jobs_processed: AtomicU64,
    jobs_failed: AtomicU64,
    in_flight: AtomicU64,
    active_connections: AtomicU64,
}

impl Default for AtomicBrokerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicBrokerStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            published: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            jobs_enqueued: AtomicU64::new(0),
            jobs_processed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
        }
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_consumed(&self) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_enqueued(&self) {
        self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_processed(&self) {
        self.jobs_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Track one running handler until the guard drops
    pub fn in_flight(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { stats: self }
    }

    pub fn set_active_connections(&self, count: u64) {
        self.active_connections.store(count, Ordering::Relaxed);
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    pub fn snapshot(
        &self,
        driver: &str,
        topic_count: u64,
        queue_count: u64,
        driver_info: HashMap<String, serde_json::Value>,
    ) -> BrokerStats {
        BrokerStats {
            driver: driver.to_string(),
            messages_published: self.published.load(Ordering::Relaxed),
            messages_consumed: self.consumed.load(Ordering::Relaxed),
            messages_failed: self.failed.load(Ordering::Relaxed),
            jobs_enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            topic_count,
            queue_count,
            uptime: self.started_at.elapsed(),
            driver_info,
        }
    }
}

pub struct InFlightGuard<'a> {
    stats: &'a AtomicBrokerStats,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = AtomicBrokerStats::new();
        stats.record_published();
        stats.record_published();
        stats.record_consumed();
        stats.record_failed();
        stats.record_job_enqueued();
        stats.set_active_connections(1);

        let snap = stats.snapshot("memory", 2, 1, HashMap::new());
        assert_eq!(snap.driver, "memory");
        assert_eq!(snap.messages_published, 2);
        assert_eq!(snap.messages_consumed, 1);
        assert_eq!(snap.messages_failed, 1);
        assert_eq!(snap.jobs_enqueued, 1);
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.topic_count, 2);
        assert_eq!(snap.queue_count, 1);
    }

    #[test]
    fn test_in_flight_guard() {
        let stats = AtomicBrokerStats::new();
        {
            let _a = stats.in_flight();
            let _b = stats.in_flight();
            assert_eq!(stats.snapshot("x", 0, 0, HashMap::new()).in_flight, 2);
        }
        assert_eq!(stats.snapshot("x", 0, 0, HashMap::new()).in_flight, 0);
    }
}
