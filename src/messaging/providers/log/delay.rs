//! Satellite-topic delay relay.
//!
//! Delayed records are produced to `<topic>.delayed` carrying a
//! `meta_delayed_until` header. The relay consumes the satellite topic, parks
//! each record on a timer until it is due, republishes it to the live topic,
//! and commits an offset only once every earlier offset on that partition has
//! been republished. A crash replays parked records rather than losing them.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::Utc;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::FutureProducer;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::client::{self, Consumed, Delivery, Record};
use crate::config::LogConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::messaging::headers::META_PREFIX;
use crate::messaging::providers::core::StopSignal;

const DRIVER: &str = "log";

/// Metadata key holding the due time in unix seconds
pub const DELAYED_UNTIL: &str = "delayed_until";
/// Metadata key holding the requested delay, human-readable
pub const ORIGINAL_DELAY: &str = "original_delay";

pub fn satellite_topic(topic: &str) -> String {
    format!("{topic}.delayed")
}

fn header_key(meta: &str) -> String {
    format!("{META_PREFIX}{meta}")
}

/// Due time carried by a satellite record; records without one are due now
pub fn due_time(headers: &[(String, String)]) -> Option<i64> {
    let key = header_key(DELAYED_UNTIL);
    headers
        .iter()
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| v.trim_matches('"').parse::<i64>().ok())
}

/// Headers for the live copy, without the delay markers
pub fn live_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    let until = header_key(DELAYED_UNTIL);
    let original = header_key(ORIGINAL_DELAY);
    headers
        .iter()
        .filter(|(k, _)| *k != until && *k != original)
        .cloned()
        .collect()
}

#[derive(Debug, Default)]
struct PartitionOffsets {
    pending: BTreeSet<i64>,
    highest: Option<i64>,
    committed: Option<i64>,
}

/// Tracks which offsets are safe to commit per partition
///
/// The commit position is the smallest offset still pending, or one past the
/// highest offset seen once nothing is pending.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<i32, PartitionOffsets>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, partition: i32, offset: i64) {
        let state = self.partitions.entry(partition).or_default();
        state.pending.insert(offset);
        state.highest = Some(state.highest.map_or(offset, |h| h.max(offset)));
    }

    /// Mark `offset` done; returns the new commit position if it advanced
    pub fn complete(&mut self, partition: i32, offset: i64) -> Option<i64> {
        let state = self.partitions.get_mut(&partition)?;
        state.pending.remove(&offset);

        let position = match state.pending.first() {
            Some(first) => *first,
            None => state.highest? + 1,
        };

        if state.committed.map_or(true, |c| position > c) {
            state.committed = Some(position);
            Some(position)
        } else {
            None
        }
    }

    pub fn pending(&self, partition: i32) -> usize {
        self.partitions
            .get(&partition)
            .map_or(0, |state| state.pending.len())
    }
}

/// Consumes one satellite topic and republishes records when due
pub struct DelayRelay {
    topic: String,
    satellite: String,
    consumer: StreamConsumer,
    producer: FutureProducer,
    timeout: Duration,
}

impl DelayRelay {
    /// Relays share a consumer group so each record is relayed once
    pub fn new(config: &LogConfig, topic: &str, producer: FutureProducer) -> BrokerResult<Self> {
        let satellite = satellite_topic(topic);
        let group = format!("{}.delay-relay", config.group_id);
        let consumer: StreamConsumer = client::consumer_config(config, &group, false)
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| BrokerError::connection(DRIVER, format!("relay consumer: {e}")))?;
        consumer
            .subscribe(&[satellite.as_str()])
            .map_err(|e| BrokerError::backend(DRIVER, "subscribe_satellite", e))?;

        Ok(Self {
            topic: topic.to_string(),
            satellite,
            consumer,
            producer,
            timeout: config.operation_timeout(),
        })
    }

    pub(crate) async fn run(self, stop: StopSignal) {
        info!(driver = DRIVER, satellite = %self.satellite, "Delay relay started");
        let mut tracker = OffsetTracker::new();
        let mut parked = JoinSet::new();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(i32, i64)>();

        loop {
            tokio::select! {
                _ = stop.wait() => break,
                Some((partition, offset)) = done_rx.recv() => {
                    if let Some(position) = tracker.complete(partition, offset) {
                        self.commit(partition, position);
                    }
                }
                Some(_) = parked.join_next(), if !parked.is_empty() => {}
                received = self.consumer.recv() => match received {
                    Ok(borrowed) => {
                        let record = Consumed::from_borrowed(&borrowed);
                        drop(borrowed);
                        tracker.begin(record.partition, record.offset);
                        self.park(&mut parked, record, done_tx.clone(), stop.clone());
                    }
                    Err(e) => {
                        warn!(driver = DRIVER, satellite = %self.satellite, error = %e, "Relay receive failed");
                        if !stop.sleep(Duration::from_secs(1)).await {
                            break;
                        }
                    }
                },
            }
        }

        // Parked timers are aborted; their offsets stay uncommitted.
        parked.shutdown().await;
        debug!(driver = DRIVER, satellite = %self.satellite, "Delay relay stopped");
    }

    fn park(
        &self,
        parked: &mut JoinSet<()>,
        record: Consumed,
        done: mpsc::UnboundedSender<(i32, i64)>,
        stop: StopSignal,
    ) {
        let now = Utc::now().timestamp();
        let wait = due_time(&record.headers)
            .map(|due| Duration::from_secs(u64::try_from(due - now).unwrap_or(0)))
            .unwrap_or_default();

        let producer = self.producer.clone();
        let topic = self.topic.clone();
        let timeout = self.timeout;
        parked.spawn(async move {
            if !wait.is_zero() && !stop.sleep(wait).await {
                return;
            }
            let live = Record {
                key: record.key.clone().unwrap_or_default(),
                payload: record.payload,
                headers: live_headers(&record.headers),
            };
            loop {
                match client::produce(&producer, &topic, &live, Delivery::Confirmed(timeout)).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(driver = DRIVER, topic = %topic, error = %e, "Relay republish failed; retrying");
                        if !stop.sleep(Duration::from_secs(1)).await {
                            return;
                        }
                    }
                }
            }
            let _ = done.send((record.partition, record.offset));
        });
    }

    fn commit(&self, partition: i32, position: i64) {
        let mut offsets = TopicPartitionList::new();
        if let Err(e) = offsets.add_partition_offset(&self.satellite, partition, Offset::Offset(position)) {
            warn!(driver = DRIVER, error = %e, "Invalid relay commit offset");
            return;
        }
        if let Err(e) = self.consumer.commit(&offsets, CommitMode::Async) {
            warn!(driver = DRIVER, satellite = %self.satellite, partition, error = %e, "Relay commit failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_due_time_reads_metadata_header() {
        let headers = vec![
            ("message_id".to_string(), "m1".to_string()),
            ("meta_delayed_until".to_string(), "1700000003".to_string()),
            ("meta_original_delay".to_string(), "\"3s\"".to_string()),
        ];
        assert_eq!(due_time(&headers), Some(1_700_000_003));

        let live = live_headers(&headers);
        assert_eq!(live, vec![("message_id".to_string(), "m1".to_string())]);
    }

    #[test]
    fn test_missing_due_time_is_immediate() {
        assert_eq!(due_time(&[]), None);
        assert_eq!(satellite_topic("orders"), "orders.delayed");
    }

    #[test]
    fn test_tracker_waits_for_earliest_offset() {
        let mut tracker = OffsetTracker::new();
        for offset in 10..13 {
            tracker.begin(0, offset);
        }
        assert_eq!(tracker.complete(0, 12), Some(10));
        assert_eq!(tracker.complete(0, 10), Some(11));
        assert_eq!(tracker.pending(0), 1);
        assert_eq!(tracker.complete(0, 11), Some(13));
        assert_eq!(tracker.complete(7, 1), None);
    }

    proptest! {
        #[test]
        fn prop_commit_never_passes_pending(order in Just((0i64..20).collect::<Vec<_>>()).prop_shuffle()) {
            let mut tracker = OffsetTracker::new();
            for offset in 0..20 {
                tracker.begin(3, offset);
            }

            let mut done = BTreeSet::new();
            let mut last = None;
            for offset in order {
                done.insert(offset);
                if let Some(position) = tracker.complete(3, offset) {
                    // Every offset below the commit position has completed
                    prop_assert!((0..position).all(|o| done.contains(&o)));
                    prop_assert!(last.map_or(true, |l| position > l));
                    last = Some(position);
                }
            }
            prop_assert_eq!(last, Some(20));
        }
    }
}
