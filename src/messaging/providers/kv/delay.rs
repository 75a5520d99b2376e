//! Sorted-set delay dispatcher.
//!
//! Delayed entries are scored by their due time in unix seconds. A dispatcher
//! polls its set and moves each due entry with one server-side script that
//! removes it and forwards it only when the `ZREM` actually removed it. The
//! claim and the push land together, so concurrent dispatchers never both
//! deliver and a failed round trip leaves the entry parked for the next poll.

use std::time::Duration;

use chrono::Utc;
use redis::Script;
use tracing::{debug, warn};

use super::conn::KvConnection;
use super::keys;
use crate::error::BrokerResult;
use crate::messaging::codec::{JobEnvelope, JsonCodec, MessageEnvelope};
use crate::messaging::providers::core::StopSignal;

/// Entries forwarded per poll
const BATCH: isize = 100;

const DRIVER: &str = "kv";

/// KEYS[1] delayed set, KEYS[2] destination; ARGV entry, op, payload, score
const MOVE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
if ARGV[2] == 'publish' then
  redis.call('PUBLISH', KEYS[2], ARGV[3])
elseif ARGV[2] == 'zadd' then
  redis.call('ZADD', KEYS[2], ARGV[4], ARGV[3])
else
  redis.call('LPUSH', KEYS[2], ARGV[3])
end
return 1
"#;

/// Where due entries go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchTarget {
    /// Republish on the topic's pub/sub channel
    Topic(String),
    /// Move into the queue's FIFO list or priority set
    Jobs(String),
}

/// One due entry's destination, as handed to the move script
#[derive(Debug, Clone, PartialEq)]
pub struct Forward {
    pub op: &'static str,
    pub key: String,
    pub payload: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct DelayDispatcher {
    key: String,
    target: DispatchTarget,
    poll: Duration,
    script: Script,
}

impl DelayDispatcher {
    pub fn for_topic(topic: &str, poll: Duration) -> Self {
        Self::new(keys::delayed(topic), DispatchTarget::Topic(topic.to_string()), poll)
    }

    pub fn for_jobs(queue: &str, poll: Duration) -> Self {
        Self::new(keys::delayed_jobs(queue), DispatchTarget::Jobs(queue.to_string()), poll)
    }

    fn new(key: String, target: DispatchTarget, poll: Duration) -> Self {
        Self {
            key,
            target,
            poll,
            script: Script::new(MOVE_SCRIPT),
        }
    }

    /// Sorted set this dispatcher drains
    pub fn key(&self) -> &str {
        &self.key
    }

    pub(super) async fn run(self, conn: KvConnection, stop: StopSignal) {
        debug!(driver = DRIVER, key = %self.key, "Delay dispatcher started");
        while stop.sleep(self.poll).await {
            match self.dispatch_due(&conn, Utc::now().timestamp()).await {
                Ok(0) => {}
                Ok(moved) => debug!(driver = DRIVER, key = %self.key, moved, "Dispatched delayed entries"),
                Err(e) => warn!(driver = DRIVER, key = %self.key, error = %e, "Delay dispatch failed"),
            }
        }
        debug!(driver = DRIVER, key = %self.key, "Delay dispatcher stopped");
    }

    /// Destination for one parked entry
    pub fn forward(&self, entry: &str) -> Forward {
        match &self.target {
            DispatchTarget::Topic(topic) => Forward {
                op: "publish",
                key: topic.clone(),
                payload: live_message(entry),
                score: 0.0,
            },
            DispatchTarget::Jobs(queue) => match job_route(queue, entry) {
                JobRoute::Priority { key, score } => Forward {
                    op: "zadd",
                    key,
                    payload: entry.to_string(),
                    score,
                },
                JobRoute::Fifo { key } => Forward {
                    op: "lpush",
                    key,
                    payload: entry.to_string(),
                    score: 0.0,
                },
            },
        }
    }

    /// Forward every entry due at or before `now`; returns how many moved
    ///
    /// Stops at the first failed move. Unmoved entries stay in the set.
    pub(super) async fn dispatch_due(&self, conn: &KvConnection, now: i64) -> BrokerResult<usize> {
        let ready: Vec<String> = conn
            .query(
                "zrangebyscore",
                redis::cmd("ZRANGEBYSCORE")
                    .arg(&self.key)
                    .arg("-inf")
                    .arg(now)
                    .arg("LIMIT")
                    .arg(0)
                    .arg(BATCH),
            )
            .await?;

        let mut moved = 0;
        for entry in ready {
            let forward = self.forward(&entry);
            let mut invocation = self.script.prepare_invoke();
            invocation
                .key(&self.key)
                .key(&forward.key)
                .arg(&entry)
                .arg(forward.op)
                .arg(&forward.payload)
                .arg(forward.score);

            let claimed: i64 = conn.invoke("move_delayed", &invocation).await?;
            if claimed == 1 {
                moved += 1;
            }
        }
        Ok(moved)
    }
}

/// Strip delay markers so the live copy looks like an ordinary publish
///
/// Entries that do not decode are forwarded unchanged.
pub fn live_message(entry: &str) -> String {
    JsonCodec
        .decode::<MessageEnvelope>(entry.as_bytes())
        .and_then(|envelope| JsonCodec.encode(&envelope.undelayed()))
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| entry.to_string())
}

#[derive(Debug, PartialEq)]
pub enum JobRoute {
    Priority { key: String, score: f64 },
    Fifo { key: String },
}

/// Destination for a due job entry
pub fn job_route(queue: &str, entry: &str) -> JobRoute {
    match JsonCodec.decode::<JobEnvelope>(entry.as_bytes()) {
        Ok(job) if job.priority > 0 => JobRoute::Priority {
            key: keys::priority(queue),
            score: keys::priority_score(job.priority),
        },
        _ => JobRoute::Fifo {
            key: keys::queue(queue),
        },
    }
}
