//! # Wire Codec
//!
//! Serialization boundary between [`Message`]/[`Job`] values and backend
//! bytes. Drivers go through [`JsonCodec`] instead of calling `serde_json`
//! directly, so a binary envelope can replace it in one place.
//!
//! The envelope layout is what the KV driver stores and publishes:
//!
//! ```json
//! {"id":"…","topic":"…","payload":"…","headers":{},"timestamp":1700000000,
//!  "retry_count":0,"max_retries":3,"metadata":{}}
//! ```
//!
//! Delayed entries add `"execute_at"` (unix seconds) and `"delay"` (for
//! example `"1m30s"`).
//!
//! The payload travels as a JSON string, so enveloped payloads must be UTF-8.
//! Other bytes are rejected with [`BrokerError::Serialization`].

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::message::{Job, Message};
use crate::error::{BrokerError, BrokerResult};

/// Canonical JSON codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub const CONTENT_TYPE: &'static str = "application/json";

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> BrokerResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| BrokerError::serialization(e.to_string()))
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> BrokerResult<T> {
        serde_json::from_slice(bytes).map_err(|e| BrokerError::deserialization(e.to_string()))
    }

    pub fn encode_message(&self, message: &Message) -> BrokerResult<Vec<u8>> {
        self.encode(&MessageEnvelope::try_from(message)?)
    }

    pub fn decode_message(&self, bytes: &[u8]) -> BrokerResult<Message> {
        self.decode::<MessageEnvelope>(bytes)
            .map(MessageEnvelope::into_message)
    }

    pub fn encode_job(&self, job: &Job) -> BrokerResult<Vec<u8>> {
        self.encode(&JobEnvelope::try_from(job)?)
    }

    pub fn decode_job(&self, bytes: &[u8]) -> BrokerResult<Job> {
        self.decode::<JobEnvelope>(bytes).map(JobEnvelope::into_job)
    }
}

/// JSON form of a [`Message`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: String,
    pub topic: String,
    pub payload: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub timestamp: i64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
}

fn text_payload(kind: &str, id: &str, payload: &[u8]) -> BrokerResult<String> {
    String::from_utf8(payload.to_vec()).map_err(|e| {
        BrokerError::serialization(format!("{kind} {id} payload is not UTF-8: {e}"))
    })
}

impl TryFrom<&Message> for MessageEnvelope {
    type Error = BrokerError;

    fn try_from(message: &Message) -> BrokerResult<Self> {
        Ok(Self {
            id: message.id.clone(),
            topic: message.topic.clone(),
            payload: text_payload("message", &message.id, &message.payload)?,
            headers: sorted(&message.headers),
            timestamp: message.timestamp.timestamp(),
            retry_count: message.retry_count,
            max_retries: message.max_retries,
            metadata: sorted(&message.metadata),
            execute_at: None,
            delay: None,
        })
    }
}

impl MessageEnvelope {
    /// Mark the envelope as due `delay` after `now`
    pub fn delayed(mut self, now: DateTime<Utc>, delay: Duration) -> Self {
        self.execute_at = Some(due_at(now, delay));
        self.delay = Some(format_duration(delay));
        self
    }

    /// Drop delay markers before the envelope is republished live
    pub fn undelayed(mut self) -> Self {
        self.execute_at = None;
        self.delay = None;
        self
    }

    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            topic: self.topic,
            payload: self.payload.into_bytes(),
            headers: self.headers.into_iter().collect(),
            metadata: self.metadata.into_iter().collect(),
            timestamp: from_unix(self.timestamp),
            retry_count: self.retry_count.min(self.max_retries),
            max_retries: self.max_retries,
        }
    }
}

/// JSON form of a [`Job`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: String,
    pub queue: String,
    pub handler: String,
    pub payload: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub max_attempts: u32,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<i64>,
}

impl TryFrom<&Job> for JobEnvelope {
    type Error = BrokerError;

    fn try_from(job: &Job) -> BrokerResult<Self> {
        Ok(Self {
            id: job.id.clone(),
            queue: job.queue.clone(),
            handler: job.handler.clone(),
            payload: text_payload("job", &job.id, &job.payload)?,
            headers: sorted(&job.headers),
            metadata: sorted(&job.metadata),
            priority: job.priority,
            delay_ms: u64::try_from(job.delay.as_millis()).unwrap_or(u64::MAX),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            created_at: job.created_at.timestamp(),
            processed_at: job.processed_at.map(|t| t.timestamp()),
        })
    }
}

impl JobEnvelope {
    pub fn into_job(self) -> Job {
        Job {
            id: self.id,
            queue: self.queue,
            handler: self.handler,
            payload: self.payload.into_bytes(),
            headers: self.headers.into_iter().collect(),
            metadata: self.metadata.into_iter().collect(),
            priority: self.priority,
            delay: Duration::from_millis(self.delay_ms),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            created_at: from_unix(self.created_at),
            processed_at: self.processed_at.map(from_unix),
        }
    }
}

fn sorted<V: Clone>(map: &HashMap<String, V>) -> BTreeMap<String, V> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Unix seconds at which something delayed by `delay` from `now` becomes due
///
/// Rounds up so a consumer never sees the entry early.
pub fn due_at(now: DateTime<Utc>, delay: Duration) -> i64 {
    let millis = now.timestamp_millis() + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);
    millis.div_euclid(1000) + i64::from(millis.rem_euclid(1000) != 0)
}

pub fn from_unix(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).single().unwrap_or_else(Utc::now)
}

/// Human-readable duration such as `3s`, `1m30s`, `1h0m0s`, or `250ms`
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    if d < Duration::from_millis(1) {
        return format!("{}µs", d.as_micros());
    }
    if d < Duration::from_secs(1) {
        return format!("{}ms", trim_float(d.as_secs_f64() * 1000.0));
    }

    let total = d.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = (total % 60) as f64 + f64::from(d.subsec_nanos()) / 1e9;

    if hours > 0 {
        format!("{hours}h{minutes}m{}s", trim_float(seconds))
    } else if minutes > 0 {
        format!("{minutes}m{}s", trim_float(seconds))
    } else {
        format!("{}s", trim_float(seconds))
    }
}

fn trim_float(value: f64) -> String {
    let text = format!("{value:.3}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}
