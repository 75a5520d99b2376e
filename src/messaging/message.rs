//! # Message and Job Types
//!
//! Value types carried through every driver. A [`Message`] is the pub/sub
//! carrier; a [`Job`] is a unit of work placed on a named queue.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Retry ceiling for messages built without an explicit one
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Attempt ceiling for jobs built without an explicit one
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Pub/sub message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Message {
    /// New message with a generated id and the current timestamp
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            payload: payload.into(),
            headers: HashMap::new(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self.retry_count = self.retry_count.min(max_retries);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Fill in a missing id before the message leaves the producer
    pub fn ensure_id(&mut self) {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Copy of this message with the retry counter advanced, if below the ceiling
    pub fn next_retry(&self) -> Option<Message> {
        if !self.can_retry() {
            return None;
        }
        let mut retry = self.clone();
        retry.retry_count += 1;
        Some(retry)
    }

    /// Payload parsed as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }
}

/// Unit of work on a named queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    /// Routing key into the consumer's dispatch table
    pub handler: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub metadata: HashMap<String, serde_json::Value>,
    /// Higher runs earlier; 0 means plain FIFO
    pub priority: i32,
    pub delay: Duration,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        queue: impl Into<String>,
        handler: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            queue: queue.into(),
            handler: handler.into(),
            payload: payload.into(),
            headers: HashMap::new(),
            metadata: HashMap::new(),
            priority: 0,
            delay: Duration::ZERO,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_priority(&self) -> bool {
        self.priority > 0
    }

    /// Mark the job claimed: one more attempt, processed now
    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.processed_at = Some(Utc::now());
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }
}

/// Topic descriptor returned by `topic_info`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicInfo {
    pub name: String,
    /// 1 for backends without partitions
    pub partitions: i32,
    pub replication_factor: i32,
    /// Approximate or backend-reported
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Requested shape for `create_topic`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub partitions: i32,
    pub replication_factor: i32,
    /// Backend-specific entries such as `retention.ms` or `cleanup.policy`
    pub entries: HashMap<String, String>,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            partitions: 1,
            replication_factor: 1,
            entries: HashMap::new(),
        }
    }
}

impl TopicConfig {
    pub fn with_partitions(mut self, partitions: i32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_replication_factor(mut self, replication_factor: i32) -> Self {
        self.replication_factor = replication_factor;
        self
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_has_identity() {
        let a = Message::new("orders", b"{}".to_vec());
        let b = Message::new("orders", b"{}".to_vec());
        assert!(!a.id.is_empty());
        assert_ne!(a.id, b.id);
        assert_eq!(a.retry_count, 0);
        assert_eq!(a.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_next_retry_respects_ceiling() {
        let msg = Message::new("t", Vec::new()).with_max_retries(2);
        let first = msg.next_retry().unwrap();
        let second = first.next_retry().unwrap();
        assert_eq!(second.retry_count, 2);
        assert_eq!(second.id, msg.id);
        assert!(second.next_retry().is_none());
    }

    #[test]
    fn test_lowering_ceiling_clamps_retry_count() {
        let mut msg = Message::new("t", Vec::new());
        msg.retry_count = 3;
        let msg = msg.with_max_retries(1);
        assert!(msg.retry_count <= msg.max_retries);
    }

    #[test]
    fn test_ensure_id_fills_empty() {
        let mut msg = Message::new("t", Vec::new()).with_id("");
        msg.ensure_id();
        assert!(!msg.id.is_empty());
    }

    #[test]
    fn test_job_attempts() {
        let mut job = Job::new("emails", "send_welcome", b"x".to_vec()).with_max_attempts(2);
        assert!(job.processed_at.is_none());
        job.begin_attempt();
        assert_eq!(job.attempts, 1);
        assert!(job.processed_at.is_some());
        assert!(job.can_retry());
        job.begin_attempt();
        assert!(!job.can_retry());
    }
}
