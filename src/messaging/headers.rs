//! Header mapping for backends that carry the payload raw and the message
//! identity in string headers (AMQP and the partitioned log).
//!
//! Reserved keys hold identity and retry state. Metadata entries travel as
//! `meta_<key>` with JSON-encoded values so typed values survive the trip.

use std::collections::HashMap;

use super::codec::from_unix;
use super::message::Message;

pub const MESSAGE_ID: &str = "message_id";
pub const RETRY_COUNT: &str = "retry_count";
pub const MAX_RETRIES: &str = "max_retries";
pub const TIMESTAMP: &str = "timestamp";
pub const META_PREFIX: &str = "meta_";

const RESERVED: [&str; 4] = [MESSAGE_ID, RETRY_COUNT, MAX_RETRIES, TIMESTAMP];

/// Flatten a message into wire headers
pub fn to_wire_headers(message: &Message) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = message
        .headers
        .iter()
        .filter(|(k, _)| !RESERVED.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for (key, value) in &message.metadata {
        let encoded = serde_json::to_string(value).unwrap_or_else(|_| value.to_string());
        headers.push((format!("{META_PREFIX}{key}"), encoded));
    }

    headers.push((MESSAGE_ID.to_string(), message.id.clone()));
    headers.push((RETRY_COUNT.to_string(), message.retry_count.to_string()));
    headers.push((MAX_RETRIES.to_string(), message.max_retries.to_string()));
    headers.push((TIMESTAMP.to_string(), message.timestamp.timestamp().to_string()));
    headers
}

/// Rebuild a message from its topic, raw payload, and wire headers
///
/// Missing reserved headers fall back to a fresh message's values, so
/// payloads produced by foreign publishers still decode.
pub fn from_wire_headers<I>(topic: &str, payload: Vec<u8>, headers: I) -> Message
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut message = Message::new(topic, payload);
    let mut user_headers = HashMap::new();
    let mut retry_count = None;

    for (key, value) in headers {
        match key.as_str() {
            MESSAGE_ID => message.id = value,
            RETRY_COUNT => retry_count = value.parse::<u32>().ok(),
            MAX_RETRIES => {
                if let Ok(max) = value.parse::<u32>() {
                    message.max_retries = max;
                }
            }
            TIMESTAMP => {
                if let Ok(secs) = value.parse::<i64>() {
                    message.timestamp = from_unix(secs);
                }
            }
            _ => {
                if let Some(meta_key) = key.strip_prefix(META_PREFIX) {
                    let decoded = serde_json::from_str(&value)
                        .unwrap_or(serde_json::Value::String(value));
                    message.metadata.insert(meta_key.to_string(), decoded);
                } else {
                    user_headers.insert(key, value);
                }
            }
        }
    }

    message.ensure_id();
    message.headers = user_headers;
    message.retry_count = retry_count.unwrap_or(0).min(message.max_retries);
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_headers_preserve_identity_and_metadata() {
        let mut original = Message::new("orders", b"raw".to_vec())
            .with_header("trace", "abc")
            .with_metadata("attempt_source", json!("scheduler"))
            .with_metadata("weight", json!(1.5))
            .with_metadata("tags", json!(["a", "b"]))
            .with_max_retries(5)
            .with_timestamp(from_unix(1_700_000_000));
        original.retry_count = 2;

        let wire = to_wire_headers(&original);
        assert!(wire.iter().any(|(k, v)| k == "meta_weight" && v == "1.5"));
        assert!(wire.iter().any(|(k, v)| k == MESSAGE_ID && v == &original.id));

        let decoded = from_wire_headers("orders", b"raw".to_vec(), wire);
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_foreign_payload_gets_fresh_identity() {
        let decoded = from_wire_headers(
            "t",
            b"x".to_vec(),
            vec![("content-kind".to_string(), "text".to_string())],
        );
        assert!(!decoded.id.is_empty());
        assert_eq!(decoded.retry_count, 0);
        assert_eq!(decoded.headers.get("content-kind").map(String::as_str), Some("text"));
    }

    #[test]
    fn test_non_json_meta_value_kept_as_string() {
        let decoded = from_wire_headers(
            "t",
            Vec::new(),
            vec![("meta_origin".to_string(), "legacy value".to_string())],
        );
        assert_eq!(decoded.metadata.get("origin"), Some(&json!("legacy value")));
    }
}
