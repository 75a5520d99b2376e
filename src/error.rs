//! # Broker Error Types
//!
//! One `thiserror` enum covers every failure the broker surfaces, from
//! configuration problems through backend faults. Drivers wrap backend errors
//! with their own name and the failing operation so callers can tell a KV
//! publish failure from an AMQP declare failure without matching on strings.

use thiserror::Error;

/// Result alias used throughout the crate
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Comprehensive broker error types
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Driver not supported: {driver}")]
    DriverNotSupported { driver: String },

    #[error("Driver not configured: {driver}: {message}")]
    DriverNotConfigured { driver: String, message: String },

    #[error("No default driver available")]
    DefaultUnavailable,

    #[error("Invalid configuration: {component}: {message}")]
    InvalidConfiguration { component: String, message: String },

    #[error("Connection failed: {driver}: {message}")]
    ConnectionFailed { driver: String, message: String },

    #[error("Not connected: {driver}")]
    NotConnected { driver: String },

    #[error("Broker closed: {driver}")]
    BrokerClosed { driver: String },

    #[error("Topic not found: {topic}")]
    TopicNotFound { topic: String },

    #[error("Queue not found: {queue}")]
    QueueNotFound { queue: String },

    #[error("Message too large: {driver}: {size_bytes} bytes")]
    MessageTooLarge { driver: String, size_bytes: usize },

    #[error("Max retries exceeded for message {message_id} after {retries} retries")]
    MaxRetriesExceeded { message_id: String, retries: u32 },

    #[error("Already subscribed: {key}")]
    AlreadySubscribed { key: String },

    #[error("Publish to {target} failed: {source}")]
    FanOutFailed {
        target: String,
        #[source]
        source: Box<BrokerError>,
    },

    #[error("Message serialization error: {message}")]
    Serialization { message: String },

    #[error("Message deserialization error: {message}")]
    Deserialization { message: String },

    #[error("Operation {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Operation {operation} cancelled")]
    Cancelled { operation: String },

    #[error("Backend error: {driver}: {operation}: {message}")]
    Backend {
        driver: String,
        operation: String,
        message: String,
    },
}

impl BrokerError {
    pub fn driver_not_supported(driver: impl Into<String>) -> Self {
        Self::DriverNotSupported {
            driver: driver.into(),
        }
    }

    pub fn driver_not_configured(driver: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DriverNotConfigured {
            driver: driver.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(driver: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            driver: driver.into(),
            message: message.into(),
        }
    }

    pub fn not_connected(driver: impl Into<String>) -> Self {
        Self::NotConnected {
            driver: driver.into(),
        }
    }

    pub fn closed(driver: impl Into<String>) -> Self {
        Self::BrokerClosed {
            driver: driver.into(),
        }
    }

    pub fn topic_not_found(topic: impl Into<String>) -> Self {
        Self::TopicNotFound {
            topic: topic.into(),
        }
    }

    pub fn queue_not_found(queue: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue: queue.into(),
        }
    }

    pub fn message_too_large(driver: impl Into<String>, size_bytes: usize) -> Self {
        Self::MessageTooLarge {
            driver: driver.into(),
            size_bytes,
        }
    }

    pub fn already_subscribed(key: impl Into<String>) -> Self {
        Self::AlreadySubscribed { key: key.into() }
    }

    /// Wrap the failure of one target in a Broadcast or Mirror
    pub fn fan_out(target: impl Into<String>, source: BrokerError) -> Self {
        Self::FanOutFailed {
            target: target.into(),
            source: Box::new(source),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Wrap a backend-returned error with the driver and operation that hit it
    pub fn backend(
        driver: impl Into<String>,
        operation: impl Into<String>,
        err: impl std::fmt::Display,
    ) -> Self {
        Self::Backend {
            driver: driver.into(),
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    /// Errors worth retrying with back-off
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. }
            | Self::NotConnected { .. }
            | Self::Timeout { .. }
            | Self::Backend { .. } => true,
            Self::FanOutFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Errors that should stop the application from starting
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfiguration { .. } | Self::DriverNotSupported { .. }
        )
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::deserialization(err.to_string())
        } else {
            Self::serialization(err.to_string())
        }
    }
}

impl From<config::ConfigError> for BrokerError {
    fn from(err: config::ConfigError) -> Self {
        Self::configuration("config", err.to_string())
    }
}

impl From<validator::ValidationErrors> for BrokerError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::configuration("validation", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_carries_driver_and_operation() {
        let err = BrokerError::backend("kv", "publish", "broken pipe");
        assert_eq!(err.to_string(), "Backend error: kv: publish: broken pipe");
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fan_out_wraps_source() {
        let err = BrokerError::fan_out("orders", BrokerError::closed("kv"));
        assert!(err.to_string().contains("orders"));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("Broker closed: kv"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_configuration_errors_are_fatal() {
        assert!(BrokerError::configuration("amqp", "missing block").is_fatal());
        assert!(BrokerError::driver_not_supported("nats").is_fatal());
        assert!(!BrokerError::topic_not_found("t").is_fatal());
    }

    #[test]
    fn test_json_errors_map_to_deserialization() {
        let err: BrokerError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, BrokerError::Deserialization { .. }));
    }
}
