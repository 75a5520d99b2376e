//! librdkafka client settings, produce, and record decoding.

use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::Message as _;
use tracing::debug;

use crate::config::{InitialOffset, LogConfig};
use crate::error::{BrokerError, BrokerResult};

const DRIVER: &str = "log";

/// librdkafka rejects socket setup timeouts below one second
const MIN_SOCKET_SETUP_MS: u64 = 1_000;

fn security_protocol(config: &LogConfig) -> &'static str {
    match (config.sasl.is_some(), config.tls.is_some()) {
        (true, true) => "SASL_SSL",
        (true, false) => "SASL_PLAINTEXT",
        (false, true) => "SSL",
        (false, false) => "PLAINTEXT",
    }
}

/// Settings shared by producers, consumers, and the admin client
pub fn base_config(config: &LogConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.brokers.join(","))
        .set("client.id", &config.client_id)
        .set(
            "socket.connection.setup.timeout.ms",
            config.connect_timeout_ms.max(MIN_SOCKET_SETUP_MS).to_string(),
        )
        .set("security.protocol", security_protocol(config));

    if let Some(version) = &config.version {
        client.set("broker.version.fallback", version);
    }

    if let Some(sasl) = &config.sasl {
        client
            .set("sasl.mechanism", sasl.mechanism.as_str())
            .set("sasl.username", &sasl.username)
            .set("sasl.password", &sasl.password);
    }

    if let Some(tls) = &config.tls {
        if let Some(ca) = &tls.ca_file {
            client.set("ssl.ca.location", ca);
        }
        if let Some(cert) = &tls.cert_file {
            client.set("ssl.certificate.location", cert);
        }
        if let Some(key) = &tls.key_file {
            client.set("ssl.key.location", key);
        }
        if tls.insecure_skip_verify {
            client.set("enable.ssl.certificate.verification", "false");
        }
    }

    client
}

pub fn producer_config(config: &LogConfig) -> ClientConfig {
    let mut client = base_config(config);
    client
        .set("acks", config.required_acks.to_string())
        .set("compression.type", config.compression.as_str())
        .set("linger.ms", config.flush_frequency_ms.to_string())
        .set("message.timeout.ms", config.operation_timeout_ms.to_string())
        .set("delivery.report.only.error", (!config.return_successes).to_string());
    client
}

pub fn consumer_config(config: &LogConfig, group: &str, auto_commit: bool) -> ClientConfig {
    let offset_reset = match config.initial_offset {
        InitialOffset::Oldest => "earliest",
        InitialOffset::Newest => "latest",
    };

    let mut client = base_config(config);
    client
        .set("group.id", group)
        .set("enable.auto.commit", auto_commit.to_string())
        .set("auto.commit.interval.ms", config.auto_commit_interval_ms.to_string())
        .set("auto.offset.reset", offset_reset)
        .set("session.timeout.ms", config.session_timeout_ms.to_string())
        .set("heartbeat.interval.ms", config.heartbeat_interval_ms.to_string())
        .set(
            "max.poll.interval.ms",
            config
                .rebalance_timeout_ms
                .max(config.session_timeout_ms)
                .to_string(),
        );
    client
}

/// Settings for the metadata client; lookups never create the topic they ask about
pub fn metadata_config(config: &LogConfig) -> ClientConfig {
    let mut client = base_config(config);
    client
        .set("group.id", format!("{}.metadata", config.group_id))
        .set("allow.auto.create.topics", "false")
        .set("enable.auto.commit", "false");
    client
}

/// Map a produce or admin failure onto the broker taxonomy
pub fn map_error(operation: &str, err: KafkaError, size_bytes: usize) -> BrokerError {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageSizeTooLarge) => {
            BrokerError::message_too_large(DRIVER, size_bytes)
        }
        Some(
            RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::BrokerNotAvailable,
        ) => {
            debug!(driver = DRIVER, operation, error = %err, "Log backend unavailable");
            BrokerError::not_connected(DRIVER)
        }
        _ => BrokerError::backend(DRIVER, operation, err),
    }
}

/// A record as it travels through the producer
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

/// How long `produce` waits on the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Wait for the delivery report, up to the timeout
    Confirmed(Duration),
    /// Return once the record is queued in the producer
    Queued,
}

impl Delivery {
    pub fn for_config(config: &LogConfig) -> Self {
        if config.return_successes {
            Self::Confirmed(config.operation_timeout())
        } else {
            Self::Queued
        }
    }
}

pub async fn produce(
    producer: &FutureProducer,
    topic: &str,
    record: &Record,
    delivery: Delivery,
) -> BrokerResult<()> {
    let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
    for (key, value) in &record.headers {
        headers = headers.insert(Header {
            key: key.as_str(),
            value: Some(value.as_bytes()),
        });
    }

    let future_record = FutureRecord::to(topic)
        .key(&record.key)
        .payload(&record.payload)
        .headers(headers);

    let timeout = match delivery {
        Delivery::Confirmed(timeout) => timeout,
        Delivery::Queued => {
            // The delivery future is dropped; librdkafka still sends the record.
            return match producer.send_result(future_record) {
                Ok(_) => Ok(()),
                Err((err, _)) => Err(map_error("produce", err, record.payload.len())),
            };
        }
    };

    match producer.send(future_record, Timeout::After(timeout)).await {
        Ok((partition, offset)) => {
            debug!(driver = DRIVER, topic = %topic, partition, offset, "Record produced");
            Ok(())
        }
        Err((err, _)) => Err(map_error("produce", err, record.payload.len())),
    }
}

/// Owned copy of a consumed record
#[derive(Debug, Clone)]
pub struct Consumed {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl Consumed {
    pub fn from_borrowed(record: &BorrowedMessage<'_>) -> Self {
        let headers = record
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|h| {
                        let value = h
                            .value
                            .map(|v| String::from_utf8_lossy(v).into_owned())
                            .unwrap_or_default();
                        (h.key.to_string(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            partition: record.partition(),
            offset: record.offset(),
            key: record
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            payload: record.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            headers,
        }
    }
}
