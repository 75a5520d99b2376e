//! # Broker Configuration
//!
//! Typed configuration record for the broker and every driver it can build.
//! Blocks for drivers that are not selected may be absent; the block for the
//! selected driver must be present (see [`BrokerConfig::validate_for`]).
//!
//! Durations are stored as integer `_ms` / `_seconds` fields so they load
//! cleanly from environment variables, with `Duration` accessors alongside.

mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use validator::Validate;

use crate::error::{BrokerError, BrokerResult};

/// Backend selected for a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[serde(alias = "rabbitmq")]
    Amqp,
    #[serde(alias = "kafka")]
    Log,
    #[serde(alias = "redis")]
    Kv,
    #[serde(alias = "in_memory")]
    Memory,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amqp => "amqp",
            Self::Log => "log",
            Self::Kv => "kv",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "amqp" | "rabbitmq" => Ok(Self::Amqp),
            "log" | "kafka" => Ok(Self::Log),
            "kv" | "redis" => Ok(Self::Kv),
            "memory" | "in_memory" => Ok(Self::Memory),
            _ => Err(BrokerError::driver_not_supported(s)),
        }
    }
}

/// Top-level broker configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BrokerConfig {
    /// When false the manager starts without any driver
    pub enabled: bool,
    /// Default driver constructed at startup
    pub driver: DriverKind,
    /// Deadline applied by the manager to foreground operations
    #[validate(range(min = 1))]
    pub operation_timeout_ms: u64,
    #[validate(nested)]
    pub retry: RetryConfig,
    #[validate(nested)]
    pub health: HealthConfig,
    #[validate(nested)]
    pub amqp: Option<AmqpConfig>,
    #[validate(nested)]
    pub log: Option<LogConfig>,
    #[validate(nested)]
    pub kv: Option<KvConfig>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            driver: DriverKind::Kv,
            operation_timeout_ms: 30_000,
            retry: RetryConfig::default(),
            health: HealthConfig::default(),
            amqp: None,
            log: None,
            kv: Some(KvConfig::default()),
        }
    }
}

impl BrokerConfig {
    /// Configuration backed by the in-process driver
    pub fn in_memory() -> Self {
        Self {
            driver: DriverKind::Memory,
            kv: None,
            ..Self::default()
        }
    }

    pub fn with_driver(mut self, driver: DriverKind) -> Self {
        self.driver = driver;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    pub fn with_amqp(mut self, amqp: AmqpConfig) -> Self {
        self.amqp = Some(amqp);
        self
    }

    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_kv(mut self, kv: KvConfig) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Check field ranges, then that the block for `driver` exists
    pub fn validate_for(&self, driver: DriverKind) -> BrokerResult<()> {
        self.validate()?;

        let present = match driver {
            DriverKind::Amqp => self.amqp.is_some(),
            DriverKind::Log => self.log.is_some(),
            DriverKind::Kv => self.kv.is_some(),
            DriverKind::Memory => true,
        };

        if present {
            Ok(())
        } else {
            Err(BrokerError::configuration(
                driver.as_str(),
                format!("no `{driver}` configuration block"),
            ))
        }
    }
}

/// Retry policy settings shared by every driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    #[validate(range(min = 1.0))]
    pub multiplier: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub random_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval_ms: 1_000,
            max_interval_ms: 30_000,
            multiplier: 2.0,
            random_factor: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HealthConfig {
    #[validate(range(min = 1))]
    pub interval_ms: u64,
    #[validate(range(min = 1))]
    pub ping_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            ping_timeout_ms: 5_000,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

/// Exchange kinds accepted for the main AMQP exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeType {
    #[serde(rename = "topic")]
    Topic,
    #[serde(rename = "direct")]
    Direct,
    #[serde(rename = "fanout")]
    Fanout,
    #[serde(rename = "x-delayed-message")]
    DelayedMessage,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Topic => "topic",
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::DelayedMessage => "x-delayed-message",
        }
    }
}

/// AMQP driver settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AmqpConfig {
    /// Full connection URI; when set, overrides host/port/credentials/vhost
    pub url: Option<String>,
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    #[validate(length(min = 1))]
    pub exchange: String,
    pub exchange_type: ExchangeType,
    pub connection_timeout_ms: u64,
    pub heartbeat_interval_seconds: u16,
    #[validate(range(min = 1))]
    pub prefetch_count: u16,
    pub durable: bool,
    pub auto_delete: bool,
    /// Fixed back-off between reconnection attempts
    #[validate(range(min = 1))]
    pub reconnect_backoff_ms: u64,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            exchange: "broker".to_string(),
            exchange_type: ExchangeType::Topic,
            connection_timeout_ms: 10_000,
            heartbeat_interval_seconds: 30,
            prefetch_count: 10,
            durable: true,
            auto_delete: false,
            reconnect_backoff_ms: 5_000,
        }
    }
}

impl AmqpConfig {
    /// Connection URI, built from the discrete fields unless `url` is set
    pub fn connection_uri(&self) -> String {
        let base = match &self.url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => format!(
                "amqp://{}:{}@{}:{}/{}",
                self.username,
                self.password,
                self.host,
                self.port,
                encode_vhost(&self.vhost)
            ),
        };

        if base.contains("heartbeat=") || self.heartbeat_interval_seconds == 0 {
            return base;
        }
        let sep = if base.contains('?') { '&' } else { '?' };
        format!("{base}{sep}heartbeat={}", self.heartbeat_interval_seconds)
    }

    /// URI with credentials stripped, for logs
    pub fn redacted_uri(&self) -> String {
        let uri = self.connection_uri();
        match (uri.find("://"), uri.rfind('@')) {
            (Some(scheme_end), Some(at)) if at > scheme_end => {
                format!("{}***{}", &uri[..scheme_end + 3], &uri[at..])
            }
            _ => uri,
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

fn encode_vhost(vhost: &str) -> String {
    vhost.replace('%', "%25").replace('/', "%2f")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Snappy => "snappy",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }
}

/// Where a brand-new consumer group starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialOffset {
    Oldest,
    Newest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaslMechanism {
    #[serde(rename = "PLAIN")]
    Plain,
    #[serde(rename = "SCRAM-SHA-256")]
    ScramSha256,
    #[serde(rename = "SCRAM-SHA-512")]
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SaslConfig {
    pub mechanism: SaslMechanism,
    #[validate(length(min = 1))]
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TlsConfig {
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub ca_file: Option<String>,
    pub insecure_skip_verify: bool,
}

/// Partitioned-log driver settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LogConfig {
    #[validate(length(min = 1))]
    pub brokers: Vec<String>,
    #[validate(length(min = 1))]
    pub group_id: String,
    pub client_id: String,
    /// Broker protocol version hint
    pub version: Option<String>,
    pub connect_timeout_ms: u64,
    pub session_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub rebalance_timeout_ms: u64,
    pub return_successes: bool,
    #[validate(range(min = -1, max = 1))]
    pub required_acks: i16,
    pub compression: Compression,
    pub flush_frequency_ms: u64,
    pub enable_auto_commit: bool,
    pub auto_commit_interval_ms: u64,
    pub initial_offset: InitialOffset,
    /// Deadline for produce, metadata, and admin calls
    #[validate(range(min = 1))]
    pub operation_timeout_ms: u64,
    #[validate(nested)]
    pub sasl: Option<SaslConfig>,
    #[validate(nested)]
    pub tls: Option<TlsConfig>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            group_id: "unified-broker".to_string(),
            client_id: "unified-broker".to_string(),
            version: None,
            connect_timeout_ms: 10_000,
            session_timeout_ms: 10_000,
            heartbeat_interval_ms: 3_000,
            rebalance_timeout_ms: 60_000,
            return_successes: true,
            required_acks: -1,
            compression: Compression::None,
            flush_frequency_ms: 0,
            enable_auto_commit: true,
            auto_commit_interval_ms: 1_000,
            initial_offset: InitialOffset::Newest,
            operation_timeout_ms: 10_000,
            sasl: None,
            tls: None,
        }
    }
}

impl LogConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Key-value driver settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct KvConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    #[validate(range(min = 1))]
    pub pool_size: u32,
    pub min_idle_conns: u32,
    pub max_retries: usize,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    /// Delay dispatcher poll interval
    #[validate(range(min = 1))]
    pub poll_interval_ms: u64,
    /// Blocking pop timeout for job workers
    #[validate(range(min = 1))]
    pub block_timeout_ms: u64,
    #[validate(nested)]
    pub tls: Option<TlsConfig>,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: 0,
            pool_size: 10,
            min_idle_conns: 0,
            max_retries: 3,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 3_000,
            write_timeout_ms: 3_000,
            idle_timeout_ms: 300_000,
            poll_interval_ms: 1_000,
            block_timeout_ms: 1_000,
            tls: None,
        }
    }
}

impl KvConfig {
    pub fn connection_url(&self) -> String {
        let scheme = if self.tls.is_some() { "rediss" } else { "redis" };
        let auth = match &self.password {
            Some(password) if !password.is_empty() => format!(":{password}@"),
            _ => String::new(),
        };
        let insecure = match &self.tls {
            Some(tls) if tls.insecure_skip_verify => "#insecure",
            _ => "",
        };
        format!(
            "{scheme}://{auth}{}:{}/{}{insecure}",
            self.host, self.port, self.db
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Deadline for a single command round-trip
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(self.write_timeout_ms))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Idle lifetime of lazily opened pool connections; zero keeps them
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }
}
