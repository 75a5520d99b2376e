#![allow(clippy::doc_markdown)] // Allow technical terms like RabbitMQ, librdkafka in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Unified Broker
//!
//! Driver-agnostic publish/subscribe and job queues over an AMQP broker, a
//! Kafka-protocol partitioned log, a Redis-style key-value store, or an
//! in-process backend.
//!
//! ## Architecture
//!
//! Each backend is wrapped by a driver implementing one [`Driver`] contract.
//! Drivers synthesize what their backend lacks:
//!
//! - **Delayed delivery**: delayed-message exchange or dead-letter TTL queues
//!   (AMQP), a satellite topic with a relay (log), a sorted-set dispatcher
//!   (KV), or parked timers (memory)
//! - **Retries**: failed handlers republish with capped, jittered back-off
//!   until the message's retry ceiling
//! - **Reconnection**: AMQP consumers resume after the connection comes back
//!
//! The [`BrokerManager`] owns the drivers, probes their health, and offers
//! broadcast and cross-driver mirroring.
//!
//! ## Module Organization
//!
//! - [`manager`] - façade, health monitors, driver scopes
//! - [`messaging`] - value types, the driver contract, and the drivers
//! - [`config`] - typed configuration and the environment loader
//! - [`error`] - structured error handling
//! - [`logging`] - tracing subscriber setup
//!
//! ## Testing
//!
//! ```bash
//! cargo test                  # unit tests and in-memory end-to-end tests
//! cargo test -- --ignored     # backend tests; needs RabbitMQ, Kafka, Redis
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod messaging;

pub use config::{BrokerConfig, ConfigLoader, DriverKind};
pub use error::{BrokerError, BrokerResult};
pub use manager::{BrokerManager, DriverScope, HealthStatus};
pub use messaging::{
    BrokerDriver, BrokerStats, Driver, Job, JobHandler, JsonCodec, Message, MessageHandler,
    RetryPolicy, SubscriptionHandle, TopicConfig, TopicInfo,
};
