//! # Broker Drivers
//!
//! Concrete implementations of the [`Driver`](super::traits::Driver) trait.
//!
//! ## Drivers
//!
//! - [`AmqpDriver`] - AMQP 0.9.1 via the lapin crate
//! - [`LogDriver`] - Kafka-protocol partitioned log via rdkafka
//! - [`KvDriver`] - Redis pub/sub, lists, and sorted sets via the redis crate
//! - [`InMemoryDriver`] - Process-local channels and queues for testing

pub(crate) mod core;

pub mod amqp;
pub mod in_memory;
pub mod kv;
pub mod log;

pub use amqp::AmqpDriver;
pub use in_memory::InMemoryDriver;
pub use kv::KvDriver;
pub use log::LogDriver;
