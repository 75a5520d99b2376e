//! # Messaging Module
//!
//! Driver-agnostic publish/subscribe and job queues.
//!
//! - [`message`] - `Message`, `Job`, and topic descriptors
//! - [`traits`] - the `Driver` contract and handler traits
//! - [`provider`] - enum dispatch over the concrete drivers
//! - [`providers`] - AMQP, partitioned-log, KV, and in-memory drivers
//! - [`codec`] / [`headers`] - wire encodings shared by the drivers

pub mod codec;
pub mod headers;
pub mod message;
pub mod provider;
pub mod providers;
pub mod retry;
pub mod stats;
pub mod subscription;
pub mod traits;

pub use codec::JsonCodec;
pub use message::{Job, Message, TopicConfig, TopicInfo};
pub use provider::BrokerDriver;
pub use retry::RetryPolicy;
pub use stats::BrokerStats;
pub use subscription::SubscriptionHandle;
pub use traits::{Driver, JobHandler, MessageHandler};
