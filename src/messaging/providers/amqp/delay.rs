//! Delayed delivery over AMQP.
//!
//! With the delayed-message exchange plugin a publish carries an `x-delay`
//! header. Without it, each delayed message is parked in its own TTL queue
//! that dead-letters into the live exchange once the TTL expires.

use std::time::Duration;

use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel};

use crate::error::{BrokerError, BrokerResult};

const DRIVER: &str = "amqp";

/// How long an emptied TTL queue lingers before the server removes it
const TTL_QUEUE_GRACE_MS: i64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelayStrategy {
    /// Publish to a delayed-message exchange with an `x-delay` header
    Plugin { exchange: String },
    /// Park in a per-message queue that dead-letters into `exchange`
    DeadLetterTtl { exchange: String },
}

impl DelayStrategy {
    pub fn delay_ms(delay: Duration) -> i64 {
        i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)
    }

    pub fn ttl_queue_name(message_id: &str, delay_ms: i64) -> String {
        format!("delay_{message_id}_{delay_ms}")
    }

    pub fn ttl_queue_args(dead_letter_exchange: &str, routing_key: &str, delay_ms: i64) -> FieldTable {
        let mut args = FieldTable::default();
        args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(delay_ms));
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dead_letter_exchange.to_string().into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(routing_key.to_string().into()),
        );
        args.insert(
            "x-expires".into(),
            AMQPValue::LongLongInt(delay_ms.saturating_add(TTL_QUEUE_GRACE_MS)),
        );
        args
    }

    /// Publish `payload` so it reaches `routing_key` after `delay`
    #[allow(clippy::too_many_arguments)]
    pub async fn publish(
        &self,
        channel: &Channel,
        durable: bool,
        routing_key: &str,
        message_id: &str,
        payload: &[u8],
        mut headers: FieldTable,
        properties: BasicProperties,
        delay: Duration,
    ) -> BrokerResult<()> {
        let delay_ms = Self::delay_ms(delay);

        let (exchange, key) = match self {
            Self::Plugin { exchange } => {
                headers.insert("x-delay".into(), AMQPValue::LongLongInt(delay_ms));
                (exchange.clone(), routing_key.to_string())
            }
            Self::DeadLetterTtl { exchange } => {
                let queue = Self::ttl_queue_name(message_id, delay_ms);
                channel
                    .queue_declare(
                        &queue,
                        QueueDeclareOptions {
                            durable,
                            ..Default::default()
                        },
                        Self::ttl_queue_args(exchange, routing_key, delay_ms),
                    )
                    .await
                    .map_err(|e| BrokerError::backend(DRIVER, "declare_delay_queue", e))?;
                (String::new(), queue)
            }
        };

        channel
            .basic_publish(
                &exchange,
                &key,
                BasicPublishOptions::default(),
                payload,
                properties.with_headers(headers),
            )
            .await
            .map_err(|e| BrokerError::backend(DRIVER, "publish_delayed", e))?
            .await
            .map_err(|e| BrokerError::backend(DRIVER, "publish_confirm", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::ShortString;

    fn arg<'a>(table: &'a FieldTable, key: &str) -> Option<&'a AMQPValue> {
        table.inner().get(&ShortString::from(key))
    }

    #[test]
    fn test_ttl_queue_dead_letters_to_topic() {
        let args = DelayStrategy::ttl_queue_args("broker", "orders", 1500);
        assert_eq!(arg(&args, "x-message-ttl"), Some(&AMQPValue::LongLongInt(1500)));
        assert_eq!(
            arg(&args, "x-dead-letter-exchange"),
            Some(&AMQPValue::LongString("broker".to_string().into()))
        );
        assert_eq!(
            arg(&args, "x-dead-letter-routing-key"),
            Some(&AMQPValue::LongString("orders".to_string().into()))
        );
        assert_eq!(arg(&args, "x-expires"), Some(&AMQPValue::LongLongInt(61_500)));
    }

    #[test]
    fn test_ttl_queue_name_is_per_message() {
        assert_eq!(DelayStrategy::ttl_queue_name("abc", 250), "delay_abc_250");
        assert_eq!(DelayStrategy::delay_ms(Duration::from_secs(2)), 2000);
    }
}
