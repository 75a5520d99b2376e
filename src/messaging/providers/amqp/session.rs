//! Connection, channel, and declaration bookkeeping for the AMQP driver.
//!
//! The session is replaced wholesale on reconnect. Every replacement bumps a
//! generation counter that consumer loops watch to resume consumption.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use lapin::options::{
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

use crate::config::{AmqpConfig, ExchangeType};
use crate::error::{BrokerError, BrokerResult};

const DRIVER: &str = "amqp";

struct Session {
    connection: Connection,
    channel: Channel,
}

pub(super) struct SessionState {
    config: AmqpConfig,
    current: RwLock<Option<Session>>,
    /// Fed by lapin's error callback on the live connection
    lost_tx: mpsc::UnboundedSender<()>,
    generation: watch::Sender<u64>,
    declared_exchanges: RwLock<HashSet<String>>,
    declared_queues: RwLock<HashSet<String>>,
    delayed_plugin: AtomicBool,
}

impl SessionState {
    /// Connect, open the channel, and declare the main exchange
    pub async fn connect(
        config: AmqpConfig,
    ) -> BrokerResult<(Self, mpsc::UnboundedReceiver<()>)> {
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let (generation, _) = watch::channel(0);

        let state = Self {
            config,
            current: RwLock::new(None),
            lost_tx,
            generation,
            declared_exchanges: RwLock::new(HashSet::new()),
            declared_queues: RwLock::new(HashSet::new()),
            delayed_plugin: AtomicBool::new(false),
        };

        state.establish().await?;
        state.probe_delayed_plugin().await;
        Ok((state, lost_rx))
    }

    pub fn config(&self) -> &AmqpConfig {
        &self.config
    }

    pub fn exchange(&self) -> &str {
        &self.config.exchange
    }

    pub fn delayed_exchange(&self) -> String {
        format!("{}.delayed", self.config.exchange)
    }

    /// Whether delayed publishes can use the exchange plugin
    pub fn delayed_plugin(&self) -> bool {
        self.delayed_plugin.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn current_generation(&self) -> u64 {
        *self.generation.borrow()
    }

    async fn open_channel(&self, connection: &Connection) -> BrokerResult<Channel> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::connection(DRIVER, format!("channel creation failed: {e}")))?;

        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::configuration(DRIVER, format!("failed to set QoS: {e}")))?;
        Ok(channel)
    }

    async fn open(&self) -> BrokerResult<Session> {
        let uri = self.config.connection_uri();
        let connect = Connection::connect(
            &uri,
            ConnectionProperties::default().with_connection_name("unified-broker".into()),
        );

        let connection = tokio::time::timeout(self.config.connection_timeout(), connect)
            .await
            .map_err(|_| {
                BrokerError::connection(
                    DRIVER,
                    format!(
                        "timed out after {}ms connecting to {}",
                        self.config.connection_timeout_ms,
                        self.config.redacted_uri()
                    ),
                )
            })?
            .map_err(|e| {
                BrokerError::connection(
                    DRIVER,
                    format!("{}: {e}", self.config.redacted_uri()),
                )
            })?;

        let lost_tx = self.lost_tx.clone();
        connection.on_error(move |err| {
            warn!(driver = DRIVER, error = %err, "AMQP connection error");
            let _ = lost_tx.send(());
        });

        let channel = self.open_channel(&connection).await?;

        Ok(Session {
            connection,
            channel,
        })
    }

    /// Replace the current session and re-declare the main exchange
    pub async fn establish(&self) -> BrokerResult<()> {
        let session = self.open().await?;
        let channel = session.channel.clone();

        let previous = self.current.write().await.replace(session);
        if let Some(old) = previous {
            if old.connection.status().connected() {
                let _ = old.connection.close(200, "replaced").await;
            }
        }

        self.declared_exchanges.write().await.clear();
        self.declared_queues.write().await.clear();
        self.ensure_exchanges(&channel).await?;

        self.generation.send_modify(|g| *g += 1);
        info!(
            driver = DRIVER,
            uri = %self.config.redacted_uri(),
            generation = self.current_generation(),
            "AMQP session established"
        );
        Ok(())
    }

    /// Current channel, or `NotConnected` while the session is down
    ///
    /// A channel closed by a channel-level error is reopened on the live
    /// connection.
    pub async fn channel(&self) -> BrokerResult<Channel> {
        {
            let current = self.current.read().await;
            match current.as_ref() {
                Some(s) if s.connection.status().connected() && s.channel.status().connected() => {
                    return Ok(s.channel.clone());
                }
                Some(s) if s.connection.status().connected() => {}
                _ => return Err(BrokerError::not_connected(DRIVER)),
            }
        }

        let mut current = self.current.write().await;
        let Some(session) = current.as_mut() else {
            return Err(BrokerError::not_connected(DRIVER));
        };
        if !session.connection.status().connected() {
            return Err(BrokerError::not_connected(DRIVER));
        }
        if !session.channel.status().connected() {
            session.channel = self.open_channel(&session.connection).await?;
            info!(driver = DRIVER, "Reopened AMQP channel after channel error");
        }
        Ok(session.channel.clone())
    }

    /// Short-lived channel for operations that close their channel on failure
    pub async fn scratch_channel(&self) -> BrokerResult<Channel> {
        let current = self.current.read().await;
        match current.as_ref() {
            Some(s) if s.connection.status().connected() => s
                .connection
                .create_channel()
                .await
                .map_err(|e| BrokerError::backend(DRIVER, "create_channel", e)),
            _ => Err(BrokerError::not_connected(DRIVER)),
        }
    }

    pub async fn is_healthy(&self) -> bool {
        self.channel().await.is_ok()
    }

    /// Drain queued loss notifications after a reconnect
    pub fn drain_losses(rx: &mut mpsc::UnboundedReceiver<()>) {
        while rx.try_recv().is_ok() {}
    }

    pub async fn close(&self) {
        if let Some(session) = self.current.write().await.take() {
            if session.channel.status().connected() {
                let _ = session.channel.close(200, "closing").await;
            }
            if session.connection.status().connected() {
                let _ = session.connection.close(200, "closing").await;
            }
        }
    }

    fn main_exchange_kind(&self) -> (ExchangeKind, FieldTable) {
        match self.config.exchange_type {
            ExchangeType::Topic => (ExchangeKind::Topic, FieldTable::default()),
            ExchangeType::Direct => (ExchangeKind::Direct, FieldTable::default()),
            ExchangeType::Fanout => (ExchangeKind::Fanout, FieldTable::default()),
            ExchangeType::DelayedMessage => delayed_kind("topic"),
        }
    }

    pub async fn ensure_main_exchange(&self, channel: &Channel) -> BrokerResult<()> {
        let (kind, args) = self.main_exchange_kind();
        let exchange = self.config.exchange.clone();
        self.ensure_exchange(channel, &exchange, kind, args).await
    }

    /// Declare the main exchange and, on the plugin path, the delayed one
    pub async fn ensure_exchanges(&self, channel: &Channel) -> BrokerResult<()> {
        self.ensure_main_exchange(channel).await?;
        if uses_delayed_exchange(&self.config, self.delayed_plugin()) {
            let (kind, args) = delayed_kind(self.config.exchange_type.as_str());
            let name = self.delayed_exchange();
            self.ensure_exchange(channel, &name, kind, args).await?;
        }
        Ok(())
    }

    pub async fn ensure_exchange(
        &self,
        channel: &Channel,
        name: &str,
        kind: ExchangeKind,
        args: FieldTable,
    ) -> BrokerResult<()> {
        if self.declared_exchanges.read().await.contains(name) {
            return Ok(());
        }

        channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: self.config.durable,
                    auto_delete: self.config.auto_delete,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|e| BrokerError::backend(DRIVER, "exchange_declare", e))?;

        self.declared_exchanges.write().await.insert(name.to_string());
        Ok(())
    }

    /// Declare `queue` once per session
    pub async fn ensure_queue(
        &self,
        channel: &Channel,
        queue: &str,
        args: FieldTable,
    ) -> BrokerResult<()> {
        if self.declared_queues.read().await.contains(queue) {
            return Ok(());
        }

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: self.config.durable,
                    auto_delete: self.config.auto_delete,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|e| BrokerError::backend(DRIVER, "queue_declare", e))?;

        self.declared_queues.write().await.insert(queue.to_string());
        Ok(())
    }

    /// Declare `queue` and bind it for `routing_key` on the main exchange,
    /// plus the delayed exchange when the plugin path is active
    pub async fn ensure_bound_queue(
        &self,
        channel: &Channel,
        queue: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        if self.declared_queues.read().await.contains(queue) {
            return Ok(());
        }

        self.ensure_exchanges(channel).await?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: self.config.durable,
                    auto_delete: self.config.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::backend(DRIVER, "queue_declare", e))?;

        for exchange in session_exchanges(&self.config, self.delayed_plugin()) {
            channel
                .queue_bind(
                    queue,
                    &exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::backend(DRIVER, "queue_bind", e))?;
        }

        self.declared_queues.write().await.insert(queue.to_string());
        Ok(())
    }

    pub async fn forget_queue(&self, queue: &str) {
        self.declared_queues.write().await.remove(queue);
    }

    /// Detect the delayed-message exchange plugin
    ///
    /// An unknown exchange type closes the declaring channel, so the probe
    /// runs on a scratch channel.
    async fn probe_delayed_plugin(&self) {
        if self.config.exchange_type == ExchangeType::DelayedMessage {
            self.delayed_plugin.store(true, Ordering::Release);
            return;
        }

        let channel = match self.scratch_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(driver = DRIVER, error = %e, "Could not open channel for plugin probe");
                return;
            }
        };

        let (kind, args) = delayed_kind(self.config.exchange_type.as_str());
        let name = self.delayed_exchange();
        let available = channel
            .exchange_declare(
                &name,
                kind,
                ExchangeDeclareOptions {
                    durable: self.config.durable,
                    auto_delete: self.config.auto_delete,
                    ..Default::default()
                },
                args,
            )
            .await
            .is_ok();

        if channel.status().connected() {
            let _ = channel.close(200, "probe complete").await;
        }

        self.delayed_plugin.store(available, Ordering::Release);
        if available {
            self.declared_exchanges.write().await.insert(name);
            info!(driver = DRIVER, "Delayed-message exchange plugin detected");
        } else {
            debug!(
                driver = DRIVER,
                "Delayed-message plugin unavailable; delays use dead-letter TTL queues"
            );
        }
    }
}

/// A separate delayed exchange exists only when the main one is not itself delayed
pub(super) fn uses_delayed_exchange(config: &AmqpConfig, delayed_plugin: bool) -> bool {
    delayed_plugin && config.exchange_type != ExchangeType::DelayedMessage
}

/// Exchanges a session declares and binds subscription queues to, main first
pub(super) fn session_exchanges(config: &AmqpConfig, delayed_plugin: bool) -> Vec<String> {
    let mut exchanges = vec![config.exchange.clone()];
    if uses_delayed_exchange(config, delayed_plugin) {
        exchanges.push(format!("{}.delayed", config.exchange));
    }
    exchanges
}

fn delayed_kind(underlying: &str) -> (ExchangeKind, FieldTable) {
    let mut args = FieldTable::default();
    args.insert(
        "x-delayed-type".into(),
        AMQPValue::LongString(underlying.to_string().into()),
    );
    (ExchangeKind::Custom("x-delayed-message".to_string()), args)
}
