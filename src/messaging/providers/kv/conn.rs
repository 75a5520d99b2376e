//! Pooled command connections with per-command deadlines.
//!
//! Each pool slot holds one multiplexed, self-reconnecting connection.
//! The first `min_idle_conns` slots (at least one) open at connect and stay
//! open. The rest open on first use and close again once they sit unused
//! for `idle_timeout_ms`. Commands rotate across slots.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{Client, ClientTlsConfig, Cmd, FromRedisValue, RedisError, ScriptInvocation, TlsCertificates};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::config::{KvConfig, TlsConfig};
use crate::error::{BrokerError, BrokerResult};

const DRIVER: &str = "kv";

/// Connection-level failures mean the backend is unreachable right now
pub(super) fn map_error(operation: &str, err: RedisError) -> BrokerError {
    if err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_io_error()
        || err.is_timeout()
    {
        debug!(driver = DRIVER, operation, error = %err, "KV connection unavailable");
        BrokerError::not_connected(DRIVER)
    } else {
        BrokerError::backend(DRIVER, operation, err)
    }
}

/// Client for the configured endpoint, with TLS material loaded when set
pub(super) async fn build_client(config: &KvConfig) -> BrokerResult<Client> {
    let url = config.connection_url();
    let certificates = match &config.tls {
        Some(tls) => load_certificates(tls).await?,
        None => None,
    };
    let client = match certificates {
        Some(certificates) => Client::build_with_tls(url, certificates),
        None => Client::open(url),
    };
    client.map_err(|e| BrokerError::configuration(DRIVER, e.to_string()))
}

/// PEM material for the handshake; `None` when only system roots apply
pub(super) async fn load_certificates(tls: &TlsConfig) -> BrokerResult<Option<TlsCertificates>> {
    let client_tls = match (&tls.cert_file, &tls.key_file) {
        (Some(cert), Some(key)) => Some(ClientTlsConfig {
            client_cert: read_pem(cert).await?,
            client_key: read_pem(key).await?,
        }),
        (None, None) => None,
        _ => {
            return Err(BrokerError::configuration(
                DRIVER,
                "tls.cert_file and tls.key_file must be set together",
            ))
        }
    };
    let root_cert = match &tls.ca_file {
        Some(ca) => Some(read_pem(ca).await?),
        None => None,
    };

    if client_tls.is_none() && root_cert.is_none() {
        return Ok(None);
    }
    Ok(Some(TlsCertificates {
        client_tls,
        root_cert,
    }))
}

async fn read_pem(path: &str) -> BrokerResult<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| BrokerError::configuration(DRIVER, format!("{path}: {e}")))
}

/// Slots that stay open regardless of traffic
pub(super) fn retained_slots(config: &KvConfig) -> usize {
    let size = config.pool_size.max(1) as usize;
    (config.min_idle_conns as usize).clamp(1, size)
}

/// Whether slot `index` has been unused long enough to close
pub(super) fn is_idle(
    index: usize,
    retained: usize,
    idle_for: Duration,
    idle_timeout: Option<Duration>,
) -> bool {
    match idle_timeout {
        Some(limit) => index >= retained && idle_for >= limit,
        None => false,
    }
}

struct Slot {
    conn: AsyncMutex<Option<ConnectionManager>>,
    last_used: Mutex<Instant>,
}

impl Slot {
    fn new(conn: Option<ConnectionManager>) -> Self {
        Self {
            conn: AsyncMutex::new(conn),
            last_used: Mutex::new(Instant::now()),
        }
    }
}

struct Pool {
    client: Client,
    slots: Vec<Slot>,
    next: AtomicUsize,
    retained: usize,
    idle_timeout: Option<Duration>,
    connect_timeout: Duration,
    max_retries: usize,
    endpoint: String,
}

async fn open(
    client: &Client,
    connect_timeout: Duration,
    max_retries: usize,
    endpoint: &str,
) -> BrokerResult<ConnectionManager> {
    let connect = ConnectionManager::new_with_backoff(client.clone(), 2, 100, max_retries);
    tokio::time::timeout(connect_timeout, connect)
        .await
        .map_err(|_| {
            BrokerError::connection(
                DRIVER,
                format!(
                    "timed out after {}ms connecting to {endpoint}",
                    connect_timeout.as_millis()
                ),
            )
        })?
        .map_err(|e| BrokerError::connection(DRIVER, format!("{endpoint}: {e}")))
}

impl Pool {
    /// Connection from the next slot, opening it if needed
    async fn checkout(&self) -> BrokerResult<ConnectionManager> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let Some(slot) = self.slots.get(index) else {
            return Err(BrokerError::not_connected(DRIVER));
        };

        let mut conn = slot.conn.lock().await;
        let manager = match conn.as_ref() {
            Some(manager) => manager.clone(),
            None => {
                let manager =
                    open(&self.client, self.connect_timeout, self.max_retries, &self.endpoint).await?;
                debug!(driver = DRIVER, slot = index, "Opened pooled connection");
                *conn = Some(manager.clone());
                manager
            }
        };
        *slot.last_used.lock() = Instant::now();
        Ok(manager)
    }

    fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let mut closed = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            let idle_for = now.saturating_duration_since(*slot.last_used.lock());
            if !is_idle(index, self.retained, idle_for, self.idle_timeout) {
                continue;
            }
            // A slot mid-checkout is in use
            if let Ok(mut conn) = slot.conn.try_lock() {
                if conn.take().is_some() {
                    closed += 1;
                }
            }
        }
        closed
    }

    fn open_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.conn.try_lock().map_or(true, |conn| conn.is_some()))
            .count()
    }
}

#[derive(Clone)]
pub(super) struct KvConnection {
    pool: Arc<Pool>,
    timeout: Duration,
}

impl KvConnection {
    pub async fn connect(client: &Client, config: &KvConfig) -> BrokerResult<Self> {
        let endpoint = format!("{}:{}", config.host, config.port);
        let size = config.pool_size.max(1) as usize;
        let retained = retained_slots(config);

        let mut slots = Vec::with_capacity(size);
        for _ in 0..retained {
            let manager = open(client, config.connect_timeout(), config.max_retries, &endpoint).await?;
            slots.push(Slot::new(Some(manager)));
        }
        slots.resize_with(size, || Slot::new(None));

        let connection = Self {
            pool: Arc::new(Pool {
                client: client.clone(),
                slots,
                next: AtomicUsize::new(0),
                retained,
                idle_timeout: config.idle_timeout(),
                connect_timeout: config.connect_timeout(),
                max_retries: config.max_retries,
                endpoint,
            }),
            timeout: config.command_timeout(),
        };
        connection
            .query::<String>("ping", &redis::cmd("PING"))
            .await
            .map_err(|e| BrokerError::connection(DRIVER, e.to_string()))?;
        Ok(connection)
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }

    pub async fn query<T: FromRedisValue>(&self, operation: &str, cmd: &Cmd) -> BrokerResult<T> {
        let mut conn = self.pool.checkout().await?;
        match tokio::time::timeout(self.timeout, cmd.query_async::<_, T>(&mut conn)).await {
            Ok(result) => result.map_err(|e| map_error(operation, e)),
            Err(_) => Err(BrokerError::timeout(format!("kv {operation}"), self.timeout_ms())),
        }
    }

    /// Run a server-side script under the same deadline as a command
    pub async fn invoke<T: FromRedisValue>(
        &self,
        operation: &str,
        invocation: &ScriptInvocation<'_>,
    ) -> BrokerResult<T> {
        let mut conn = self.pool.checkout().await?;
        match tokio::time::timeout(self.timeout, invocation.invoke_async::<_, T>(&mut conn)).await {
            Ok(result) => result.map_err(|e| map_error(operation, e)),
            Err(_) => Err(BrokerError::timeout(format!("kv {operation}"), self.timeout_ms())),
        }
    }

    /// How often the reaper should look for idle slots, if ever
    pub fn reap_interval(&self) -> Option<Duration> {
        self.pool
            .idle_timeout
            .filter(|_| self.pool.slots.len() > self.pool.retained)
            .map(|idle| (idle / 2).max(Duration::from_millis(100)))
    }

    /// Close lazily opened slots that have gone idle; returns how many closed
    pub fn reap_idle(&self) -> usize {
        self.pool.reap_idle()
    }

    pub fn open_connections(&self) -> usize {
        self.pool.open_count()
    }

    pub fn pool_size(&self) -> usize {
        self.pool.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_retained_slots_bounded_by_pool() {
        let config = KvConfig {
            pool_size: 4,
            min_idle_conns: 0,
            ..Default::default()
        };
        assert_eq!(retained_slots(&config), 1);

        let config = KvConfig {
            pool_size: 4,
            min_idle_conns: 9,
            ..Default::default()
        };
        assert_eq!(retained_slots(&config), 4);
    }

    #[test]
    fn test_only_lazy_slots_go_idle() {
        let idle = Some(Duration::from_secs(60));
        assert!(!is_idle(0, 2, Duration::from_secs(600), idle));
        assert!(!is_idle(3, 2, Duration::from_secs(10), idle));
        assert!(is_idle(3, 2, Duration::from_secs(60), idle));
        assert!(!is_idle(3, 2, Duration::from_secs(600), None));
    }

    fn pem(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_tls_files_are_loaded() {
        let ca = pem("ca-pem");
        let cert = pem("cert-pem");
        let key = pem("key-pem");
        let tls = TlsConfig {
            ca_file: Some(ca.path().display().to_string()),
            cert_file: Some(cert.path().display().to_string()),
            key_file: Some(key.path().display().to_string()),
            insecure_skip_verify: false,
        };

        let loaded = load_certificates(&tls).await.unwrap().unwrap();
        assert_eq!(loaded.root_cert.as_deref(), Some(b"ca-pem".as_slice()));
        let client_tls = loaded.client_tls.unwrap();
        assert_eq!(client_tls.client_cert, b"cert-pem");
        assert_eq!(client_tls.client_key, b"key-pem");
    }

    #[tokio::test]
    async fn test_tls_without_files_uses_system_roots() {
        let tls = TlsConfig {
            insecure_skip_verify: true,
            ..Default::default()
        };
        assert!(load_certificates(&tls).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tls_misconfiguration_is_rejected() {
        let cert = pem("cert-pem");
        let half_pair = TlsConfig {
            cert_file: Some(cert.path().display().to_string()),
            ..Default::default()
        };
        assert!(matches!(
            load_certificates(&half_pair).await,
            Err(BrokerError::InvalidConfiguration { .. })
        ));

        let missing_ca = TlsConfig {
            ca_file: Some("/nonexistent/ca.pem".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            load_certificates(&missing_ca).await,
            Err(BrokerError::InvalidConfiguration { .. })
        ));
    }
}
