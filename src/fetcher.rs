//! Stream Data Fetcher (spec §4.2) — lifecycle and pool of upstream
//! provider stream connections.
//!
//! `active_connections` (key -> connection) and `connection_id_to_key`
//! (id -> key) are the two authoritative maps (spec §5 "Shared-resource
//! policy"), updated only at commit points: establishment success, close,
//! and cleanup. A recursive sweeper (teacher pattern: a dedicated worker
//! that loops with a shutdown-aware sleep, `services/receiver`'s
//! `watch::channel`-driven session loop) reconciles them every
//! `mapCleanupIntervalMs`. The retry/backoff shape (`RetryPolicy { base,
//! factor, max_retries }`) is not lifted from the teacher — it's invented
//! directly from spec §4.2's literal numbers (base 1s, factor 1.5, max 2
//! retries); `services/forwarder/src/uplink.rs` has no retry loop at all.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use streamgate_protocol::capability::{CapabilityHandle, CapabilityRegistry, ConnectionStatus, HandleEvent, RawTick};

use crate::adaptive::AdaptiveConcurrencyController;
use crate::config::PoolConfig;
use crate::error::{FetcherError, SubscriptionOutcome};
use crate::pool::ConnectionPoolManager;

/// Where a connection's normalized-later ticks go once they're off the
/// wire. The fetcher only owns connection lifecycle (spec §4.2); handing
/// ticks to the pipeline is the one piece of data-plane wiring it still
/// has to do, since it's the only thing holding the raw handle events.
pub trait TickSink: Send + Sync {
    fn ingest(&self, provider: &str, capability: &str, tick: RawTick);
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn connection_key(provider: &str, capability: &str) -> String {
    format!("{provider}:{capability}")
}

/// A handle to one upstream stream (spec §3 "StreamConnection").
pub struct StreamConnection {
    pub id: Uuid,
    pub key: String,
    pub provider: String,
    pub capability: String,
    pub ip: String,
    pub handle: Arc<dyn CapabilityHandle>,
    subscribed_symbols: std::sync::Mutex<std::collections::HashSet<String>>,
    connected: AtomicBool,
    last_active_at_ms: AtomicI64,
}

impl StreamConnection {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn last_active_at_ms(&self) -> i64 {
        self.last_active_at_ms.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        self.last_active_at_ms.store(now_ms(), Ordering::SeqCst);
    }

    /// Backdates `last_active_at_ms` for exercising inactivity-based tier-1
    /// classification in tests without sleeping.
    #[cfg(any(test, feature = "test-support"))]
    pub fn backdate_last_active(&self, ms_ago: i64) {
        self.last_active_at_ms.store(now_ms() - ms_ago, Ordering::SeqCst);
    }

    pub fn subscribed_symbols(&self) -> std::collections::HashSet<String> {
        self.subscribed_symbols.lock().unwrap().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.handle.status()
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("is_connected", &self.is_connected())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 1.5,
            max_retries: 2,
        }
    }
}

pub struct FetcherConfig {
    pub connection_timeout: Duration,
    pub retry: RetryPolicy,
    pub map_cleanup_interval: Duration,
    pub zombie_inactivity: Duration,
    pub polling_interval: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            map_cleanup_interval: Duration::from_secs(300),
            zombie_inactivity: Duration::from_secs(1_800),
            polling_interval: Duration::from_millis(100),
        }
    }
}

pub struct StreamDataFetcher {
    registry: Arc<dyn CapabilityRegistry>,
    pool: Arc<ConnectionPoolManager>,
    adaptive: Arc<AdaptiveConcurrencyController>,
    config: FetcherConfig,
    active_connections: RwLock<HashMap<String, Arc<StreamConnection>>>,
    connection_id_to_key: RwLock<HashMap<Uuid, String>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tick_sink: OnceLock<Arc<dyn TickSink>>,
}

impl StreamDataFetcher {
    pub fn new(
        registry: Arc<dyn CapabilityRegistry>,
        pool_config: PoolConfig,
        adaptive: Arc<AdaptiveConcurrencyController>,
        config: FetcherConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            registry,
            pool: Arc::new(ConnectionPoolManager::new(pool_config)),
            adaptive,
            config,
            active_connections: RwLock::new(HashMap::new()),
            connection_id_to_key: RwLock::new(HashMap::new()),
            shutdown_tx,
            shutdown_rx,
            tick_sink: OnceLock::new(),
        })
    }

    pub fn pool(&self) -> &ConnectionPoolManager {
        &self.pool
    }

    /// Wires ticks from every connection established from here on into
    /// `sink`. Idempotent beyond the first call — the pipeline is the only
    /// intended sink and `main.rs` sets it once, before any connection is
    /// established.
    pub fn set_tick_sink(&self, sink: Arc<dyn TickSink>) {
        let _ = self.tick_sink.set(sink);
    }

    /// Establish (or return the existing) handle for `(provider,
    /// capability)`. Exactly one [`StreamConnection`] exists per key while
    /// active (spec §3 invariant a).
    pub async fn establish_stream_connection(
        &self,
        provider: &str,
        capability: &str,
        ip: &str,
    ) -> Result<Arc<StreamConnection>, FetcherError> {
        let key = connection_key(provider, capability);

        if let Some(existing) = self.active_connections.read().await.get(&key) {
            return Ok(existing.clone());
        }

        self.pool.register_connection(&key, ip)?;

        let handle = match self.registry.resolve(provider, capability).await {
            Ok(handle) => handle,
            Err(_) => {
                self.pool.unregister_connection(&key, ip);
                return Err(FetcherError::CapabilityNotFound {
                    provider: provider.to_owned(),
                    capability: capability.to_owned(),
                });
            }
        };

        let id = Uuid::new_v4();
        let mut last_err = None;
        let mut attempt = 0u32;
        loop {
            let start = Instant::now();
            let connect_result = handle.connect().await;
            let wait_result = match &connect_result {
                Ok(()) => self.wait_for_connected(&handle).await,
                Err(e) => Err(e.to_string()),
            };
            let success = wait_result.is_ok();
            self.adaptive.record(start.elapsed(), success, now_ms());
            metrics::histogram!("stream_connection_establish_ms", "provider" => provider.to_owned())
                .record(start.elapsed().as_millis() as f64);

            match wait_result {
                Ok(()) => break,
                Err(e) => {
                    last_err = Some(e);
                    if attempt >= self.config.retry.max_retries {
                        self.pool.unregister_connection(&key, ip);
                        error!(provider, capability, attempts = attempt + 1, "establishing upstream connection exhausted retries");
                        return Err(FetcherError::RetriesExhausted {
                            key,
                            cause: last_err.unwrap_or_default(),
                        });
                    }
                    let backoff = self.config.retry.base.mul_f64(self.config.retry.factor.powi(attempt as i32));
                    warn!(provider, capability, attempt, backoff_ms = backoff.as_millis() as u64, "retrying upstream connection establishment");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }

        let connection = Arc::new(StreamConnection {
            id,
            key: key.clone(),
            provider: provider.to_owned(),
            capability: capability.to_owned(),
            ip: ip.to_owned(),
            handle: handle.clone(),
            subscribed_symbols: std::sync::Mutex::new(std::collections::HashSet::new()),
            connected: AtomicBool::new(true),
            last_active_at_ms: AtomicI64::new(now_ms()),
        });

        {
            let mut active = self.active_connections.write().await;
            let mut id_to_key = self.connection_id_to_key.write().await;
            active.insert(key.clone(), connection.clone());
            id_to_key.insert(id, key.clone());
        }

        self.spawn_status_observer(connection.clone());
        info!(provider, capability, %id, "upstream stream connection established");
        Ok(connection)
    }

    async fn wait_for_connected(&self, handle: &Arc<dyn CapabilityHandle>) -> Result<(), String> {
        let deadline = Instant::now() + self.config.connection_timeout;
        let mut events = handle.events();
        if handle.status() == ConnectionStatus::Connected {
            return Ok(());
        }
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err("connect timed out".to_owned());
            }
            match tokio::time::timeout(remaining, events.recv()).await {
                Ok(Ok(HandleEvent::Status(ConnectionStatus::Connected))) => return Ok(()),
                Ok(Ok(HandleEvent::Status(ConnectionStatus::Error))) => return Err("connect failed".to_owned()),
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => {
                    // lagged/closed event channel; fall back to polling status directly
                    if handle.status() == ConnectionStatus::Connected {
                        return Ok(());
                    }
                    tokio::time::sleep(self.config.polling_interval).await;
                }
                Err(_) => return Err("connect timed out".to_owned()),
            }
        }
    }

    /// Wires status/error observers so a transition to `closed`/`error`
    /// triggers map cleanup, without the pipeline having to poll.
    fn spawn_status_observer(self: &Arc<Self>, connection: Arc<StreamConnection>) {
        let fetcher = self.clone();
        let mut events = connection.handle.events();
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { return; }
                    }
                    event = events.recv() => {
                        match event {
                            Ok(HandleEvent::Status(ConnectionStatus::Closed | ConnectionStatus::Error)) => {
                                connection.connected.store(false, Ordering::SeqCst);
                                debug!(key = %connection.key, "upstream handle reported terminal status, cleaning up");
                                fetcher.cleanup_connection(&connection).await;
                                return;
                            }
                            Ok(HandleEvent::Status(_)) => {
                                connection.touch();
                            }
                            Ok(HandleEvent::Error(msg)) => {
                                warn!(key = %connection.key, error = %msg, "upstream handle reported an error");
                            }
                            Ok(HandleEvent::Data(tick)) => {
                                connection.touch();
                                if let Some(sink) = fetcher.tick_sink.get() {
                                    sink.ingest(&connection.provider, &connection.capability, tick);
                                }
                            }
                            Err(_) => return,
                        }
                    }
                }
            }
        });
    }

    pub async fn subscribe_to_symbols(
        &self,
        connection: &StreamConnection,
        symbols: &[String],
    ) -> Result<SubscriptionOutcome, FetcherError> {
        if !connection.is_connected() {
            return Err(FetcherError::NotConnected { key: connection.key.clone() });
        }
        if symbols.is_empty() {
            return Err(FetcherError::EmptySymbolSet);
        }
        let start = Instant::now();
        let result = connection.handle.subscribe(symbols).await;
        self.adaptive.record(start.elapsed(), result.is_ok(), now_ms());
        match result {
            Ok(()) => {
                let mut set = connection.subscribed_symbols.lock().unwrap();
                for s in symbols {
                    set.insert(s.clone());
                }
                connection.touch();
                Ok(SubscriptionOutcome::success(symbols.to_vec()))
            }
            Err(e) => Ok(SubscriptionOutcome::failure(symbols.to_vec(), e.to_string())),
        }
    }

    pub async fn unsubscribe_from_symbols(
        &self,
        connection: &StreamConnection,
        symbols: &[String],
    ) -> Result<SubscriptionOutcome, FetcherError> {
        if !connection.is_connected() {
            return Err(FetcherError::NotConnected { key: connection.key.clone() });
        }
        if symbols.is_empty() {
            return Err(FetcherError::EmptySymbolSet);
        }
        let start = Instant::now();
        let result = connection.handle.unsubscribe(symbols).await;
        self.adaptive.record(start.elapsed(), result.is_ok(), now_ms());
        match result {
            Ok(()) => {
                let mut set = connection.subscribed_symbols.lock().unwrap();
                for s in symbols {
                    set.remove(s);
                }
                connection.touch();
                Ok(SubscriptionOutcome::success(symbols.to_vec()))
            }
            Err(e) => Ok(SubscriptionOutcome::failure(symbols.to_vec(), e.to_string())),
        }
    }

    /// Idempotent close (spec §8 property 7). Cleanup runs even if the
    /// handle's `close()` itself misbehaves.
    pub async fn close_connection(&self, connection: &Arc<StreamConnection>) {
        connection.handle.close().await;
        connection.connected.store(false, Ordering::SeqCst);
        self.cleanup_connection(connection).await;
    }

    async fn cleanup_connection(&self, connection: &Arc<StreamConnection>) {
        let mut active = self.active_connections.write().await;
        let mut id_to_key = self.connection_id_to_key.write().await;
        active.remove(&connection.key);
        id_to_key.remove(&connection.id);
        drop(active);
        drop(id_to_key);
        self.pool.unregister_connection(&connection.key, &connection.ip);
    }

    pub async fn is_connection_active(&self, key: &str) -> bool {
        self.active_connections
            .read()
            .await
            .get(key)
            .is_some_and(|c| c.is_connected())
    }

    pub async fn get_connection(&self, key: &str) -> Option<Arc<StreamConnection>> {
        self.active_connections.read().await.get(key).cloned()
    }

    pub async fn all_connections(&self) -> Vec<Arc<StreamConnection>> {
        self.active_connections.read().await.values().cloned().collect()
    }

    pub async fn connections_for_provider(&self, provider: &str) -> Vec<Arc<StreamConnection>> {
        self.active_connections
            .read()
            .await
            .values()
            .filter(|c| c.provider == provider)
            .cloned()
            .collect()
    }

    /// Sweeps `active_connections` / `connection_id_to_key` for zombies
    /// (disconnected AND inactive beyond `zombie_inactivity`). Emits a
    /// memory-leak warning if the id map outgrows the active map by more
    /// than 2x (spec §4.2 "Map hygiene").
    pub async fn sweep(&self) {
        let now = now_ms();
        let zombie_threshold_ms = self.config.zombie_inactivity.as_millis() as i64;
        let zombies: Vec<Arc<StreamConnection>> = self
            .active_connections
            .read()
            .await
            .values()
            .filter(|c| !c.is_connected() && now.saturating_sub(c.last_active_at_ms()) > zombie_threshold_ms)
            .cloned()
            .collect();
        for zombie in &zombies {
            warn!(key = %zombie.key, "sweeping zombie connection");
            self.cleanup_connection(zombie).await;
        }

        let active_len = self.active_connections.read().await.len();
        let id_len = self.connection_id_to_key.read().await.len();
        if id_len > 2 * active_len.max(1) {
            error!(active_len, id_len, "connectionIdToKey has outgrown activeConnections 2x — possible memory leak");
        }
    }

    /// Spawns the recursive sweeper. Preferred over a periodic `interval`
    /// timer to avoid overlapping sweeps if one takes longer than the
    /// configured cadence (spec §9 design notes).
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let fetcher = self.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = self.config.map_cleanup_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        fetcher.sweep().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { return; }
                    }
                }
            }
        });
    }

    /// Publishes the single destroy signal, cancelling observers and the
    /// sweeper, then closes all connections concurrently with a hard 10s
    /// ceiling (spec §4.2 "Shutdown").
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let connections = self.all_connections().await;
        let closes = connections.iter().map(|c| self.close_connection(c));
        let _ = tokio::time::timeout(Duration::from_secs(10), futures_util::future::join_all(closes)).await;
        self.active_connections.write().await.clear();
        self.connection_id_to_key.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamgate_testkit::{FakeCapabilityHandle, FakeCapabilityRegistry};

    fn fetcher(registry: Arc<FakeCapabilityRegistry>) -> Arc<StreamDataFetcher> {
        StreamDataFetcher::new(
            registry,
            PoolConfig { max_global: 100, max_per_key: 1, max_per_ip: 100 },
            Arc::new(AdaptiveConcurrencyController::new(crate::config::AdaptiveConfig {
                min_concurrency: 2,
                max_concurrency: 10,
            })),
            FetcherConfig {
                connection_timeout: Duration::from_millis(500),
                ..FetcherConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn establishes_exactly_one_connection_per_key() {
        let registry = Arc::new(FakeCapabilityRegistry::new());
        let fetcher = fetcher(registry.clone());
        let a = fetcher
            .establish_stream_connection("longport", "stream-stock-quote", "10.0.0.1")
            .await
            .unwrap();
        let b = fetcher
            .establish_stream_connection("longport", "stream-stock-quote", "10.0.0.1")
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(fetcher.all_connections().await.len(), 1);
    }

    #[tokio::test]
    async fn capability_not_found_leaves_no_partial_state() {
        let registry = Arc::new(FakeCapabilityRegistry::new());
        registry.deny("acme", "stream-stock-quote");
        let fetcher = fetcher(registry);
        let err = fetcher
            .establish_stream_connection("acme", "stream-stock-quote", "10.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, FetcherError::CapabilityNotFound { .. }));
        assert_eq!(fetcher.all_connections().await.len(), 0);
        assert_eq!(fetcher.pool().get_stats().global.used, 0);
    }

    #[tokio::test]
    async fn subscribe_requires_connected_and_non_empty_symbols() {
        let registry = Arc::new(FakeCapabilityRegistry::new());
        let fetcher = fetcher(registry.clone());
        let conn = fetcher
            .establish_stream_connection("longport", "stream-stock-quote", "10.0.0.1")
            .await
            .unwrap();
        let err = fetcher.subscribe_to_symbols(&conn, &[]).await.unwrap_err();
        assert!(matches!(err, FetcherError::EmptySymbolSet));

        let outcome = fetcher
            .subscribe_to_symbols(&conn, &["700.HK".to_owned()])
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert!(conn.subscribed_symbols().contains("700.HK"));
    }

    #[tokio::test]
    async fn close_connection_is_idempotent() {
        let registry = Arc::new(FakeCapabilityRegistry::new());
        let fetcher = fetcher(registry.clone());
        let conn = fetcher
            .establish_stream_connection("longport", "stream-stock-quote", "10.0.0.1")
            .await
            .unwrap();
        fetcher.close_connection(&conn).await;
        fetcher.close_connection(&conn).await;
        assert_eq!(fetcher.all_connections().await.len(), 0);
        assert_eq!(fetcher.pool().get_stats().global.used, 0);
    }

    #[tokio::test]
    async fn handle_error_status_triggers_cleanup_without_explicit_close() {
        let registry = Arc::new(FakeCapabilityRegistry::new());
        let handle = FakeCapabilityHandle::new();
        registry.register("longport", "stream-stock-quote", handle.clone());
        let fetcher = fetcher(registry);
        let _conn = fetcher
            .establish_stream_connection("longport", "stream-stock-quote", "10.0.0.1")
            .await
            .unwrap();
        handle.force_status(streamgate_protocol::ConnectionStatus::Error);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetcher.all_connections().await.len(), 0);
    }
}
