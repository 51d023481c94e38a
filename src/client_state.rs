//! Client State Manager (spec §4.3) — subscriber ↔ symbol bidirectional
//! index, room broadcast, broadcast statistics.
//!
//! The three structures (forward `clientId -> ClientSubscription`,
//! `symbolToClients`, `providerToClients`) are held behind one `RwLock` so
//! they are updated as a single atomic group (spec §5 "Shared-resource
//! policy" (ii)) — readers never observe a torn state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use streamgate_protocol::gateway::BroadcastGateway;

use crate::error::GatewayBroadcastError;

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastHealthStatus {
    Excellent,
    Good,
    Warning,
    Critical,
}

pub struct ClientSubscription {
    pub client_id: String,
    pub symbols: HashSet<String>,
    pub capability: String,
    pub provider: String,
    pub subscription_time_ms: i64,
    pub last_active_time_ms: i64,
}

struct Indices {
    clients: HashMap<String, ClientSubscription>,
    symbol_to_clients: HashMap<String, HashSet<String>>,
    provider_to_clients: HashMap<String, HashSet<String>>,
}

impl Indices {
    fn new() -> Self {
        Self {
            clients: HashMap::new(),
            symbol_to_clients: HashMap::new(),
            provider_to_clients: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct RawCounters {
    gateway_success: AtomicU64,
    gateway_failure: AtomicU64,
    total_attempts: AtomicU64,
    gateway_broadcast_errors: AtomicU64,
}

/// Rolling counters (spec §3 "BroadcastStats") exposed read-only with
/// derived rates.
pub struct BroadcastStats {
    counters: RawCounters,
    start_time_ms: i64,
}

#[derive(Debug, Clone)]
pub struct BroadcastStatsSnapshot {
    pub gateway_success: u64,
    pub gateway_failure: u64,
    pub total_attempts: u64,
    pub gateway_usage_rate: f64,
    pub error_rate: f64,
    pub success_rate: f64,
    pub uptime_minutes: f64,
    pub health_status: BroadcastHealthStatus,
}

impl BroadcastStats {
    fn new() -> Self {
        Self {
            counters: RawCounters::default(),
            start_time_ms: now_ms(),
        }
    }

    fn record_success(&self) {
        self.counters.gateway_success.fetch_add(1, Ordering::Relaxed);
        self.counters.total_attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.counters.gateway_failure.fetch_add(1, Ordering::Relaxed);
        self.counters.total_attempts.fetch_add(1, Ordering::Relaxed);
        self.counters.gateway_broadcast_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BroadcastStatsSnapshot {
        let success = self.counters.gateway_success.load(Ordering::Relaxed);
        let failure = self.counters.gateway_failure.load(Ordering::Relaxed);
        let total = self.counters.total_attempts.load(Ordering::Relaxed);
        let error_rate = if total == 0 { 0.0 } else { failure as f64 / total as f64 };
        let usage_rate = if total == 0 { 1.0 } else { success as f64 / total as f64 };
        let uptime_minutes = (now_ms() - self.start_time_ms) as f64 / 60_000.0;

        let health_status = if error_rate > 0.10 || usage_rate < 0.80 {
            BroadcastHealthStatus::Critical
        } else if error_rate > 0.05 || usage_rate < 0.90 {
            BroadcastHealthStatus::Warning
        } else if error_rate > 0.01 || usage_rate < 0.95 {
            BroadcastHealthStatus::Good
        } else {
            BroadcastHealthStatus::Excellent
        };

        BroadcastStatsSnapshot {
            gateway_success: success,
            gateway_failure: failure,
            total_attempts: total,
            gateway_usage_rate: usage_rate,
            error_rate,
            success_rate: usage_rate,
            uptime_minutes,
            health_status,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientStateStats {
    pub client_count: usize,
    pub symbol_count: usize,
    pub provider_count: usize,
}

pub type SubscriptionChangeListener = Arc<dyn Fn(&str, &ClientSubscription) + Send + Sync>;

pub struct ClientStateManager {
    indices: RwLock<Indices>,
    listeners: RwLock<Vec<SubscriptionChangeListener>>,
    stats: BroadcastStats,
    client_timeout: Duration,
}

impl ClientStateManager {
    pub fn new(client_timeout: Duration) -> Self {
        Self {
            indices: RwLock::new(Indices::new()),
            listeners: RwLock::new(Vec::new()),
            stats: BroadcastStats::new(),
            client_timeout,
        }
    }

    pub fn broadcast_stats(&self) -> &BroadcastStats {
        &self.stats
    }

    pub async fn add_subscription_change_listener(&self, listener: SubscriptionChangeListener) {
        self.listeners.write().await.push(listener);
    }

    async fn notify_listeners(&self, event: &str, sub: &ClientSubscription) {
        for listener in self.listeners.read().await.iter() {
            // Listener errors must not affect the in-progress mutation
            // (spec §4.3) — there is no way to panic-catch a plain closure
            // call here, so listeners are expected to be infallible; any
            // fallible work they do must swallow its own errors.
            listener(event, sub);
        }
    }

    pub async fn add_client_subscription(
        &self,
        client_id: &str,
        symbols: &[String],
        capability: &str,
        provider: &str,
    ) {
        let now = now_ms();
        let mut indices = self.indices.write().await;
        let entry = indices
            .clients
            .entry(client_id.to_owned())
            .or_insert_with(|| ClientSubscription {
                client_id: client_id.to_owned(),
                symbols: HashSet::new(),
                capability: capability.to_owned(),
                provider: provider.to_owned(),
                subscription_time_ms: now,
                last_active_time_ms: now,
            });
        entry.capability = capability.to_owned();
        entry.provider = provider.to_owned();
        entry.last_active_time_ms = now;
        for symbol in symbols {
            entry.symbols.insert(symbol.clone());
            indices
                .symbol_to_clients
                .entry(symbol.clone())
                .or_default()
                .insert(client_id.to_owned());
        }
        indices
            .provider_to_clients
            .entry(provider.to_owned())
            .or_default()
            .insert(client_id.to_owned());

        let snapshot = clone_subscription(indices.clients.get(client_id).unwrap());
        drop(indices);
        self.notify_listeners("subscribe", &snapshot).await;
    }

    /// `symbols = None` or an empty slice drops the whole subscription
    /// (spec §4.3).
    pub async fn remove_client_subscription(&self, client_id: &str, symbols: Option<&[String]>) {
        let mut indices = self.indices.write().await;
        let Some(sub) = indices.clients.get_mut(client_id) else { return };

        let to_remove: Vec<String> = match symbols {
            None => sub.symbols.iter().cloned().collect(),
            Some(symbols) if symbols.is_empty() => sub.symbols.iter().cloned().collect(),
            Some(symbols) => symbols.to_vec(),
        };

        for symbol in &to_remove {
            sub.symbols.remove(symbol);
            if let Some(clients) = indices.symbol_to_clients.get_mut(symbol) {
                clients.remove(client_id);
                if clients.is_empty() {
                    indices.symbol_to_clients.remove(symbol);
                }
            }
        }

        let drop_entirely = symbols.is_none() || symbols.is_some_and(|s| s.is_empty()) || sub.symbols.is_empty();
        let snapshot = if drop_entirely {
            let provider = sub.provider.clone();
            let removed = indices.clients.remove(client_id).unwrap();
            if let Some(clients) = indices.provider_to_clients.get_mut(&provider) {
                clients.remove(client_id);
                if clients.is_empty() {
                    indices.provider_to_clients.remove(&provider);
                }
            }
            removed
        } else {
            clone_subscription(sub)
        };

        drop(indices);
        self.notify_listeners("unsubscribe", &snapshot).await;
    }

    pub async fn get_clients_for_symbol(&self, symbol: &str) -> Vec<String> {
        self.indices
            .read()
            .await
            .symbol_to_clients
            .get(symbol)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn get_client_symbols(&self, client_id: &str) -> Vec<String> {
        self.indices
            .read()
            .await
            .clients
            .get(client_id)
            .map(|sub| sub.symbols.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn get_all_required_symbols(&self, provider: Option<&str>, capability: Option<&str>) -> HashSet<String> {
        let indices = self.indices.read().await;
        indices
            .clients
            .values()
            .filter(|sub| provider.is_none_or(|p| sub.provider == p))
            .filter(|sub| capability.is_none_or(|c| sub.capability == c))
            .flat_map(|sub| sub.symbols.iter().cloned())
            .collect()
    }

    pub async fn update_client_activity(&self, client_id: &str) {
        if let Some(sub) = self.indices.write().await.clients.get_mut(client_id) {
            sub.last_active_time_ms = now_ms();
        }
    }

    pub async fn get_client_state_stats(&self) -> ClientStateStats {
        let indices = self.indices.read().await;
        ClientStateStats {
            client_count: indices.clients.len(),
            symbol_count: indices.symbol_to_clients.len(),
            provider_count: indices.provider_to_clients.len(),
        }
    }

    pub async fn clear_all(&self) {
        let mut indices = self.indices.write().await;
        indices.clients.clear();
        indices.symbol_to_clients.clear();
        indices.provider_to_clients.clear();
    }

    /// Removes clients idle longer than `client_timeout` (spec §4.3 idle
    /// reaper).
    pub async fn reap_idle_clients(&self) -> Vec<String> {
        let now = now_ms();
        let timeout_ms = self.client_timeout.as_millis() as i64;
        let idle: Vec<String> = self
            .indices
            .read()
            .await
            .clients
            .values()
            .filter(|sub| now.saturating_sub(sub.last_active_time_ms) > timeout_ms)
            .map(|sub| sub.client_id.clone())
            .collect();
        for client_id in &idle {
            self.remove_client_subscription(client_id, None).await;
        }
        idle
    }

    pub fn spawn_idle_reaper(self: &Arc<Self>, interval: Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let reaped = manager.reap_idle_clients().await;
                for client_id in reaped {
                    debug!(client_id, "idle client reaped");
                }
            }
        });
    }

    /// Broadcasts to the room for `symbol` via the gateway (spec §4.3).
    /// No legacy per-client fallback path exists — a gateway failure is
    /// always surfaced as [`GatewayBroadcastError`].
    pub async fn broadcast_to_symbol_via_gateway(
        &self,
        symbol: &str,
        data: serde_json::Value,
        gateway: &dyn BroadcastGateway,
    ) -> Result<(), GatewayBroadcastError> {
        let room = format!("symbol:{symbol}");
        let delivered = gateway.is_server_available()
            && gateway.broadcast_to_room(&room, "data", data).await;

        if !delivered {
            self.stats.record_failure();
            let health_status = self.stats.snapshot().health_status;
            warn!(symbol, ?health_status, "gateway broadcast failed");
            return Err(GatewayBroadcastError {
                symbol: symbol.to_owned(),
                health_status,
                reason: "gateway unavailable or broadcast_to_room returned false".to_owned(),
            });
        }

        self.stats.record_success();
        let now = now_ms();
        let mut indices = self.indices.write().await;
        if let Some(client_ids) = indices.symbol_to_clients.get(symbol).cloned() {
            for client_id in client_ids {
                if let Some(sub) = indices.clients.get_mut(&client_id) {
                    sub.last_active_time_ms = now;
                }
            }
        }
        debug!(symbol, "broadcast delivered");
        Ok(())
    }
}

fn clone_subscription(sub: &ClientSubscription) -> ClientSubscription {
    ClientSubscription {
        client_id: sub.client_id.clone(),
        symbols: sub.symbols.clone(),
        capability: sub.capability.clone(),
        provider: sub.provider.clone(),
        subscription_time_ms: sub.subscription_time_ms,
        last_active_time_ms: sub.last_active_time_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamgate_testkit::FakeBroadcastGateway;

    #[tokio::test]
    async fn index_consistency_holds_across_subscribe_and_unsubscribe() {
        let manager = ClientStateManager::new(Duration::from_secs(300));
        manager
            .add_client_subscription("c1", &["700.HK".to_owned()], "stream-stock-quote", "longport")
            .await;
        assert_eq!(manager.get_clients_for_symbol("700.HK").await, vec!["c1".to_owned()]);
        assert_eq!(manager.get_client_symbols("c1").await, vec!["700.HK".to_owned()]);

        manager.remove_client_subscription("c1", Some(&["700.HK".to_owned()])).await;
        assert!(manager.get_clients_for_symbol("700.HK").await.is_empty());
        assert!(manager.get_client_symbols("c1").await.is_empty());
    }

    #[tokio::test]
    async fn empty_symbols_drops_whole_subscription() {
        let manager = ClientStateManager::new(Duration::from_secs(300));
        manager
            .add_client_subscription("c1", &["AAPL.US".to_owned(), "MSFT.US".to_owned()], "cap", "longport")
            .await;
        manager.remove_client_subscription("c1", Some(&[])).await;
        let stats = manager.get_client_state_stats().await;
        assert_eq!(stats.client_count, 0);
    }

    #[tokio::test]
    async fn broadcast_failure_raises_error_and_updates_stats() {
        let manager = ClientStateManager::new(Duration::from_secs(300));
        let gateway = FakeBroadcastGateway::new();
        gateway.set_available(false);
        let err = manager
            .broadcast_to_symbol_via_gateway("AAPL.US", serde_json::json!({}), gateway.as_ref())
            .await
            .unwrap_err();
        assert_eq!(err.symbol, "AAPL.US");
        let snapshot = manager.broadcast_stats().snapshot();
        assert_eq!(snapshot.gateway_failure, 1);
    }

    #[tokio::test]
    async fn broadcast_success_updates_client_activity() {
        let manager = ClientStateManager::new(Duration::from_secs(300));
        manager
            .add_client_subscription("c1", &["AAPL.US".to_owned()], "cap", "longport")
            .await;
        let gateway = FakeBroadcastGateway::new();
        manager
            .broadcast_to_symbol_via_gateway("AAPL.US", serde_json::json!({"p": 1}), gateway.as_ref())
            .await
            .unwrap();
        let snapshot = manager.broadcast_stats().snapshot();
        assert_eq!(snapshot.gateway_success, 1);
        assert_eq!(snapshot.health_status, BroadcastHealthStatus::Excellent);
    }

    #[tokio::test]
    async fn idle_reaper_removes_stale_clients() {
        let manager = Arc::new(ClientStateManager::new(Duration::from_millis(1)));
        manager
            .add_client_subscription("c1", &["AAPL.US".to_owned()], "cap", "longport")
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let reaped = manager.reap_idle_clients().await;
        assert_eq!(reaped, vec!["c1".to_owned()]);
        assert!(manager.get_client_symbols("c1").await.is_empty());
    }
}
