//! Replay Cache (spec §4.5) — two-tier ring buffer of compressed tick
//! points per symbol.
//!
//! The hot tier is an in-process LRU with a 5s per-entry TTL. The warm
//! tier is a trait (`WarmCacheStore`) because the upstream caches this
//! component is meant to share across nodes in production are an external
//! collaborator, not something this crate can fabricate a client for;
//! [`InProcessWarmCacheStore`] is the single-node default, structured the
//! same as the hot tier's own ring buffer so the trim strategies apply
//! identically.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use streamgate_protocol::ws_points::CompressedPoint;

use crate::client_state::ClientStateManager;
use crate::config::{HotCacheConfig, TrimStrategy, WarmCacheConfig};

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

struct Entry {
    point: CompressedPoint,
    inserted_at_ms: i64,
}

/// A per-symbol ring buffer with a shared entry TTL, used for both tiers.
struct SymbolBuffer {
    entries: Vec<Entry>,
    max_len: usize,
}

impl SymbolBuffer {
    fn new(max_len: usize) -> Self {
        Self { entries: Vec::new(), max_len }
    }

    fn push(&mut self, point: CompressedPoint, now: i64, trim_strategy: TrimStrategy) {
        self.entries.push(Entry { point, inserted_at_ms: now });
        match trim_strategy {
            TrimStrategy::MaxLen => {
                if self.entries.len() > self.max_len {
                    let excess = self.entries.len() - self.max_len;
                    self.entries.drain(0..excess);
                }
            }
            TrimStrategy::MinId => {
                // MINID trims by a minimum timestamp rather than a count;
                // the actual floor is enforced in `evict_expired`, so a
                // push only needs the MAXLEN-equivalent safety cap to
                // bound unbounded growth between evictions.
                if self.entries.len() > self.max_len * 2 {
                    let excess = self.entries.len() - self.max_len * 2;
                    self.entries.drain(0..excess);
                }
            }
        }
    }

    fn evict_expired(&mut self, now: i64, ttl_ms: i64) {
        self.entries.retain(|e| now.saturating_sub(e.inserted_at_ms) <= ttl_ms);
    }

    fn since(&self, since: i64) -> Vec<CompressedPoint> {
        self.entries
            .iter()
            .filter(|e| e.point.t > since)
            .map(|e| e.point.clone())
            .collect()
    }
}

/// The warm tier's external-store boundary. Trimming strategy and TTL are
/// still this crate's responsibility to request; the store only needs to
/// hold and return points.
#[async_trait]
pub trait WarmCacheStore: Send + Sync {
    async fn append(
        &self,
        symbol: &str,
        point: CompressedPoint,
        max_length: usize,
        trim_strategy: TrimStrategy,
    ) -> Result<(), String>;
    async fn range_since(&self, symbol: &str, since: i64) -> Result<Vec<CompressedPoint>, String>;
    async fn evict_expired(&self, ttl_ms: i64);
}

/// Single-node default: the same ring-buffer shape as the hot tier, just
/// kept behind its own lock so a future networked implementation can be
/// swapped in without touching callers.
#[derive(Default)]
pub struct InProcessWarmCacheStore {
    buffers: RwLock<HashMap<String, SymbolBuffer>>,
}

impl InProcessWarmCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WarmCacheStore for InProcessWarmCacheStore {
    async fn append(
        &self,
        symbol: &str,
        point: CompressedPoint,
        max_length: usize,
        trim_strategy: TrimStrategy,
    ) -> Result<(), String> {
        let mut buffers = self.buffers.write().await;
        let buffer = buffers
            .entry(symbol.to_owned())
            .or_insert_with(|| SymbolBuffer::new(max_length));
        buffer.max_len = max_length;
        buffer.push(point, now_ms(), trim_strategy);
        Ok(())
    }

    async fn range_since(&self, symbol: &str, since: i64) -> Result<Vec<CompressedPoint>, String> {
        let buffers = self.buffers.read().await;
        Ok(buffers.get(symbol).map(|b| b.since(since)).unwrap_or_default())
    }

    async fn evict_expired(&self, ttl_ms: i64) {
        let now = now_ms();
        let mut buffers = self.buffers.write().await;
        for buffer in buffers.values_mut() {
            buffer.evict_expired(now, ttl_ms);
        }
        buffers.retain(|_, b| !b.entries.is_empty());
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayCacheStats {
    pub hot_entries: usize,
    pub hot_symbols: usize,
    pub estimated_hot_mb: f64,
}

/// Component E (spec §2/§4.5). Holds the hot tier directly; the warm tier
/// is injected so tests (and, eventually, a networked implementation) can
/// swap it out.
pub struct ReplayCache {
    hot: RwLock<HashMap<String, SymbolBuffer>>,
    hot_config: HotCacheConfig,
    warm_config: WarmCacheConfig,
    warm: Arc<dyn WarmCacheStore>,
}

impl ReplayCache {
    pub fn new(hot_config: HotCacheConfig, warm_config: WarmCacheConfig, warm: Arc<dyn WarmCacheStore>) -> Self {
        Self {
            hot: RwLock::new(HashMap::new()),
            hot_config,
            warm_config,
            warm,
        }
    }

    pub async fn should_cache_symbol(&self, symbol: &str, clients: &ClientStateManager) -> bool {
        !clients.get_clients_for_symbol(symbol).await.is_empty()
    }

    pub async fn cache_data_point(&self, symbol: &str, point: CompressedPoint) {
        let now = now_ms();
        {
            let mut hot = self.hot.write().await;
            let buffer = hot
                .entry(symbol.to_owned())
                .or_insert_with(|| SymbolBuffer::new(self.hot_config.max_entries));
            buffer.max_len = self.hot_config.max_entries;
            buffer.push(point.clone(), now, TrimStrategy::MaxLen);
        }

        let warm = self.warm.clone();
        let symbol = symbol.to_owned();
        let max_length = self.warm_config.stream_max_length;
        let trim_strategy = self.warm_config.trim_strategy;
        tokio::spawn(async move {
            if let Err(e) = warm.append(&symbol, point, max_length, trim_strategy).await {
                warn!(symbol, error = %e, "warm-tier cache append failed");
                metrics::counter!("warm_cache_failure").increment(1);
            }
        });
    }

    /// Merges hot and (conditionally) warm-tier history for `symbol` since
    /// `since` (spec §4.5 `getDataSince`).
    pub async fn get_data_since(&self, symbol: &str, since: i64) -> Vec<CompressedPoint> {
        let now = now_ms();
        let hot_ttl = self.hot_config.ttl_ms;

        let mut merged: Vec<CompressedPoint> = {
            let mut hot = self.hot.write().await;
            if let Some(buffer) = hot.get_mut(symbol) {
                buffer.evict_expired(now, hot_ttl);
                buffer.since(since)
            } else {
                Vec::new()
            }
        };

        if since < now.saturating_sub(hot_ttl) {
            match self.warm.range_since(symbol, since).await {
                Ok(warm_points) => {
                    let cutoff = now.saturating_sub(hot_ttl);
                    merged.extend(warm_points.into_iter().filter(|p| p.t <= cutoff));
                }
                Err(e) => {
                    warn!(symbol, error = %e, "warm-tier range query failed, degrading to hot-tier-only");
                    metrics::counter!("warm_cache_failure").increment(1);
                }
            }
        }

        merged.sort_by_key(|p| p.t);
        merged.dedup_by(|a, b| a.t == b.t && a.s == b.s);
        merged
    }

    pub async fn stats(&self) -> ReplayCacheStats {
        let hot = self.hot.read().await;
        let hot_entries: usize = hot.values().map(|b| b.entries.len()).sum();
        ReplayCacheStats {
            hot_entries,
            hot_symbols: hot.len(),
            estimated_hot_mb: (hot_entries * 32) as f64 / (1024.0 * 1024.0),
        }
    }

    pub fn spawn_expiry_sweeper(self: &Arc<Self>, interval: std::time::Duration) {
        let cache = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let now = now_ms();
                let ttl = cache.hot_config.ttl_ms;
                let mut hot = cache.hot.write().await;
                for buffer in hot.values_mut() {
                    buffer.evict_expired(now, ttl);
                }
                hot.retain(|_, b| !b.entries.is_empty());
                drop(hot);
                cache.warm.evict_expired(cache.warm_config.ttl_ms).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ReplayCache {
        ReplayCache::new(
            HotCacheConfig { ttl_ms: 5_000, max_entries: 3 },
            WarmCacheConfig {
                ttl_ms: 30_000,
                stream_max_length: 10,
                trim_strategy: TrimStrategy::MaxLen,
            },
            Arc::new(InProcessWarmCacheStore::new()),
        )
    }

    #[tokio::test]
    async fn should_cache_symbol_reflects_subscriber_presence() {
        let cache = cache();
        let clients = ClientStateManager::new(std::time::Duration::from_secs(300));
        assert!(!cache.should_cache_symbol("AAPL.US", &clients).await);
        clients
            .add_client_subscription("c1", &["AAPL.US".to_owned()], "cap", "longport")
            .await;
        assert!(cache.should_cache_symbol("AAPL.US", &clients).await);
    }

    #[tokio::test]
    async fn get_data_since_returns_only_points_after_cursor() {
        let cache = cache();
        cache.cache_data_point("AAPL.US", CompressedPoint::new("AAPL.US", 100.0, 10.0, 1_000)).await;
        cache.cache_data_point("AAPL.US", CompressedPoint::new("AAPL.US", 101.0, 5.0, 2_000)).await;
        tokio::task::yield_now().await;

        let points = cache.get_data_since("AAPL.US", 1_000).await;
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].t, 2_000);
    }

    #[tokio::test]
    async fn hot_tier_max_entries_trims_oldest_first() {
        let cache = cache();
        for i in 0..5 {
            cache
                .cache_data_point("AAPL.US", CompressedPoint::new("AAPL.US", 100.0, 1.0, i * 1_000))
                .await;
        }
        let stats = cache.stats().await;
        assert_eq!(stats.hot_entries, 3);
        let points = cache.get_data_since("AAPL.US", -1).await;
        assert_eq!(points.iter().map(|p| p.t).collect::<Vec<_>>(), vec![2_000, 3_000, 4_000]);
    }

    #[tokio::test]
    async fn merges_hot_and_warm_tiers_sorted_ascending() {
        let warm = Arc::new(InProcessWarmCacheStore::new());
        warm.append(
            "AAPL.US",
            CompressedPoint::new("AAPL.US", 90.0, 1.0, -10_000),
            10,
            TrimStrategy::MaxLen,
        )
        .await
        .unwrap();
        let cache = ReplayCache::new(
            HotCacheConfig { ttl_ms: 5_000, max_entries: 10 },
            WarmCacheConfig { ttl_ms: 30_000, stream_max_length: 10, trim_strategy: TrimStrategy::MaxLen },
            warm,
        );
        cache.cache_data_point("AAPL.US", CompressedPoint::new("AAPL.US", 100.0, 1.0, now_ms())).await;
        tokio::task::yield_now().await;

        let points = cache.get_data_since("AAPL.US", -20_000).await;
        assert_eq!(points.len(), 2);
        assert!(points[0].t < points[1].t);
    }

    #[tokio::test]
    async fn warm_tier_failure_degrades_to_hot_only() {
        struct AlwaysFailsWarmStore;
        #[async_trait]
        impl WarmCacheStore for AlwaysFailsWarmStore {
            async fn append(&self, _: &str, _: CompressedPoint, _: usize, _: TrimStrategy) -> Result<(), String> {
                Ok(())
            }
            async fn range_since(&self, _: &str, _: i64) -> Result<Vec<CompressedPoint>, String> {
                Err("store unavailable".to_owned())
            }
            async fn evict_expired(&self, _: i64) {}
        }
        let cache = ReplayCache::new(
            HotCacheConfig { ttl_ms: 5_000, max_entries: 10 },
            WarmCacheConfig { ttl_ms: 30_000, stream_max_length: 10, trim_strategy: TrimStrategy::MaxLen },
            Arc::new(AlwaysFailsWarmStore),
        );
        cache.cache_data_point("AAPL.US", CompressedPoint::new("AAPL.US", 100.0, 1.0, now_ms())).await;
        tokio::task::yield_now().await;
        let points = cache.get_data_since("AAPL.US", -20_000).await;
        assert_eq!(points.len(), 1);
    }
}
