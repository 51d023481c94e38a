//! Streaming Pipeline (spec §4.4) — the hot path: reverse symbol
//! normalization → rule-driven transform → cache write → fan-out.
//!
//! Ticks are funneled through one `mpsc` channel into a single micro-batch
//! loop (teacher pattern: `services/server`'s single `AppState`-owned
//! broadcast loop rather than one task per symbol) so the 50ms/200-item
//! batching window applies globally, not per connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, warn};

use streamgate_protocol::capability::RawTick;
use streamgate_protocol::gateway::BroadcastGateway;
use streamgate_protocol::rule::{FieldOp, NormalizeDirection, Rule, RuleReadService};

use crate::client_state::ClientStateManager;
use crate::config::PipelineConfig;
use crate::fetcher::TickSink;
use crate::replay_cache::ReplayCache;

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

struct PendingTick {
    provider: String,
    capability: String,
    tick: RawTick,
}

#[derive(Default)]
pub struct PipelineStats {
    pub total_ticks_processed: AtomicU64,
    pub normalization_failures: AtomicU64,
    pub rule_lookup_failures: AtomicU64,
    pub transform_failures: AtomicU64,
    pub cache_write_failures: AtomicU64,
    pub broadcast_failures: AtomicU64,
    pub back_pressure_drops: AtomicU64,
    pub batch_failures: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineStatsSnapshot {
    pub total_ticks_processed: u64,
    pub normalization_failures: u64,
    pub rule_lookup_failures: u64,
    pub transform_failures: u64,
    pub cache_write_failures: u64,
    pub broadcast_failures: u64,
    pub back_pressure_drops: u64,
    pub batch_failures: u64,
}

impl PipelineStats {
    fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            total_ticks_processed: self.total_ticks_processed.load(Ordering::Relaxed),
            normalization_failures: self.normalization_failures.load(Ordering::Relaxed),
            rule_lookup_failures: self.rule_lookup_failures.load(Ordering::Relaxed),
            transform_failures: self.transform_failures.load(Ordering::Relaxed),
            cache_write_failures: self.cache_write_failures.load(Ordering::Relaxed),
            broadcast_failures: self.broadcast_failures.load(Ordering::Relaxed),
            back_pressure_drops: self.back_pressure_drops.load(Ordering::Relaxed),
            batch_failures: self.batch_failures.load(Ordering::Relaxed),
        }
    }
}

/// Derives the rule-store `category` from a capability name (spec §9 open
/// question): an explicit table first, `stream-` prefix strip as the
/// documented last-resort fallback.
pub struct CategoryTable {
    table: HashMap<String, String>,
}

impl CategoryTable {
    pub fn new(table: HashMap<String, String>) -> Self {
        Self { table }
    }

    pub fn derive(&self, capability: &str) -> String {
        if let Some(category) = self.table.get(capability) {
            return category.clone();
        }
        capability.strip_prefix("stream-").unwrap_or(capability).to_owned()
    }
}

impl Default for CategoryTable {
    fn default() -> Self {
        let mut table = HashMap::new();
        table.insert("stream-stock-quote".to_owned(), "quote_fields".to_owned());
        table.insert("stream-option-quote".to_owned(), "option_fields".to_owned());
        table.insert("stream-trade".to_owned(), "trade_fields".to_owned());
        Self::new(table)
    }
}

fn apply_field_mapping(source: &serde_json::Value, mapping: &streamgate_protocol::rule::FieldMapping) -> Option<serde_json::Value> {
    let raw = source.get(&mapping.source_field)?;
    match mapping.op {
        FieldOp::Multiply | FieldOp::Divide | FieldOp::Add | FieldOp::Subtract => {
            let value = raw.as_f64()?;
            let operand = mapping.operand?;
            let result = match mapping.op {
                FieldOp::Multiply => value * operand,
                FieldOp::Divide => {
                    if operand == 0.0 {
                        return None;
                    }
                    value / operand
                }
                FieldOp::Add => value + operand,
                FieldOp::Subtract => value - operand,
                _ => unreachable!(),
            };
            Some(serde_json::json!(result))
        }
        FieldOp::Format => {
            let format = mapping.format.as_deref()?;
            Some(serde_json::Value::String(format.replace("{}", &raw.to_string())))
        }
        FieldOp::CustomDisabled => None,
    }
}

fn apply_rule(rule: &Rule, fields: &serde_json::Value) -> Option<serde_json::Value> {
    let mut out = serde_json::Map::new();
    for mapping in &rule.fields {
        if matches!(mapping.op, FieldOp::CustomDisabled) {
            continue;
        }
        match apply_field_mapping(fields, mapping) {
            Some(value) => {
                out.insert(mapping.target_field.clone(), value);
            }
            None => return None,
        }
    }
    Some(serde_json::Value::Object(out))
}

pub struct Pipeline {
    rules: Arc<dyn RuleReadService>,
    gateway: Arc<dyn BroadcastGateway>,
    cache: Arc<ReplayCache>,
    clients: Arc<ClientStateManager>,
    category_table: CategoryTable,
    rule_cache: RwLock<HashMap<(String, String), Rule>>,
    config: PipelineConfig,
    stats: Arc<PipelineStats>,
    tx: mpsc::Sender<PendingTick>,
}

impl Pipeline {
    pub fn new(
        rules: Arc<dyn RuleReadService>,
        gateway: Arc<dyn BroadcastGateway>,
        cache: Arc<ReplayCache>,
        clients: Arc<ClientStateManager>,
        category_table: CategoryTable,
        config: PipelineConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.batch_max_size * 4);
        let pipeline = Arc::new(Self {
            rules,
            gateway,
            cache,
            clients,
            category_table,
            rule_cache: RwLock::new(HashMap::new()),
            config,
            stats: Arc::new(PipelineStats::default()),
            tx,
        });
        pipeline.clone().spawn_batcher(rx);
        pipeline.clone().spawn_rule_change_listener();
        pipeline
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Entry point fed by a connection's `HandleEvent::Data` stream.
    /// Enforces the hard back-pressure cap by dropping the newest tick
    /// when the channel is already saturated (spec §4.4 "Back-pressure").
    pub fn ingest(&self, provider: &str, capability: &str, tick: RawTick) {
        let pending = PendingTick {
            provider: provider.to_owned(),
            capability: capability.to_owned(),
            tick,
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(pending) {
            self.stats.back_pressure_drops.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("back_pressure_drop").increment(1);
        }
    }

    fn spawn_rule_change_listener(self: Arc<Self>) {
        let mut changes = self.rules.subscribe_changes();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(event) => {
                        self.rule_cache
                            .write()
                            .await
                            .remove(&(event.provider.clone(), event.category.clone()));
                        debug!(provider = %event.provider, category = %event.category, "evicted cached rule");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        });
    }

    fn spawn_batcher(self: Arc<Self>, mut rx: mpsc::Receiver<PendingTick>) {
        let window = Duration::from_millis(self.config.batch_window_ms);
        let max_size = self.config.batch_max_size;
        tokio::spawn(async move {
            let mut buffer: Vec<PendingTick> = Vec::with_capacity(max_size);
            let mut ticker = tokio::time::interval(window);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !buffer.is_empty() {
                            let batch = std::mem::take(&mut buffer);
                            self.process_batch(batch).await;
                        }
                    }
                    received = rx.recv() => {
                        match received {
                            Some(pending) => {
                                if buffer.len() >= max_size {
                                    self.stats.back_pressure_drops.fetch_add(1, Ordering::Relaxed);
                                    metrics::counter!("back_pressure_drop").increment(1);
                                    continue;
                                }
                                buffer.push(pending);
                            }
                            None => {
                                if !buffer.is_empty() {
                                    let batch = std::mem::take(&mut buffer);
                                    self.process_batch(batch).await;
                                }
                                return;
                            }
                        }
                    }
                }
            }
        });
    }

    async fn process_batch(&self, batch: Vec<PendingTick>) {
        let mut groups: HashMap<(String, String), Vec<PendingTick>> = HashMap::new();
        for pending in batch {
            let category = self.category_table.derive(&pending.capability);
            groups.entry((pending.provider.clone(), category)).or_default().push(pending);
        }

        for ((provider, category), ticks) in groups {
            let n = ticks.len() as u64;
            match self.process_group(&provider, &category, ticks).await {
                Ok(()) => {}
                Err(e) => {
                    error!(provider, category, error = %e, "micro-batch degraded after exhausting retries");
                    self.stats.batch_failures.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("pipeline_batch_failure").increment(1);
                }
            }
            self.stats.total_ticks_processed.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Looks up the rule for `(provider, category)` once per group,
    /// retrying the lookup itself up to 3 times with exponential backoff
    /// if it doesn't answer promptly — the batch-level failure mode spec
    /// §4.4 describes. A `None` rule (no match) is not retried: it is a
    /// deterministic per-tick drop, not a transient failure.
    async fn process_group(&self, provider: &str, category: &str, ticks: Vec<PendingTick>) -> Result<(), String> {
        let cache_key = (provider.to_owned(), category.to_owned());
        if let Some(rule) = self.rule_cache.read().await.get(&cache_key).cloned() {
            for pending in ticks {
                self.process_tick(&rule, pending).await;
            }
            return Ok(());
        }

        let mut attempt = 0u32;
        let rule = loop {
            match tokio::time::timeout(Duration::from_millis(200), self.rules.find_rule_for(provider, category)).await {
                Ok(rule) => break rule,
                Err(_) if attempt < 3 => {
                    let backoff = Duration::from_millis(50 * 2u64.pow(attempt));
                    warn!(provider, category, attempt, "rule lookup timed out, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(_) => return Err("rule lookup timed out after exhausting retries".to_owned()),
            }
        };

        let Some(rule) = rule else {
            self.stats
                .rule_lookup_failures
                .fetch_add(ticks.len() as u64, Ordering::Relaxed);
            metrics::counter!("rule_lookup_failure").increment(ticks.len() as u64);
            warn!(provider, category, "no rule matched, dropping batch group");
            return Ok(());
        };

        self.rule_cache.write().await.insert(cache_key, rule.clone());
        for pending in ticks {
            self.process_tick(&rule, pending).await;
        }
        Ok(())
    }

    async fn process_tick(&self, rule: &Rule, pending: PendingTick) {
        let received_at = pending.tick.received_at;
        let provider = pending.provider;

        let Some(standard) = self
            .rules
            .normalize_symbol(&pending.tick.provider_symbol, &provider, NormalizeDirection::ToStandard)
            .await
        else {
            self.stats.normalization_failures.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("rule_lookup_failure").increment(1);
            warn!(provider, provider_symbol = %pending.tick.provider_symbol, "reverse symbol normalization failed, dropping tick");
            return;
        };

        let Some(normalized_fields) = apply_rule(rule, &pending.tick.fields) else {
            self.stats.transform_failures.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("transform_failure").increment(1);
            warn!(provider, symbol = %standard, "field transform failed, dropping tick");
            return;
        };

        let price = normalized_fields
            .get("lastPrice")
            .or_else(|| normalized_fields.get("price"))
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0);
        let volume = normalized_fields
            .get("volume")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0);
        let now = now_ms();

        if self.clients.get_clients_for_symbol(&standard).await.len() > 0 {
            let point = streamgate_protocol::ws_points::CompressedPoint::new(standard.clone(), price, volume, now);
            self.cache.cache_data_point(&standard, point).await;
        }

        let payload = serde_json::json!({
            "symbol": standard,
            "providerSymbol": pending.tick.provider_symbol,
            "data": normalized_fields,
            "timestamp": now,
        });

        match self
            .clients
            .broadcast_to_symbol_via_gateway(&standard, payload, self.gateway.as_ref())
            .await
        {
            Ok(()) => {
                let latency = (now - received_at).max(0) as f64;
                metrics::histogram!("stream_push_latency_ms", "provider" => provider).record(latency);
            }
            Err(e) => {
                self.stats.broadcast_failures.fetch_add(1, Ordering::Relaxed);
                warn!(symbol = %standard, error = %e, "broadcast failed for this symbol, other symbols unaffected");
            }
        }
    }
}

impl TickSink for Pipeline {
    fn ingest(&self, provider: &str, capability: &str, tick: RawTick) {
        Pipeline::ingest(self, provider, capability, tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HotCacheConfig, TrimStrategy, WarmCacheConfig};
    use crate::replay_cache::InProcessWarmCacheStore;
    use streamgate_protocol::rule::{FieldMapping, RuleChangeEvent};
    use streamgate_testkit::{FakeBroadcastGateway, FakeRuleReadService};

    fn test_pipeline(
        rules: Arc<FakeRuleReadService>,
        gateway: Arc<FakeBroadcastGateway>,
        clients: Arc<ClientStateManager>,
    ) -> Arc<Pipeline> {
        let cache = Arc::new(ReplayCache::new(
            HotCacheConfig { ttl_ms: 5_000, max_entries: 100 },
            WarmCacheConfig { ttl_ms: 30_000, stream_max_length: 100, trim_strategy: TrimStrategy::MaxLen },
            Arc::new(InProcessWarmCacheStore::new()),
        ));
        Pipeline::new(
            rules,
            gateway,
            cache,
            clients,
            CategoryTable::default(),
            PipelineConfig { batch_window_ms: 20, batch_max_size: 200 },
        )
    }

    #[tokio::test]
    async fn happy_path_tick_normalizes_transforms_caches_and_broadcasts() {
        let rules = Arc::new(FakeRuleReadService::new());
        rules.put_symbol_mapping("longport", "700.HK", "700.HK");
        rules.put_rule(streamgate_protocol::rule::Rule {
            provider: "longport".to_owned(),
            category: "quote_fields".to_owned(),
            fields: vec![FieldMapping {
                source_field: "last_done".to_owned(),
                target_field: "lastPrice".to_owned(),
                op: FieldOp::Multiply,
                operand: Some(1.0),
                format: None,
            }],
        });
        let gateway = FakeBroadcastGateway::new();
        let clients = Arc::new(ClientStateManager::new(Duration::from_secs(300)));
        clients.add_client_subscription("c1", &["700.HK".to_owned()], "stream-stock-quote", "longport").await;

        let pipeline = test_pipeline(rules, gateway.clone(), clients);
        pipeline.ingest(
            "longport",
            "stream-stock-quote",
            RawTick {
                provider_symbol: "700.HK".to_owned(),
                fields: serde_json::json!({"last_done": 561}),
                received_at: now_ms(),
            },
        );
        tokio::time::sleep(Duration::from_millis(60)).await;

        let sent = gateway.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "symbol:700.HK");
        let stats = pipeline.stats();
        assert_eq!(stats.total_ticks_processed, 1);
    }

    #[tokio::test]
    async fn no_rule_match_drops_tick_without_caching_or_broadcasting() {
        let rules = Arc::new(FakeRuleReadService::new());
        rules.put_symbol_mapping("longport", "AAPL.US", "AAPL.US");
        let gateway = FakeBroadcastGateway::new();
        let clients = Arc::new(ClientStateManager::new(Duration::from_secs(300)));
        let pipeline = test_pipeline(rules, gateway.clone(), clients);

        pipeline.ingest(
            "longport",
            "stream-stock-quote",
            RawTick {
                provider_symbol: "AAPL.US".to_owned(),
                fields: serde_json::json!({"last_done": 100}),
                received_at: now_ms(),
            },
        );
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(gateway.sent_frames().is_empty());
        assert_eq!(pipeline.stats().rule_lookup_failures, 1);
    }

    #[tokio::test]
    async fn back_pressure_drops_newest_ticks_once_buffer_is_full() {
        let rules = Arc::new(FakeRuleReadService::new());
        let gateway = FakeBroadcastGateway::new();
        let clients = Arc::new(ClientStateManager::new(Duration::from_secs(300)));
        let cache = Arc::new(ReplayCache::new(
            HotCacheConfig { ttl_ms: 5_000, max_entries: 100 },
            WarmCacheConfig { ttl_ms: 30_000, stream_max_length: 100, trim_strategy: TrimStrategy::MaxLen },
            Arc::new(InProcessWarmCacheStore::new()),
        ));
        let pipeline = Pipeline::new(
            rules,
            gateway,
            cache,
            clients,
            CategoryTable::default(),
            PipelineConfig { batch_window_ms: 5_000, batch_max_size: 2 },
        );
        for i in 0..5 {
            pipeline.ingest(
                "longport",
                "stream-stock-quote",
                RawTick {
                    provider_symbol: format!("S{i}"),
                    fields: serde_json::json!({}),
                    received_at: now_ms(),
                },
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pipeline.stats().back_pressure_drops >= 1);
    }

    #[tokio::test]
    async fn rule_change_event_evicts_cached_rule() {
        let rules = Arc::new(FakeRuleReadService::new());
        rules.put_symbol_mapping("longport", "700.HK", "700.HK");
        rules.put_rule(streamgate_protocol::rule::Rule {
            provider: "longport".to_owned(),
            category: "quote_fields".to_owned(),
            fields: vec![],
        });
        let gateway = FakeBroadcastGateway::new();
        let clients = Arc::new(ClientStateManager::new(Duration::from_secs(300)));
        let pipeline = test_pipeline(rules.clone(), gateway, clients);

        pipeline.ingest(
            "longport",
            "stream-stock-quote",
            RawTick {
                provider_symbol: "700.HK".to_owned(),
                fields: serde_json::json!({}),
                received_at: now_ms(),
            },
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(pipeline.rule_cache.read().await.contains_key(&("longport".to_owned(), "quote_fields".to_owned())));

        rules.emit_change(RuleChangeEvent { provider: "longport".to_owned(), category: "quote_fields".to_owned() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pipeline.rule_cache.read().await.contains_key(&("longport".to_owned(), "quote_fields".to_owned())));
    }
}
