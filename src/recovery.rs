//! Recovery Worker Pool (spec §4.6) — replays missed ticks to a
//! reconnecting subscriber from the replay cache.
//!
//! Admission (`schedule_recovery`) and processing (`process_task`) are
//! split the way spec.md draws the line: admission is synchronous
//! validation against an in-memory queue; processing happens on a fixed
//! pool of worker loops gated by a separate concurrency semaphore, so
//! `workerPoolSize` (how many loops exist) and `maxConcurrentRecoveries`
//! (how many tasks may be mid-flight) can be tuned independently.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::time::Instant;
use tracing::error;

use streamgate_protocol::ws::{BatchInfo, ClientType, FallbackOptions, MissingDataRange, RecoveryMetadata, WsOutbound};

use crate::config::RecoveryConfig;
use crate::error::RecoveryError;
use crate::replay_cache::ReplayCache;

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

const URGENT_THRESHOLD_MS: i64 = 5_000;

#[derive(Debug, Clone)]
pub struct RecoveryTask {
    pub client_id: String,
    pub symbols: Vec<String>,
    pub since_time: i64,
    pub request_time: i64,
    pub client_type: ClientType,
    pub max_batch_size: usize,
    pub idempotency_key: String,
}

impl RecoveryTask {
    /// `urgent = now - sinceTime < 5s` (spec §3 "RecoveryTask").
    pub fn urgent(&self) -> bool {
        now_ms().saturating_sub(self.since_time) < URGENT_THRESHOLD_MS
    }
}

/// `basePriority(clientType) + timeDecay(requestTime)` (spec §3). VIP
/// requests start ahead of standard ones; within a tier, older requests
/// decay toward the front so a burst of new reconnects can't starve a
/// request that's already been waiting.
fn base_priority(client_type: ClientType) -> i64 {
    match client_type {
        ClientType::Vip => 1_000,
        ClientType::Standard => 0,
    }
}

fn time_decay(request_time: i64) -> i64 {
    now_ms().saturating_sub(request_time).min(10_000) / 100
}

fn priority_of(task: &RecoveryTask) -> i64 {
    base_priority(task.client_type) + time_decay(task.request_time)
}

/// Delivers recovery frames to the client that asked for them. The real
/// implementation lives in the WebSocket Gateway adapter, which knows how
/// to route a `client_id` to a live socket; this boundary keeps the worker
/// pool free of any transport dependency.
#[async_trait]
pub trait RecoveryDelivery: Send + Sync {
    async fn send_to_client(&self, client_id: &str, frame: WsOutbound) -> bool;
}

struct QueuedTask {
    /// `basePriority(clientType) + timeDecay(requestTime)` (spec §3).
    /// Higher pops first; equal priorities fall back to arrival order so
    /// the queue stays FIFO within a tier.
    priority: i64,
    sequence: u64,
    task: RecoveryTask,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for QueuedTask {}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority).then_with(|| other.sequence.cmp(&self.sequence))
    }
}
impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct RateLimiter {
    qps: u32,
    state: Mutex<(Instant, f64)>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        Self {
            qps: qps.max(1),
            state: Mutex::new((Instant::now(), qps.max(1) as f64)),
        }
    }

    /// Leaky-bucket egress throttle shared across every worker.
    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.saturating_duration_since(state.0).as_secs_f64();
                state.1 = (state.1 + elapsed * self.qps as f64).min(self.qps as f64);
                state.0 = now;
                if state.1 >= 1.0 {
                    state.1 -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.1) / self.qps as f64)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

pub struct RecoveryWorkerPool {
    config: RecoveryConfig,
    cache: Arc<ReplayCache>,
    delivery: Arc<dyn RecoveryDelivery>,
    queue: Mutex<BinaryHeap<QueuedTask>>,
    seen_keys: Mutex<HashSet<String>>,
    sequence: AtomicU64,
    concurrency: Arc<Semaphore>,
    rate_limiter: Arc<RateLimiter>,
    notify: Notify,
}

impl RecoveryWorkerPool {
    pub fn new(config: RecoveryConfig, cache: Arc<ReplayCache>, delivery: Arc<dyn RecoveryDelivery>) -> Arc<Self> {
        let concurrency = Arc::new(Semaphore::new(config.max_concurrent_recoveries.max(1)));
        let rate_limiter = Arc::new(RateLimiter::new(config.max_recovery_qps));
        let pool = Arc::new(Self {
            config,
            cache,
            delivery,
            queue: Mutex::new(BinaryHeap::new()),
            seen_keys: Mutex::new(HashSet::new()),
            sequence: AtomicU64::new(0),
            concurrency,
            rate_limiter,
            notify: Notify::new(),
        });
        pool.clone().spawn_workers();
        pool
    }

    /// Admission (spec §4.6): timestamp presence, recovery-window check,
    /// idempotency dedup, then a priority-queue push.
    pub async fn schedule_recovery(&self, task: RecoveryTask) -> Result<(), RecoveryError> {
        if task.since_time <= 0 {
            return Err(RecoveryError::MissingTimestamp);
        }
        let elapsed_ms = now_ms().saturating_sub(task.since_time);
        if elapsed_ms > self.config.max_recovery_window_ms {
            return Err(RecoveryError::WindowExceeded {
                elapsed_ms,
                max_window_ms: self.config.max_recovery_window_ms,
            });
        }
        {
            let mut seen = self.seen_keys.lock().await;
            if !seen.insert(task.idempotency_key.clone()) {
                return Err(RecoveryError::Duplicate(task.idempotency_key.clone()));
            }
        }

        let priority = priority_of(&task);
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        self.queue.lock().await.push(QueuedTask { priority, sequence, task });
        self.notify.notify_one();
        Ok(())
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.lock().await.len()
    }

    fn spawn_workers(self: Arc<Self>) {
        for _ in 0..self.config.worker_pool_size.max(1) {
            let pool = self.clone();
            tokio::spawn(async move {
                loop {
                    let queued = pool.queue.lock().await.pop();
                    let Some(queued) = queued else {
                        pool.notify.notified().await;
                        continue;
                    };

                    let permit = match pool.concurrency.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };
                    let timeout = Duration::from_millis(pool.config.timeout_ms);
                    let outcome = tokio::time::timeout(timeout, pool.process_task(&queued.task)).await;
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => pool.emit_recovery_failed(&queued.task, &e.to_string()).await,
                        Err(_) => {
                            pool.emit_recovery_failed(&queued.task, "recovery task timed out").await;
                        }
                    }
                    pool.seen_keys.lock().await.remove(&queued.task.idempotency_key);
                    drop(permit);
                }
            });
        }
    }

    /// Processing (spec §4.6). Workers acquire their own logger/metrics
    /// calls inline and never touch any pipeline-scoped state — the only
    /// shared collaborators are the cache and the delivery sink.
    async fn process_task(&self, task: &RecoveryTask) -> Result<(), RecoveryError> {
        let batch_size = task.max_batch_size.min(self.config.batch_size).max(1);
        let recovery_start_time = now_ms();
        let mut total_recovered = 0usize;
        let mut missing_data_count = 0usize;

        for symbol in &task.symbols {
            let points = self.cache.get_data_since(symbol, task.since_time).await;
            if points.is_empty() {
                missing_data_count += 1;
                continue;
            }

            let chunks: Vec<&[streamgate_protocol::ws_points::CompressedPoint]> = points.chunks(batch_size).collect();
            let total_batches = chunks.len();
            for (i, chunk) in chunks.into_iter().enumerate() {
                self.rate_limiter.acquire().await;
                total_recovered += chunk.len();
                let frame = WsOutbound::RecoveryBatch {
                    client_id: task.client_id.clone(),
                    batch_info: BatchInfo {
                        total_batches,
                        current_batch: i + 1,
                        is_complete: i + 1 == total_batches,
                    },
                    recovered_data: chunk.to_vec(),
                    compression_ratio: None,
                    metadata: RecoveryMetadata {
                        recovery_start_time,
                        total_recovered,
                        missing_data_count,
                    },
                };
                let delivered = self.delivery.send_to_client(&task.client_id, frame).await;
                if !delivered {
                    return Err(RecoveryError::WarmCacheFailure(format!(
                        "delivery failed for client={} symbol={symbol}",
                        task.client_id
                    )));
                }
            }
        }
        Ok(())
    }

    async fn emit_recovery_failed(&self, task: &RecoveryTask, error: &str) {
        metrics::counter!("recovery_failure").increment(1);
        error!(client_id = %task.client_id, error, "recovery task failed, emitting terminal frame");
        let frame = WsOutbound::RecoveryFailed {
            client_id: task.client_id.clone(),
            error: error.to_owned(),
            recommended_action: "resubscribe".to_owned(),
            missing_data_range: MissingDataRange {
                from: task.since_time,
                to: now_ms(),
                affected_symbols: task.symbols.clone(),
            },
            fallback_options: FallbackOptions::default(),
        };
        let _ = self.delivery.send_to_client(&task.client_id, frame).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HotCacheConfig, TrimStrategy, WarmCacheConfig};
    use crate::replay_cache::InProcessWarmCacheStore;
    use std::sync::Mutex as StdMutex;
    use streamgate_protocol::ws_points::CompressedPoint;

    #[derive(Default)]
    struct FakeDelivery {
        frames: StdMutex<Vec<WsOutbound>>,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl RecoveryDelivery for FakeDelivery {
        async fn send_to_client(&self, _client_id: &str, frame: WsOutbound) -> bool {
            if self.fail.load(AtomicOrdering::SeqCst) {
                return false;
            }
            self.frames.lock().unwrap().push(frame);
            true
        }
    }

    fn recovery_config() -> RecoveryConfig {
        RecoveryConfig {
            batch_size: 2,
            max_recovery_window_ms: 30_000,
            max_recovery_qps: 10_000,
            worker_pool_size: 2,
            timeout_ms: 5_000,
            max_concurrent_recoveries: 4,
        }
    }

    async fn cache_with_points(symbol: &str, points: &[(f64, f64, i64)]) -> Arc<ReplayCache> {
        let cache = Arc::new(ReplayCache::new(
            HotCacheConfig { ttl_ms: 60_000, max_entries: 1_000 },
            WarmCacheConfig { ttl_ms: 60_000, stream_max_length: 1_000, trim_strategy: TrimStrategy::MaxLen },
            Arc::new(InProcessWarmCacheStore::new()),
        ));
        for &(p, v, t) in points {
            cache.cache_data_point(symbol, CompressedPoint::new(symbol, p, v, t)).await;
        }
        tokio::task::yield_now().await;
        cache
    }

    #[tokio::test]
    async fn admission_rejects_missing_timestamp() {
        let cache = cache_with_points("AAPL.US", &[]).await;
        let pool = RecoveryWorkerPool::new(recovery_config(), cache, Arc::new(FakeDelivery::default()));
        let err = pool
            .schedule_recovery(RecoveryTask {
                client_id: "c1".to_owned(),
                symbols: vec!["AAPL.US".to_owned()],
                since_time: 0,
                request_time: now_ms(),
                client_type: ClientType::Standard,
                max_batch_size: 100,
                idempotency_key: "k1".to_owned(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::MissingTimestamp));
    }

    #[tokio::test]
    async fn admission_rejects_window_exceeded() {
        let cache = cache_with_points("AAPL.US", &[]).await;
        let pool = RecoveryWorkerPool::new(recovery_config(), cache, Arc::new(FakeDelivery::default()));
        let err = pool
            .schedule_recovery(RecoveryTask {
                client_id: "c1".to_owned(),
                symbols: vec!["AAPL.US".to_owned()],
                since_time: 100,
                request_time: now_ms(),
                client_type: ClientType::Standard,
                max_batch_size: 100,
                idempotency_key: "k1".to_owned(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::WindowExceeded { .. }));
    }

    #[tokio::test]
    async fn admission_dedups_idempotency_key() {
        let cache = cache_with_points("AAPL.US", &[(1.0, 1.0, now_ms())]).await;
        let pool = RecoveryWorkerPool::new(recovery_config(), cache, Arc::new(FakeDelivery::default()));
        let task = RecoveryTask {
            client_id: "c1".to_owned(),
            symbols: vec!["AAPL.US".to_owned()],
            since_time: now_ms() - 1_000,
            request_time: now_ms(),
            client_type: ClientType::Standard,
            max_batch_size: 100,
            idempotency_key: "dup".to_owned(),
        };
        pool.schedule_recovery(task.clone()).await.unwrap();
        let err = pool.schedule_recovery(task).await.unwrap_err();
        assert!(matches!(err, RecoveryError::Duplicate(_)));
    }

    #[tokio::test]
    async fn processes_task_and_emits_complete_recovery_batches() {
        let now = now_ms();
        let cache = cache_with_points(
            "AAPL.US",
            &[(1.0, 1.0, now - 600), (2.0, 1.0, now - 400), (3.0, 1.0, now - 200)],
        )
        .await;
        let delivery = Arc::new(FakeDelivery::default());
        let pool = RecoveryWorkerPool::new(recovery_config(), cache, delivery.clone());

        pool.schedule_recovery(RecoveryTask {
            client_id: "c1".to_owned(),
            symbols: vec!["AAPL.US".to_owned()],
            since_time: now - 1_000,
            request_time: now,
            client_type: ClientType::Vip,
            max_batch_size: 100,
            idempotency_key: "task-1".to_owned(),
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let frames = delivery.frames.lock().unwrap().clone();
        assert_eq!(frames.len(), 2); // batch_size=2 over 3 points -> 2 batches
        match &frames[1] {
            WsOutbound::RecoveryBatch { batch_info, .. } => assert!(batch_info.is_complete),
            other => panic!("expected recovery_batch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delivery_failure_emits_terminal_recovery_failed_frame() {
        let now = now_ms();
        let cache = cache_with_points("AAPL.US", &[(1.0, 1.0, now - 200)]).await;
        let delivery = Arc::new(FakeDelivery::default());
        delivery.fail.store(true, AtomicOrdering::SeqCst);
        let pool = RecoveryWorkerPool::new(recovery_config(), cache, delivery.clone());

        pool.schedule_recovery(RecoveryTask {
            client_id: "c1".to_owned(),
            symbols: vec!["AAPL.US".to_owned()],
            since_time: now - 1_000,
            request_time: now,
            client_type: ClientType::Standard,
            max_batch_size: 100,
            idempotency_key: "task-2".to_owned(),
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // delivery always fails, so the recovery_failed frame also "fails"
        // to send, but the attempt itself must not panic the worker.
        assert!(delivery.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn vip_requests_outrank_standard_requests_of_equal_age() {
        let now = now_ms();
        let vip = RecoveryTask {
            client_id: "vip".to_owned(),
            symbols: vec!["AAPL.US".to_owned()],
            since_time: now - 1_000,
            request_time: now,
            client_type: ClientType::Vip,
            max_batch_size: 100,
            idempotency_key: "vip-1".to_owned(),
        };
        let standard = RecoveryTask { client_type: ClientType::Standard, ..vip.clone() };
        assert!(priority_of(&vip) > priority_of(&standard));
    }

    #[test]
    fn older_requests_decay_toward_the_front_within_a_tier() {
        let now = now_ms();
        let older = RecoveryTask {
            client_id: "c1".to_owned(),
            symbols: vec!["AAPL.US".to_owned()],
            since_time: now - 1_000,
            request_time: now - 9_000,
            client_type: ClientType::Standard,
            max_batch_size: 100,
            idempotency_key: "old".to_owned(),
        };
        let newer = RecoveryTask { request_time: now, ..older.clone() };
        assert!(priority_of(&older) > priority_of(&newer));
    }
}
