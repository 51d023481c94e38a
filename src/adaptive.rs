//! Adaptive concurrency controller (spec §4.2 "Adaptive concurrency",
//! §4.7 state machine, §8 scenario S7).
//!
//! Observer-based: every operation records its duration and success into a
//! [`PerformanceWindow`]; a ticker evaluates the window every 30s and
//! adjusts `current_concurrency`, tripping a circuit breaker on a bad
//! success rate the way the teacher's `executeWithRetry`-equivalent
//! helpers observe outcomes rather than special-casing call sites.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::config::AdaptiveConfig;

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

const WINDOW_CAPACITY: usize = 100;
const ADJUSTMENT_WINDOW: Duration = Duration::from_secs(30);
const BREAKER_RECOVERY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Sample {
    duration: Duration,
    success: bool,
    recorded_at_ms: i64,
}

/// A ring buffer of recent operation outcomes, capacity [`WINDOW_CAPACITY`]
/// by default (spec §3 "PerformanceWindow").
pub struct PerformanceWindow {
    samples: Mutex<VecDeque<Sample>>,
    capacity: usize,
}

impl PerformanceWindow {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(WINDOW_CAPACITY)),
            capacity: WINDOW_CAPACITY,
        }
    }

    pub fn record(&self, duration: Duration, success: bool, now_ms: i64) {
        let mut samples = self.samples.lock().unwrap();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(Sample {
            duration,
            success,
            recorded_at_ms: now_ms,
        });
    }

    pub fn success_rate(&self) -> f64 {
        let samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return 1.0;
        }
        let successes = samples.iter().filter(|s| s.success).count();
        successes as f64 / samples.len() as f64
    }

    pub fn avg_response_time(&self) -> Duration {
        let samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = samples.iter().map(|s| s.duration).sum();
        total / samples.len() as u32
    }

    pub fn p95_response_time(&self) -> Duration {
        let samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return Duration::ZERO;
        }
        let mut durations: Vec<Duration> = samples.iter().map(|s| s.duration).collect();
        durations.sort();
        let idx = ((durations.len() as f64) * 0.95).ceil() as usize;
        durations[idx.saturating_sub(1).min(durations.len() - 1)]
    }

    /// Success rate restricted to samples recorded at or after `since_ms` —
    /// used by the breaker's recovery check (spec §4.2 step 1).
    pub fn success_rate_since(&self, since_ms: i64) -> f64 {
        let samples = self.samples.lock().unwrap();
        let recent: Vec<&Sample> = samples.iter().filter(|s| s.recorded_at_ms >= since_ms).collect();
        if recent.is_empty() {
            return 1.0;
        }
        let successes = recent.iter().filter(|s| s.success).count();
        successes as f64 / recent.len() as f64
    }
}

impl Default for PerformanceWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustReason {
    PoorSuccess,
    Excellent,
    Slow,
    Hold,
    BreakerTripped,
    BreakerHeld,
    BreakerClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Normal,
    Open { triggered_at_ms: i64 },
}

struct State {
    current_concurrency: usize,
    breaker: BreakerState,
    last_adjusted_at_ms: Option<i64>,
}

/// Maintains a single `current_concurrency` in `[min, max]`, adjusted on a
/// 30s cadence by the rules in spec §4.2, with a circuit breaker that trips
/// to `min_concurrency` below a 0.50 success rate and only closes after the
/// 60s recovery delay AND a sustained >0.90 success rate (spec §4.7).
pub struct AdaptiveConcurrencyController {
    config: AdaptiveConfig,
    window: PerformanceWindow,
    state: Mutex<State>,
}

impl AdaptiveConcurrencyController {
    pub fn new(config: AdaptiveConfig) -> Self {
        let current = config.min_concurrency;
        Self {
            config,
            window: PerformanceWindow::new(),
            state: Mutex::new(State {
                current_concurrency: current,
                breaker: BreakerState::Normal,
                last_adjusted_at_ms: None,
            }),
        }
    }

    pub fn window(&self) -> &PerformanceWindow {
        &self.window
    }

    pub fn current_concurrency(&self) -> usize {
        self.state.lock().unwrap().current_concurrency
    }

    pub fn breaker_open(&self) -> bool {
        matches!(self.state.lock().unwrap().breaker, BreakerState::Open { .. })
    }

    pub fn record(&self, duration: Duration, success: bool, now_ms: i64) {
        self.window.record(duration, success, now_ms);
    }

    /// Runs the spec §4.2 evaluation. Intended to be called every 30s by a
    /// ticker; also safe to call more often since stabilization/recovery
    /// windows are time-gated internally.
    pub fn evaluate(&self, now_ms: i64) -> AdjustReason {
        let success_rate = self.window.success_rate();
        let mut state = self.state.lock().unwrap();

        match state.breaker {
            BreakerState::Open { triggered_at_ms } => {
                let recovery_elapsed =
                    now_ms.saturating_sub(triggered_at_ms) >= BREAKER_RECOVERY_DELAY.as_millis() as i64;
                let recovered_success_rate = self.window.success_rate_since(triggered_at_ms) > 0.90;
                if recovery_elapsed && recovered_success_rate {
                    state.breaker = BreakerState::Normal;
                    state.current_concurrency = (self.config.min_concurrency * 2)
                        .max((self.config.max_concurrency / 4).min(10))
                        .clamp(self.config.min_concurrency, self.config.max_concurrency);
                    state.last_adjusted_at_ms = Some(now_ms);
                    return AdjustReason::BreakerClosed;
                }
                return AdjustReason::BreakerHeld;
            }
            BreakerState::Normal => {}
        }

        if success_rate < 0.50 {
            state.breaker = BreakerState::Open { triggered_at_ms: now_ms };
            state.current_concurrency = self.config.min_concurrency;
            state.last_adjusted_at_ms = Some(now_ms);
            return AdjustReason::BreakerTripped;
        }

        if let Some(last) = state.last_adjusted_at_ms {
            if now_ms.saturating_sub(last) < ADJUSTMENT_WINDOW.as_millis() as i64 {
                return AdjustReason::Hold;
            }
        }

        let avg = self.window.avg_response_time();
        let reason = if success_rate < 0.80 {
            AdjustReason::PoorSuccess
        } else if success_rate > 0.98 && avg < Duration::from_millis(100) {
            AdjustReason::Excellent
        } else if success_rate > 0.98 && avg > Duration::from_millis(2_000) {
            AdjustReason::Slow
        } else {
            AdjustReason::Hold
        };

        match reason {
            AdjustReason::PoorSuccess | AdjustReason::Slow => {
                let decreased = (state.current_concurrency as f64 * 0.8).floor() as usize;
                state.current_concurrency = decreased
                    .max(self.config.min_concurrency)
                    .min(self.config.max_concurrency);
                state.last_adjusted_at_ms = Some(now_ms);
            }
            AdjustReason::Excellent => {
                let increased = (state.current_concurrency as f64 * 1.2).ceil() as usize;
                state.current_concurrency = increased
                    .max(self.config.min_concurrency)
                    .min(self.config.max_concurrency);
                state.last_adjusted_at_ms = Some(now_ms);
            }
            AdjustReason::Hold | AdjustReason::BreakerTripped | AdjustReason::BreakerHeld | AdjustReason::BreakerClosed => {}
        }

        reason
    }

    /// Drives `evaluate()` on the 30s cadence spec §4.2 expects in a
    /// running service, the way `spawn_sweeper`/`spawn_idle_reaper` drive
    /// their own periodic maintenance.
    pub fn spawn_ticker(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ADJUSTMENT_WINDOW);
            loop {
                interval.tick().await;
                let reason = self.evaluate(now_ms());
                debug!(?reason, concurrency = self.current_concurrency(), "adaptive concurrency evaluated");
            }
        })
    }
}
