//! Gateway configuration loading.
//!
//! TOML is the sole config source, validated and defaulted into a typed
//! [`Config`] the way `forwarder::config` does it. `BIND_ADDR` and
//! `LOG_LEVEL` env vars override their TOML counterparts, matching
//! `services/server/src/main.rs`.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub pool: PoolConfig,
    pub pipeline: PipelineConfig,
    pub hot_cache: HotCacheConfig,
    pub warm_cache: WarmCacheConfig,
    pub memory_alert_threshold_mb: u64,
    pub recovery: RecoveryConfig,
    pub adaptive: AdaptiveConfig,
    pub reaper: ReaperConfig,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_global: u32,
    pub max_per_key: u32,
    pub max_per_ip: u32,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_window_ms: u64,
    pub batch_max_size: usize,
}

#[derive(Debug, Clone)]
pub struct HotCacheConfig {
    pub ttl_ms: i64,
    pub max_entries: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimStrategy {
    MaxLen,
    MinId,
}

#[derive(Debug, Clone)]
pub struct WarmCacheConfig {
    pub ttl_ms: i64,
    pub stream_max_length: usize,
    pub trim_strategy: TrimStrategy,
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub batch_size: usize,
    pub max_recovery_window_ms: i64,
    pub max_recovery_qps: u32,
    pub worker_pool_size: usize,
    pub timeout_ms: u64,
    pub max_concurrent_recoveries: usize,
}

#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub client_timeout_ms: i64,
    pub map_cleanup_interval_ms: u64,
    pub zombie_connection_inactivity_ms: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_owned(),
            pool: PoolConfig {
                max_global: 10_000,
                max_per_key: 1,
                max_per_ip: 50,
            },
            pipeline: PipelineConfig {
                batch_window_ms: 50,
                batch_max_size: 200,
            },
            hot_cache: HotCacheConfig {
                ttl_ms: 5_000,
                max_entries: 1_000,
            },
            warm_cache: WarmCacheConfig {
                ttl_ms: 30_000,
                stream_max_length: 10_000,
                trim_strategy: TrimStrategy::MaxLen,
            },
            memory_alert_threshold_mb: 60,
            recovery: RecoveryConfig {
                batch_size: 100,
                max_recovery_window_ms: 30_000,
                max_recovery_qps: 1_000,
                worker_pool_size: 4,
                timeout_ms: 60_000,
                max_concurrent_recoveries: 10,
            },
            adaptive: AdaptiveConfig {
                min_concurrency: 2,
                max_concurrency: 50,
            },
            reaper: ReaperConfig {
                client_timeout_ms: 300_000,
                map_cleanup_interval_ms: 300_000,
                zombie_connection_inactivity_ms: 1_800_000,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (all-Option, like forwarder::config::RawConfig)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    bind_addr: Option<String>,
    pool: Option<RawPool>,
    pipeline: Option<RawPipeline>,
    hot_cache: Option<RawHotCache>,
    warm_cache: Option<RawWarmCache>,
    memory_alert_threshold_mb: Option<u64>,
    recovery: Option<RawRecovery>,
    adaptive: Option<RawAdaptive>,
    reaper: Option<RawReaper>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPool {
    max_global: Option<u32>,
    max_per_key: Option<u32>,
    max_per_ip: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPipeline {
    batch_window_ms: Option<u64>,
    batch_max_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHotCache {
    ttl_ms: Option<i64>,
    max_entries: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWarmCache {
    ttl_ms: Option<i64>,
    stream_max_length: Option<usize>,
    trim_strategy: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRecovery {
    batch_size: Option<usize>,
    max_recovery_window_ms: Option<i64>,
    max_recovery_qps: Option<u32>,
    worker_pool_size: Option<usize>,
    timeout_ms: Option<u64>,
    max_concurrent_recoveries: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAdaptive {
    min_concurrency: Option<usize>,
    max_concurrency: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawReaper {
    client_timeout_ms: Option<i64>,
    map_cleanup_interval_ms: Option<u64>,
    zombie_connection_inactivity_ms: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Load config from a TOML file, applying `BIND_ADDR`/`LOG_LEVEL` env
/// overrides the way `main.rs` already would on top of the returned value.
pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let toml_str = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    load_config_from_str(&toml_str)
}

/// Load defaults only, for when no config file is present — every field in
/// spec.md §6's table has a documented default.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str)?;
    build_config(raw)
}

fn build_config(raw: RawConfig) -> Result<Config, ConfigError> {
    let defaults = Config::default();

    let pool = raw.pool.map_or_else(
        || defaults.pool.clone(),
        |p| PoolConfig {
            max_global: p.max_global.unwrap_or(defaults.pool.max_global),
            max_per_key: p.max_per_key.unwrap_or(defaults.pool.max_per_key),
            max_per_ip: p.max_per_ip.unwrap_or(defaults.pool.max_per_ip),
        },
    );

    let pipeline = raw.pipeline.map_or_else(
        || defaults.pipeline.clone(),
        |p| PipelineConfig {
            batch_window_ms: p.batch_window_ms.unwrap_or(defaults.pipeline.batch_window_ms),
            batch_max_size: p.batch_max_size.unwrap_or(defaults.pipeline.batch_max_size),
        },
    );
    if pipeline.batch_window_ms > 50 {
        return Err(ConfigError::InvalidValue(
            "pipeline.batch_window_ms must not exceed the 50ms SLA".to_owned(),
        ));
    }
    if pipeline.batch_max_size > 200 {
        return Err(ConfigError::InvalidValue(
            "pipeline.batch_max_size must not exceed the 200-item SLA cap".to_owned(),
        ));
    }

    let hot_cache = raw.hot_cache.map_or_else(
        || defaults.hot_cache.clone(),
        |h| HotCacheConfig {
            ttl_ms: h.ttl_ms.unwrap_or(defaults.hot_cache.ttl_ms),
            max_entries: h.max_entries.unwrap_or(defaults.hot_cache.max_entries),
        },
    );

    let warm_cache = match raw.warm_cache {
        Some(w) => WarmCacheConfig {
            ttl_ms: w.ttl_ms.unwrap_or(defaults.warm_cache.ttl_ms),
            stream_max_length: w
                .stream_max_length
                .unwrap_or(defaults.warm_cache.stream_max_length),
            trim_strategy: match w.trim_strategy.as_deref() {
                None => defaults.warm_cache.trim_strategy,
                Some("MAXLEN") => TrimStrategy::MaxLen,
                Some("MINID") => TrimStrategy::MinId,
                Some(other) => {
                    return Err(ConfigError::InvalidValue(format!(
                        "warm_cache.trim_strategy must be MAXLEN or MINID, got '{other}'"
                    )));
                }
            },
        },
        None => defaults.warm_cache.clone(),
    };

    let memory_alert_threshold_mb = raw
        .memory_alert_threshold_mb
        .unwrap_or(defaults.memory_alert_threshold_mb);

    let recovery = raw.recovery.map_or_else(
        || defaults.recovery.clone(),
        |r| RecoveryConfig {
            batch_size: r.batch_size.unwrap_or(defaults.recovery.batch_size),
            max_recovery_window_ms: r
                .max_recovery_window_ms
                .unwrap_or(defaults.recovery.max_recovery_window_ms),
            max_recovery_qps: r.max_recovery_qps.unwrap_or(defaults.recovery.max_recovery_qps),
            worker_pool_size: r
                .worker_pool_size
                .unwrap_or(defaults.recovery.worker_pool_size),
            timeout_ms: r.timeout_ms.unwrap_or(defaults.recovery.timeout_ms),
            max_concurrent_recoveries: r
                .max_concurrent_recoveries
                .unwrap_or(defaults.recovery.max_concurrent_recoveries),
        },
    );

    let adaptive = raw.adaptive.map_or_else(
        || defaults.adaptive.clone(),
        |a| AdaptiveConfig {
            min_concurrency: a.min_concurrency.unwrap_or(defaults.adaptive.min_concurrency),
            max_concurrency: a.max_concurrency.unwrap_or(defaults.adaptive.max_concurrency),
        },
    );
    if adaptive.min_concurrency == 0 || adaptive.min_concurrency > adaptive.max_concurrency {
        return Err(ConfigError::InvalidValue(
            "adaptive.min_concurrency must be >0 and <= max_concurrency".to_owned(),
        ));
    }

    let reaper = raw.reaper.map_or_else(
        || defaults.reaper.clone(),
        |r| ReaperConfig {
            client_timeout_ms: r
                .client_timeout_ms
                .unwrap_or(defaults.reaper.client_timeout_ms),
            map_cleanup_interval_ms: r
                .map_cleanup_interval_ms
                .unwrap_or(defaults.reaper.map_cleanup_interval_ms),
            zombie_connection_inactivity_ms: r
                .zombie_connection_inactivity_ms
                .unwrap_or(defaults.reaper.zombie_connection_inactivity_ms),
        },
    );

    // spec §4.5 memory target: max_entries * ~25 points/entry * 32B/point.
    let estimated_hot_mb = (hot_cache.max_entries * 32 * 25) as f64 / (1024.0 * 1024.0);
    if estimated_hot_mb > memory_alert_threshold_mb as f64 {
        return Err(ConfigError::InvalidValue(format!(
            "hot cache configuration would use ~{estimated_hot_mb:.1}MB, over the {memory_alert_threshold_mb}MB budget"
        )));
    }

    Ok(Config {
        bind_addr: raw.bind_addr.unwrap_or(defaults.bind_addr),
        pool,
        pipeline,
        hot_cache,
        warm_cache,
        memory_alert_threshold_mb,
        recovery,
        adaptive,
        reaper,
    })
}

/// Applies `BIND_ADDR`/`LOG_LEVEL` env var overrides on top of a loaded
/// config, matching `services/server/src/main.rs`'s env-override pattern.
/// Returns the resolved log level alongside the config since `Config`
/// itself has no log-level field (logging is initialized once at startup,
/// not reloaded).
pub fn apply_env_overrides(mut config: Config) -> (Config, String) {
    if let Ok(bind_addr) = std::env::var("BIND_ADDR") {
        config.bind_addr = bind_addr;
    }
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    (config, log_level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = Config::default();
        assert_eq!(cfg.pipeline.batch_window_ms, 50);
        assert_eq!(cfg.pipeline.batch_max_size, 200);
        assert_eq!(cfg.hot_cache.ttl_ms, 5_000);
        assert_eq!(cfg.hot_cache.max_entries, 1_000);
        assert_eq!(cfg.warm_cache.ttl_ms, 30_000);
        assert_eq!(cfg.warm_cache.stream_max_length, 10_000);
        assert_eq!(cfg.recovery.batch_size, 100);
        assert_eq!(cfg.recovery.worker_pool_size, 4);
        assert_eq!(cfg.adaptive.min_concurrency, 2);
        assert_eq!(cfg.adaptive.max_concurrency, 50);
    }

    #[test]
    fn rejects_batch_window_over_sla() {
        let err = load_config_from_str("[pipeline]\nbatch_window_ms = 100\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn rejects_unknown_trim_strategy() {
        let err = load_config_from_str("[warm_cache]\ntrim_strategy = \"BOGUS\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn loads_overrides_from_toml() {
        let cfg = load_config_from_str(
            "bind_addr = \"127.0.0.1:9000\"\n[pool]\nmax_global = 500\nmax_per_key = 1\nmax_per_ip = 10\n",
        )
        .unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
        assert_eq!(cfg.pool.max_global, 500);
    }
}
