//! Connection Pool Manager (spec §4.1).
//!
//! Enforces global / per-key / per-IP connection caps ahead of the Stream
//! Data Fetcher actually dialing a provider. Plain counters under a single
//! mutex — this component is small and every call is a handful of
//! comparisons, so a lock-free design would buy nothing.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::PoolConfig;
use crate::error::{PoolDimension, PoolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolHealthStatus {
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy)]
pub struct DimensionStats {
    pub used: u32,
    pub limit: u32,
}

impl DimensionStats {
    pub fn utilization_pct(&self) -> f64 {
        if self.limit == 0 {
            0.0
        } else {
            f64::from(self.used) / f64::from(self.limit) * 100.0
        }
    }

    pub fn health(&self) -> PoolHealthStatus {
        let pct = self.utilization_pct();
        if pct >= 90.0 {
            PoolHealthStatus::Critical
        } else if pct >= 80.0 {
            PoolHealthStatus::Warning
        } else {
            PoolHealthStatus::Ok
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub global: DimensionStats,
    pub per_key: HashMap<String, DimensionStats>,
    pub per_ip: HashMap<String, DimensionStats>,
}

#[derive(Debug, Clone)]
pub struct PoolAlert {
    pub dimension: PoolDimension,
    pub scope: Option<String>,
    pub status: PoolHealthStatus,
    pub utilization_pct: f64,
}

struct Counters {
    global: u32,
    per_key: HashMap<String, u32>,
    per_ip: HashMap<String, u32>,
}

pub struct ConnectionPoolManager {
    config: PoolConfig,
    counters: Mutex<Counters>,
}

impl ConnectionPoolManager {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(Counters {
                global: 0,
                per_key: HashMap::new(),
                per_ip: HashMap::new(),
            }),
        }
    }

    /// Three ordered checks — global, per-key, per-IP — failing on the
    /// first breach (spec §4.1).
    pub fn can_create_connection(&self, key: &str, ip: &str) -> Result<(), PoolError> {
        let counters = self.counters.lock().unwrap();
        if counters.global >= self.config.max_global {
            return Err(PoolError {
                dimension: PoolDimension::Global,
                observed: counters.global,
                limit: self.config.max_global,
            });
        }
        let key_count = counters.per_key.get(key).copied().unwrap_or(0);
        if key_count >= self.config.max_per_key {
            return Err(PoolError {
                dimension: PoolDimension::PerKey,
                observed: key_count,
                limit: self.config.max_per_key,
            });
        }
        let ip_count = counters.per_ip.get(ip).copied().unwrap_or(0);
        if ip_count >= self.config.max_per_ip {
            return Err(PoolError {
                dimension: PoolDimension::PerIp,
                observed: ip_count,
                limit: self.config.max_per_ip,
            });
        }
        Ok(())
    }

    /// Admits and records a connection. Callers are expected to have just
    /// checked [`can_create_connection`], but this re-checks to close the
    /// TOCTOU window between check and register.
    pub fn register_connection(&self, key: &str, ip: &str) -> Result<(), PoolError> {
        self.can_create_connection(key, ip)?;
        let mut counters = self.counters.lock().unwrap();
        counters.global += 1;
        *counters.per_key.entry(key.to_owned()).or_insert(0) += 1;
        *counters.per_ip.entry(ip.to_owned()).or_insert(0) += 1;
        Ok(())
    }

    /// Idempotent: decrements saturate at 0, so a double-unregister is safe.
    pub fn unregister_connection(&self, key: &str, ip: &str) {
        let mut counters = self.counters.lock().unwrap();
        counters.global = counters.global.saturating_sub(1);
        if let Some(count) = counters.per_key.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counters.per_key.remove(key);
            }
        }
        if let Some(count) = counters.per_ip.get_mut(ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counters.per_ip.remove(ip);
            }
        }
    }

    pub fn get_stats(&self) -> PoolStats {
        let counters = self.counters.lock().unwrap();
        PoolStats {
            global: DimensionStats {
                used: counters.global,
                limit: self.config.max_global,
            },
            per_key: counters
                .per_key
                .iter()
                .map(|(k, &used)| {
                    (
                        k.clone(),
                        DimensionStats {
                            used,
                            limit: self.config.max_per_key,
                        },
                    )
                })
                .collect(),
            per_ip: counters
                .per_ip
                .iter()
                .map(|(k, &used)| {
                    (
                        k.clone(),
                        DimensionStats {
                            used,
                            limit: self.config.max_per_ip,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn get_alerts(&self) -> Vec<PoolAlert> {
        let stats = self.get_stats();
        let mut alerts = Vec::new();
        if stats.global.health() != PoolHealthStatus::Ok {
            alerts.push(PoolAlert {
                dimension: PoolDimension::Global,
                scope: None,
                status: stats.global.health(),
                utilization_pct: stats.global.utilization_pct(),
            });
        }
        for (key, dim) in &stats.per_key {
            if dim.health() != PoolHealthStatus::Ok {
                alerts.push(PoolAlert {
                    dimension: PoolDimension::PerKey,
                    scope: Some(key.clone()),
                    status: dim.health(),
                    utilization_pct: dim.utilization_pct(),
                });
            }
        }
        for (ip, dim) in &stats.per_ip {
            if dim.health() != PoolHealthStatus::Ok {
                alerts.push(PoolAlert {
                    dimension: PoolDimension::PerIp,
                    scope: Some(ip.clone()),
                    status: dim.health(),
                    utilization_pct: dim.utilization_pct(),
                });
            }
        }
        alerts
    }

    /// Tests-only: clears all counters without touching configured limits.
    #[cfg(any(test, feature = "test-support"))]
    pub fn reset(&self) {
        let mut counters = self.counters.lock().unwrap();
        counters.global = 0;
        counters.per_key.clear();
        counters.per_ip.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ConnectionPoolManager {
        ConnectionPoolManager::new(PoolConfig {
            max_global: 3,
            max_per_key: 2,
            max_per_ip: 2,
        })
    }

    #[test]
    fn admits_until_each_dimension_caps() {
        let pool = pool();
        pool.register_connection("longport:stream-stock-quote", "10.0.0.1").unwrap();
        pool.register_connection("longport:stream-stock-quote", "10.0.0.2").unwrap();
        let err = pool
            .register_connection("longport:stream-stock-quote", "10.0.0.3")
            .unwrap_err();
        assert_eq!(err.dimension, PoolDimension::PerKey);
        assert_eq!(err.observed, 2);
        assert_eq!(err.limit, 2);
    }

    #[test]
    fn per_ip_cap_enforced_independently_of_key() {
        let pool = pool();
        pool.register_connection("a:cap", "10.0.0.1").unwrap();
        pool.register_connection("b:cap", "10.0.0.1").unwrap();
        let err = pool.register_connection("c:cap", "10.0.0.1").unwrap_err();
        assert_eq!(err.dimension, PoolDimension::PerIp);
    }

    #[test]
    fn global_cap_checked_first() {
        let pool = pool();
        pool.register_connection("a:cap", "10.0.0.1").unwrap();
        pool.register_connection("b:cap", "10.0.0.2").unwrap();
        pool.register_connection("c:cap", "10.0.0.3").unwrap();
        let err = pool.register_connection("d:cap", "10.0.0.4").unwrap_err();
        assert_eq!(err.dimension, PoolDimension::Global);
    }

    #[test]
    fn unregister_is_idempotent_and_saturates_at_zero() {
        let pool = pool();
        pool.register_connection("a:cap", "10.0.0.1").unwrap();
        pool.unregister_connection("a:cap", "10.0.0.1");
        pool.unregister_connection("a:cap", "10.0.0.1");
        let stats = pool.get_stats();
        assert_eq!(stats.global.used, 0);
        assert!(stats.per_key.is_empty());
    }

    #[test]
    fn alerts_fire_at_configured_thresholds() {
        let pool = ConnectionPoolManager::new(PoolConfig {
            max_global: 10,
            max_per_key: 10,
            max_per_ip: 10,
        });
        for i in 0..9 {
            pool.register_connection("k", &format!("10.0.0.{i}")).unwrap();
        }
        let alerts = pool.get_alerts();
        assert!(alerts.iter().any(|a| a.dimension == PoolDimension::Global
            && a.status == PoolHealthStatus::Critical));
    }
}
