//! Typed error taxonomy (spec §7) — one enum per component boundary, so
//! callers match on variants instead of string-sniffing.

use streamgate_protocol::capability::CapabilityError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolDimension {
    Global,
    PerKey,
    PerIp,
}

impl std::fmt::Display for PoolDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolDimension::Global => write!(f, "global"),
            PoolDimension::PerKey => write!(f, "per_key"),
            PoolDimension::PerIp => write!(f, "per_ip"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("pool over capacity: dimension={dimension} observed={observed} limit={limit}")]
pub struct PoolError {
    pub dimension: PoolDimension,
    pub observed: u32,
    pub limit: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum FetcherError {
    #[error("connection pool rejected new connection: {0}")]
    PoolOverCapacity(#[from] PoolError),
    #[error("capability not found for provider={provider} capability={capability}")]
    CapabilityNotFound { provider: String, capability: String },
    #[error("establishing connection for key={key} timed out after {0:?}", .timeout)]
    EstablishTimeout { key: String, timeout: std::time::Duration },
    #[error("establishing connection for key={key} failed after exhausting retries: {cause}")]
    RetriesExhausted { key: String, cause: String },
    #[error("connection for key={key} is not connected")]
    NotConnected { key: String },
    #[error("no symbols supplied to subscribe/unsubscribe")]
    EmptySymbolSet,
    #[error("capability handle error: {0}")]
    Capability(#[from] CapabilityError),
}

#[derive(Debug, Clone)]
pub struct SubscriptionOutcome {
    pub subscribed_symbols: Vec<String>,
    pub failed_symbols: Vec<String>,
    pub error: Option<String>,
}

impl SubscriptionOutcome {
    pub fn success(subscribed_symbols: Vec<String>) -> Self {
        Self {
            subscribed_symbols,
            failed_symbols: Vec::new(),
            error: None,
        }
    }

    pub fn failure(symbols: Vec<String>, error: impl Into<String>) -> Self {
        Self {
            subscribed_symbols: Vec::new(),
            failed_symbols: symbols,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("broadcast to room for symbol={symbol} failed, gateway health={health_status:?}: {reason}")]
pub struct GatewayBroadcastError {
    pub symbol: String,
    pub health_status: crate::client_state::BroadcastHealthStatus,
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no rule found for provider={provider} category={category}")]
    RuleNotFound { provider: String, category: String },
    #[error("reverse symbol normalization failed for provider_symbol={provider_symbol}")]
    NormalizationFailed { provider_symbol: String },
    #[error("field transform failed: {0}")]
    TransformFailed(String),
    #[error("cache write failed: {0}")]
    CacheWrite(String),
    #[error(transparent)]
    Broadcast(#[from] GatewayBroadcastError),
}

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("missing lastReceiveTimestamp on reconnect")]
    MissingTimestamp,
    #[error("recovery window exceeded: now - sinceTime = {elapsed_ms}ms > {max_window_ms}ms")]
    WindowExceeded { elapsed_ms: i64, max_window_ms: i64 },
    #[error("duplicate recovery task for idempotency key {0}")]
    Duplicate(String),
    #[error("recovery task timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("warm cache failure during recovery: {0}")]
    WarmCacheFailure(String),
}
