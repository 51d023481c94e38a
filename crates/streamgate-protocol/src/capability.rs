//! The provider SDK boundary (spec §1 "out of scope", §6 "Capability
//! handle").
//!
//! The real provider SDKs are external; this module only fixes the shape a
//! capability handle must have for the Stream Data Fetcher to drive it.
//! `onData`/`onError`/`onStatusChange` collapse into a single broadcast
//! stream of [`HandleEvent`] — dropping the receiver is the "unsubscribe
//! handle" spec.md's design notes ask for, the same shape the teacher
//! workspace uses for its uplink session's status handling.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Error,
    Closed,
}

/// One raw tick as delivered by a provider capability handle, in provider
/// form. Normalization into standard form happens in the pipeline, not
/// here (spec §4.4 step 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTick {
    /// Provider-form symbol, as emitted by the upstream SDK.
    pub provider_symbol: String,
    /// Raw field bag, pre-transform.
    pub fields: serde_json::Value,
    /// Timestamp this tick was received off the wire, ms epoch. Used as the
    /// start of the `stream_push_latency_ms` measurement (spec §4.4 step 5).
    pub received_at: i64,
}

#[derive(Debug, Clone)]
pub enum HandleEvent {
    Data(RawTick),
    Error(String),
    Status(ConnectionStatus),
}

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("capability not found for provider={provider} capability={capability}")]
    NotFound { provider: String, capability: String },
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("unsubscribe failed: {0}")]
    Unsubscribe(String),
    #[error("heartbeat failed: {0}")]
    Heartbeat(String),
    #[error("handle is not connected")]
    NotConnected,
}

/// A single upstream provider stream handle.
///
/// Implementations own exactly one `(provider, capability)` connection;
/// the Connection Pool Manager and Stream Data Fetcher are responsible for
/// enforcing the "exactly one handle per key" invariant (spec §3).
#[async_trait]
pub trait CapabilityHandle: Send + Sync + fmt::Debug {
    async fn connect(&self) -> Result<(), CapabilityError>;
    async fn subscribe(&self, symbols: &[String]) -> Result<(), CapabilityError>;
    async fn unsubscribe(&self, symbols: &[String]) -> Result<(), CapabilityError>;
    /// Returns `Ok(true)` on a healthy reply, `Ok(false)` on an explicit
    /// unhealthy reply, `Err` if the call itself failed.
    async fn send_heartbeat(&self) -> Result<bool, CapabilityError>;
    async fn close(&self);
    fn status(&self) -> ConnectionStatus;
    /// Subscribe to this handle's data/error/status events. Dropping the
    /// receiver is the unsubscribe action.
    fn events(&self) -> broadcast::Receiver<HandleEvent>;
}

/// Resolves `(provider, capability)` to a stream-capable handle (component
/// A, spec §2). External collaborator — out of scope beyond this trait.
#[async_trait]
pub trait CapabilityRegistry: Send + Sync {
    async fn resolve(
        &self,
        provider: &str,
        capability: &str,
    ) -> Result<std::sync::Arc<dyn CapabilityHandle>, CapabilityError>;
}
