//! The broadcast/transport boundary (spec §6 "Broadcast interface").
//!
//! The WebSocket Gateway adapter (component I) binds room operations onto
//! whatever transport actually holds subscriber sockets. This crate only
//! fixes the contract; `crate::gateway_ws` in the root package is the
//! in-scope adapter that implements it over a real `axum` WebSocket set.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayHealthStatus {
    Ok,
    Degraded,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayHealth {
    pub status: GatewayHealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Room-based broadcast surface. Spec.md §9 is explicit that the legacy
/// per-client direct-callback fan-out path is gone for good — this trait
/// has no per-client send method, only room broadcast.
#[async_trait]
pub trait BroadcastGateway: Send + Sync {
    fn is_server_available(&self) -> bool;
    async fn health_check(&self) -> GatewayHealth;
    /// Returns `false` (not an error) on a soft failure to deliver —
    /// callers raise `GatewayBroadcastError` themselves on `false`, per
    /// spec §4.3.
    async fn broadcast_to_room(
        &self,
        room: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> bool;
}
