//! Wire types and external-collaborator traits for the streamgate gateway.
//!
//! This crate is the seam between the in-scope core (connection pool,
//! stream fetcher, client state manager, pipeline, replay cache, recovery
//! pool) and everything spec'd only at its interface: the WebSocket framing
//! layer, the provider SDK, the rule store, and the broadcast gateway.
//!
//! Message kinds use a top-level `type` tag for discriminated
//! deserialization — one discriminated enum per frame direction, the same
//! shape as the teacher workspace's `WsMessage` enum (which tags on `kind`
//! rather than `type`).

pub mod capability;
pub mod gateway;
pub mod rule;
pub mod ws;
pub mod ws_points;

pub use capability::{CapabilityHandle, CapabilityRegistry, ConnectionStatus};
pub use gateway::BroadcastGateway;
pub use rule::{FieldOp, Rule, RuleChangeEvent, RuleReadService};
pub use ws::{
    BatchInfo, ClientCapabilities, ClientType, FallbackOptions, MissingDataRange,
    PreferredFormat, RecoveryMetadata, WsInbound, WsOutbound,
};
pub use ws_points::CompressedPoint;
