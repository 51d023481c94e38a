//! WebSocket frame shapes (spec §6).
//!
//! The framing layer itself — upgrade negotiation, auth, ping/pong — is out
//! of scope; this module only defines the JSON payloads that layer is
//! expected to deliver and accept. Every frame carries a `type`
//! discriminant, one tagged enum per direction the way the teacher
//! workspace's `WsMessage` is one discriminated enum per frame kind
//! (the teacher tags on `kind`; this wire format uses `type` per spec §6).

use serde::{Deserialize, Serialize};

/// A message a subscriber's transport session hands the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsInbound {
    Subscribe {
        symbols: Vec<String>,
        capability: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preferred_provider: Option<String>,
    },
    Unsubscribe {
        symbols: Vec<String>,
    },
    Reconnect {
        client_id: String,
        symbols: Vec<String>,
        /// Required. Transport-level 400 if absent — enforced by the adapter
        /// before a `WsInbound` is even constructed (spec §6).
        last_receive_timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_recovery_window: Option<i64>,
        client_capabilities: ClientCapabilities,
    },
}

/// A message the gateway hands back to a subscriber's transport session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsOutbound {
    Data {
        symbol: String,
        timestamp: i64,
        data: serde_json::Value,
    },
    RecoveryBatch {
        client_id: String,
        batch_info: BatchInfo,
        recovered_data: Vec<crate::ws_points::CompressedPoint>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compression_ratio: Option<f64>,
        metadata: RecoveryMetadata,
    },
    RecoveryFailed {
        client_id: String,
        error: String,
        recommended_action: String,
        missing_data_range: MissingDataRange,
        fallback_options: FallbackOptions,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferredFormat {
    Json,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(default)]
    pub supports_compression: bool,
    pub max_batch_size: usize,
    #[serde(default = "default_format")]
    pub preferred_format: PreferredFormat,
}

fn default_format() -> PreferredFormat {
    PreferredFormat::Json
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    Vip,
    Standard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInfo {
    pub total_batches: usize,
    pub current_batch: usize,
    pub is_complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecoveryMetadata {
    pub recovery_start_time: i64,
    pub total_recovered: usize,
    pub missing_data_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingDataRange {
    pub from: i64,
    pub to: i64,
    pub affected_symbols: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FallbackOptions {
    pub enable_partial_recovery: bool,
    pub enable_real_time_only: bool,
    pub retry_after_ms: u64,
}

impl Default for FallbackOptions {
    fn default() -> Self {
        Self {
            enable_partial_recovery: true,
            enable_real_time_only: true,
            retry_after_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_round_trips_through_json() {
        let msg = WsInbound::Subscribe {
            symbols: vec!["700.hk".to_owned()],
            capability: "stream-stock-quote".to_owned(),
            preferred_provider: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"subscribe\""));
        let back: WsInbound = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn reconnect_requires_last_receive_timestamp_field() {
        let json = r#"{"type":"reconnect","client_id":"c1","symbols":["AAPL.US"],
            "last_receive_timestamp":1000,
            "client_capabilities":{"max_batch_size":100}}"#;
        let msg: WsInbound = serde_json::from_str(json).unwrap();
        match msg {
            WsInbound::Reconnect {
                last_receive_timestamp,
                client_capabilities,
                ..
            } => {
                assert_eq!(last_receive_timestamp, 1000);
                assert_eq!(client_capabilities.preferred_format, PreferredFormat::Json);
            }
            other => panic!("expected reconnect, got {other:?}"),
        }
    }

    #[test]
    fn data_frame_matches_contract_shape() {
        let msg = WsOutbound::Data {
            symbol: "700.HK".to_owned(),
            timestamp: 1_700_000_000_000,
            data: serde_json::json!({"symbol": "700.HK", "lastPrice": 561}),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "data");
        assert_eq!(json["symbol"], "700.HK");
    }

    #[test]
    fn recovery_failed_default_fallback_options_match_spec() {
        let opts = FallbackOptions::default();
        assert!(opts.enable_partial_recovery);
        assert!(opts.enable_real_time_only);
        assert_eq!(opts.retry_after_ms, 30_000);
    }
}
