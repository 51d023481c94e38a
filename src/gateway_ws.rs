//! WebSocket Gateway adapter (spec §2 component I, §6 external interface).
//!
//! Binds the `BroadcastGateway`/`RecoveryDelivery` traits onto a real
//! `axum` WebSocket set: one broadcast room per `"symbol:"+S`, one mpsc
//! channel per connected client for anything addressed to that client
//! specifically (recovery frames). Shaped after `services/server`'s
//! `ws_forwarder.rs` socket loop and `state.rs`'s
//! `get_or_create_broadcast` room registry, generalized from "one room per
//! timing stream" to "one room per standard-form symbol".

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::AbortHandle;
use tracing::{info, warn};
use uuid::Uuid;

use streamgate_protocol::gateway::{BroadcastGateway, GatewayHealth, GatewayHealthStatus};
use streamgate_protocol::ws::{ClientType, WsInbound, WsOutbound};

use crate::client_state::ClientStateManager;
use crate::fetcher::StreamDataFetcher;
use crate::recovery::{RecoveryDelivery, RecoveryTask, RecoveryWorkerPool};

type RoomSender = broadcast::Sender<WsOutbound>;

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Transport-side room + per-client registries. Implements both external
/// boundary traits (`BroadcastGateway`, `RecoveryDelivery`) since both are
/// really "push a frame to whoever's on the other end of a socket",
/// differing only in whether that's a room or a single client.
pub struct GatewayState {
    rooms: RwLock<HashMap<String, RoomSender>>,
    clients: RwLock<HashMap<String, mpsc::Sender<WsOutbound>>>,
}

impl GatewayState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
        })
    }

    async fn room_sender(&self, room: &str) -> RoomSender {
        if let Some(tx) = self.rooms.read().await.get(room) {
            return tx.clone();
        }
        let mut rooms = self.rooms.write().await;
        if let Some(tx) = rooms.get(room) {
            return tx.clone();
        }
        let (tx, _rx) = broadcast::channel(1024);
        rooms.insert(room.to_owned(), tx.clone());
        tx
    }

    async fn register_client(&self, client_id: &str) -> mpsc::Receiver<WsOutbound> {
        let (tx, rx) = mpsc::channel(256);
        self.clients.write().await.insert(client_id.to_owned(), tx);
        rx
    }

    async fn unregister_client(&self, client_id: &str) {
        self.clients.write().await.remove(client_id);
    }

    async fn client_sender(&self, client_id: &str) -> Option<mpsc::Sender<WsOutbound>> {
        self.clients.read().await.get(client_id).cloned()
    }
}

#[async_trait]
impl BroadcastGateway for GatewayState {
    fn is_server_available(&self) -> bool {
        true
    }

    async fn health_check(&self) -> GatewayHealth {
        GatewayHealth {
            status: GatewayHealthStatus::Ok,
            details: None,
        }
    }

    async fn broadcast_to_room(&self, room: &str, event: &str, payload: serde_json::Value) -> bool {
        let frame = match event {
            "data" => WsOutbound::Data {
                symbol: room.strip_prefix("symbol:").unwrap_or(room).to_owned(),
                timestamp: payload.get("timestamp").and_then(serde_json::Value::as_i64).unwrap_or(0),
                data: payload,
            },
            other => {
                warn!(event = other, "unknown broadcast event kind");
                return false;
            }
        };
        // A room with zero current listeners (nobody has ever subscribed,
        // or everyone has since unsubscribed) is not a delivery failure —
        // there is simply nobody to deliver to. `broadcast::Sender::send`
        // errors in exactly that case, so a dropped frame there is treated
        // as a successful no-op rather than a `GatewayBroadcastError`.
        let tx = self.room_sender(room).await;
        let _ = tx.send(frame);
        true
    }
}

#[async_trait]
impl RecoveryDelivery for GatewayState {
    async fn send_to_client(&self, client_id: &str, frame: WsOutbound) -> bool {
        let Some(tx) = self.client_sender(client_id).await else {
            return false;
        };
        tx.send(frame).await.is_ok()
    }
}

/// Wiring the gateway needs to act on inbound frames: the shared room/client
/// registry plus the three subsystems a subscribe/unsubscribe/reconnect
/// message ultimately drives.
#[derive(Clone)]
pub struct GatewayDeps {
    pub gateway: Arc<GatewayState>,
    pub clients: Arc<ClientStateManager>,
    pub fetcher: Arc<StreamDataFetcher>,
    pub recovery: Arc<RecoveryWorkerPool>,
    pub default_provider: String,
}

pub async fn ws_gateway_handler(
    ws: WebSocketUpgrade,
    State(deps): State<GatewayDeps>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, deps, addr))
}

async fn handle_socket(mut socket: WebSocket, deps: GatewayDeps, addr: SocketAddr) {
    let client_id = Uuid::new_v4().to_string();
    let mut outbound_rx = deps.gateway.register_client(&client_id).await;
    let mut room_tasks: HashMap<String, AbortHandle> = HashMap::new();
    let ip = addr.ip().to_string();
    info!(client_id, %ip, "gateway client connected");

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WsInbound>(&text) {
                            Ok(inbound) => handle_inbound(&deps, &client_id, &ip, inbound, &mut room_tasks).await,
                            Err(e) => warn!(client_id, error = %e, "invalid inbound frame, ignoring"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(client_id, error = %e, "websocket error");
                        break;
                    }
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if let Ok(json) = serde_json::to_string(&frame) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }

    for (_, handle) in room_tasks.drain() {
        handle.abort();
    }
    deps.gateway.unregister_client(&client_id).await;
    deps.clients.remove_client_subscription(&client_id, None).await;
    info!(client_id, "gateway client disconnected");
}

async fn handle_inbound(
    deps: &GatewayDeps,
    client_id: &str,
    ip: &str,
    inbound: WsInbound,
    room_tasks: &mut HashMap<String, AbortHandle>,
) {
    deps.clients.update_client_activity(client_id).await;
    match inbound {
        WsInbound::Subscribe { symbols, capability, preferred_provider } => {
            let provider = preferred_provider.unwrap_or_else(|| deps.default_provider.clone());
            let connection = match deps.fetcher.establish_stream_connection(&provider, &capability, ip).await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(client_id, error = %e, "failed to establish upstream connection for subscribe");
                    return;
                }
            };
            if let Err(e) = deps.fetcher.subscribe_to_symbols(&connection, &symbols).await {
                warn!(client_id, error = %e, "subscribe call rejected");
                return;
            }
            deps.clients.add_client_subscription(client_id, &symbols, &capability, &provider).await;
            for symbol in &symbols {
                join_room(deps, client_id, symbol, room_tasks).await;
            }
        }
        WsInbound::Unsubscribe { symbols } => {
            deps.clients.remove_client_subscription(client_id, Some(&symbols)).await;
            for symbol in &symbols {
                if let Some(handle) = room_tasks.remove(symbol) {
                    handle.abort();
                }
            }
        }
        WsInbound::Reconnect {
            client_id: reported_id,
            symbols,
            last_receive_timestamp,
            max_recovery_window: _,
            client_capabilities,
        } => {
            for symbol in &symbols {
                join_room(deps, client_id, symbol, room_tasks).await;
            }
            let task = RecoveryTask {
                client_id: client_id.to_owned(),
                symbols,
                since_time: last_receive_timestamp,
                request_time: now_ms(),
                // No auth/account-tier signal rides on the wire frame, so
                // every reconnect is treated as standard priority.
                client_type: ClientType::Standard,
                max_batch_size: client_capabilities.max_batch_size,
                idempotency_key: format!("{reported_id}:{last_receive_timestamp}"),
            };
            if let Err(e) = deps.recovery.schedule_recovery(task).await {
                warn!(client_id, error = %e, "recovery admission rejected");
            }
        }
    }
}

async fn join_room(deps: &GatewayDeps, client_id: &str, symbol: &str, room_tasks: &mut HashMap<String, AbortHandle>) {
    if room_tasks.contains_key(symbol) {
        return;
    }
    let Some(client_tx) = deps.gateway.client_sender(client_id).await else {
        return;
    };
    let room = format!("symbol:{symbol}");
    let mut room_rx = deps.gateway.room_sender(&room).await.subscribe();
    let handle = tokio::spawn(async move {
        loop {
            match room_rx.recv().await {
                Ok(frame) => {
                    if client_tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
    room_tasks.insert(symbol.to_owned(), handle.abort_handle());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_to_room_with_no_listeners_is_not_a_failure() {
        // Nobody has ever subscribed to this symbol's room (e.g. a
        // multiplexed tick for a symbol no current client wants). There is
        // nobody to fail delivering to, so this must not surface as a
        // `GatewayBroadcastError`.
        let gateway = GatewayState::new();
        let delivered = gateway.broadcast_to_room("symbol:AAPL.US", "data", serde_json::json!({})).await;
        assert!(delivered);
    }

    #[tokio::test]
    async fn broadcast_reaches_a_subscribed_room() {
        let gateway = GatewayState::new();
        let mut rx = gateway.room_sender("symbol:AAPL.US").await.subscribe();
        let delivered = gateway
            .broadcast_to_room("symbol:AAPL.US", "data", serde_json::json!({"timestamp": 1234}))
            .await;
        assert!(delivered);
        match rx.recv().await.unwrap() {
            WsOutbound::Data { symbol, timestamp, .. } => {
                assert_eq!(symbol, "AAPL.US");
                assert_eq!(timestamp, 1234);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn recovery_delivery_fails_softly_for_unknown_client() {
        let gateway = GatewayState::new();
        let delivered = gateway
            .send_to_client(
                "nonexistent",
                WsOutbound::RecoveryFailed {
                    client_id: "nonexistent".to_owned(),
                    error: "x".to_owned(),
                    recommended_action: "resubscribe".to_owned(),
                    missing_data_range: streamgate_protocol::ws::MissingDataRange {
                        from: 0,
                        to: 0,
                        affected_symbols: vec![],
                    },
                    fallback_options: streamgate_protocol::ws::FallbackOptions::default(),
                },
            )
            .await;
        assert!(!delivered);
    }

    #[tokio::test]
    async fn recovery_delivery_reaches_registered_client() {
        let gateway = GatewayState::new();
        let mut rx = gateway.register_client("c1").await;
        let delivered = gateway
            .send_to_client(
                "c1",
                WsOutbound::Data { symbol: "AAPL.US".to_owned(), timestamp: 1, data: serde_json::json!({}) },
            )
            .await;
        assert!(delivered);
        assert!(rx.recv().await.is_some());
    }
}
