//! In-memory fakes for streamgate's external collaborators.
//!
//! Every fake is driven entirely in-process — no real network, no real
//! provider SDK, no real external rule or broadcast service — so the
//! properties and scenarios in spec.md §8 can run as ordinary
//! `#[tokio::test]`s.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use streamgate_protocol::capability::{CapabilityError, CapabilityHandle, ConnectionStatus, HandleEvent, RawTick};
use streamgate_protocol::gateway::{BroadcastGateway, GatewayHealth, GatewayHealthStatus};
use streamgate_protocol::rule::{NormalizeDirection, Rule, RuleChangeEvent, RuleReadService};
use streamgate_protocol::CapabilityRegistry;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// FakeCapabilityHandle / FakeCapabilityRegistry
// ---------------------------------------------------------------------------

/// A controllable stand-in for a provider SDK stream handle.
///
/// Tests drive it with [`FakeCapabilityHandle::push_tick`],
/// [`FakeCapabilityHandle::push_error`], and the `fail_*` toggles, then hand
/// it to the Stream Data Fetcher exactly as a real capability handle would
/// be.
pub struct FakeCapabilityHandle {
    status: Mutex<ConnectionStatus>,
    events_tx: broadcast::Sender<HandleEvent>,
    subscribed: Mutex<HashSet<String>>,
    fail_connect: AtomicBool,
    fail_subscribe: AtomicBool,
    fail_unsubscribe: AtomicBool,
    heartbeat_reply: Mutex<Option<bool>>,
    fail_heartbeat: AtomicBool,
}

impl std::fmt::Debug for FakeCapabilityHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeCapabilityHandle").finish()
    }
}

impl Default for FakeCapabilityHandle {
    fn default() -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            status: Mutex::new(ConnectionStatus::Connecting),
            events_tx,
            subscribed: Mutex::new(HashSet::new()),
            fail_connect: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            fail_unsubscribe: AtomicBool::new(false),
            heartbeat_reply: Mutex::new(Some(true)),
            fail_heartbeat: AtomicBool::new(false),
        }
    }
}

impl FakeCapabilityHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_connect(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn fail_unsubscribe(&self, fail: bool) {
        self.fail_unsubscribe.store(fail, Ordering::SeqCst);
    }

    pub fn set_heartbeat_reply(&self, healthy: Option<bool>) {
        *self.heartbeat_reply.lock().unwrap() = healthy;
    }

    pub fn fail_heartbeat(&self, fail: bool) {
        self.fail_heartbeat.store(fail, Ordering::SeqCst);
    }

    pub fn push_tick(&self, tick: RawTick) {
        let _ = self.events_tx.send(HandleEvent::Data(tick));
    }

    pub fn push_error(&self, message: impl Into<String>) {
        let _ = self.events_tx.send(HandleEvent::Error(message.into()));
    }

    /// Force a status transition and emit the corresponding event, as a
    /// real handle would when the upstream connection drops.
    pub fn force_status(&self, status: ConnectionStatus) {
        *self.status.lock().unwrap() = status;
        let _ = self.events_tx.send(HandleEvent::Status(status));
    }

    pub fn subscribed_symbols(&self) -> HashSet<String> {
        self.subscribed.lock().unwrap().clone()
    }
}

#[async_trait]
impl CapabilityHandle for FakeCapabilityHandle {
    async fn connect(&self) -> Result<(), CapabilityError> {
        if self.fail_connect.swap(false, Ordering::SeqCst) {
            return Err(CapabilityError::Connect("fake connect failure".into()));
        }
        self.force_status(ConnectionStatus::Connected);
        Ok(())
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<(), CapabilityError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(CapabilityError::Subscribe("fake subscribe failure".into()));
        }
        let mut set = self.subscribed.lock().unwrap();
        for s in symbols {
            set.insert(s.clone());
        }
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> Result<(), CapabilityError> {
        if self.fail_unsubscribe.load(Ordering::SeqCst) {
            return Err(CapabilityError::Unsubscribe("fake unsubscribe failure".into()));
        }
        let mut set = self.subscribed.lock().unwrap();
        for s in symbols {
            set.remove(s);
        }
        Ok(())
    }

    async fn send_heartbeat(&self) -> Result<bool, CapabilityError> {
        if self.fail_heartbeat.load(Ordering::SeqCst) {
            return Err(CapabilityError::Heartbeat("fake heartbeat failure".into()));
        }
        Ok(self.heartbeat_reply.lock().unwrap().unwrap_or(true))
    }

    async fn close(&self) {
        self.force_status(ConnectionStatus::Closed);
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap()
    }

    fn events(&self) -> broadcast::Receiver<HandleEvent> {
        self.events_tx.subscribe()
    }
}

/// A registry that hands out pre-registered (or lazily-created)
/// [`FakeCapabilityHandle`]s for `(provider, capability)` pairs.
#[derive(Default)]
pub struct FakeCapabilityRegistry {
    handles: Mutex<HashMap<(String, String), Arc<FakeCapabilityHandle>>>,
    deny: Mutex<HashSet<(String, String)>>,
}

impl FakeCapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-register a handle so tests can drive it directly after the
    /// fetcher resolves it.
    pub fn register(&self, provider: &str, capability: &str, handle: Arc<FakeCapabilityHandle>) {
        self.handles
            .lock()
            .unwrap()
            .insert((provider.to_owned(), capability.to_owned()), handle);
    }

    /// Make `resolve` fail with `NotFound` for this key, simulating a
    /// capability the registry doesn't recognize.
    pub fn deny(&self, provider: &str, capability: &str) {
        self.deny
            .lock()
            .unwrap()
            .insert((provider.to_owned(), capability.to_owned()));
    }

    /// Fetch the handle registered for a key, creating a fresh one lazily
    /// if none was pre-registered.
    pub fn handle_for(&self, provider: &str, capability: &str) -> Arc<FakeCapabilityHandle> {
        let mut map = self.handles.lock().unwrap();
        map.entry((provider.to_owned(), capability.to_owned()))
            .or_insert_with(FakeCapabilityHandle::new)
            .clone()
    }
}

#[async_trait]
impl CapabilityRegistry for FakeCapabilityRegistry {
    async fn resolve(
        &self,
        provider: &str,
        capability: &str,
    ) -> Result<Arc<dyn CapabilityHandle>, CapabilityError> {
        if self
            .deny
            .lock()
            .unwrap()
            .contains(&(provider.to_owned(), capability.to_owned()))
        {
            return Err(CapabilityError::NotFound {
                provider: provider.to_owned(),
                capability: capability.to_owned(),
            });
        }
        Ok(self.handle_for(provider, capability) as Arc<dyn CapabilityHandle>)
    }
}

// ---------------------------------------------------------------------------
// FakeRuleReadService
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeRuleReadService {
    rules: Mutex<HashMap<(String, String), Rule>>,
    to_standard: Mutex<HashMap<(String, String), String>>,
    to_provider: Mutex<HashMap<(String, String), String>>,
    changes_tx: Mutex<Option<broadcast::Sender<RuleChangeEvent>>>,
}

impl FakeRuleReadService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_rule(&self, rule: Rule) {
        self.rules
            .lock()
            .unwrap()
            .insert((rule.provider.clone(), rule.category.clone()), rule);
    }

    /// Map `provider_form` (in `provider`'s namespace) to `standard_form`,
    /// and register the reverse mapping too.
    pub fn put_symbol_mapping(&self, provider: &str, provider_form: &str, standard_form: &str) {
        self.to_standard.lock().unwrap().insert(
            (provider.to_owned(), provider_form.to_owned()),
            standard_form.to_owned(),
        );
        self.to_provider.lock().unwrap().insert(
            (provider.to_owned(), standard_form.to_owned()),
            provider_form.to_owned(),
        );
    }

    pub fn emit_change(&self, event: RuleChangeEvent) {
        if let Some(tx) = self.changes_tx.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl RuleReadService for FakeRuleReadService {
    async fn find_rule_for(&self, provider: &str, category: &str) -> Option<Rule> {
        self.rules
            .lock()
            .unwrap()
            .get(&(provider.to_owned(), category.to_owned()))
            .cloned()
    }

    async fn normalize_symbol(
        &self,
        form: &str,
        provider: &str,
        direction: NormalizeDirection,
    ) -> Option<String> {
        let key = (provider.to_owned(), form.to_owned());
        match direction {
            NormalizeDirection::ToStandard => self.to_standard.lock().unwrap().get(&key).cloned(),
            NormalizeDirection::ToProvider => self.to_provider.lock().unwrap().get(&key).cloned(),
        }
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<RuleChangeEvent> {
        let mut guard = self.changes_tx.lock().unwrap();
        if guard.is_none() {
            let (tx, _) = broadcast::channel(64);
            *guard = Some(tx);
        }
        guard.as_ref().unwrap().subscribe()
    }
}

// ---------------------------------------------------------------------------
// FakeBroadcastGateway
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeBroadcastGateway {
    available: AtomicBool,
    fail_rooms: Mutex<HashSet<String>>,
    sent: Mutex<Vec<(String, String, serde_json::Value)>>,
}

impl FakeBroadcastGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            available: AtomicBool::new(true),
            ..Default::default()
        })
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn fail_room(&self, room: &str) {
        self.fail_rooms.lock().unwrap().insert(room.to_owned());
    }

    pub fn sent_frames(&self) -> Vec<(String, String, serde_json::Value)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl BroadcastGateway for FakeBroadcastGateway {
    fn is_server_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn health_check(&self) -> GatewayHealth {
        GatewayHealth {
            status: if self.is_server_available() {
                GatewayHealthStatus::Ok
            } else {
                GatewayHealthStatus::Unavailable
            },
            details: None,
        }
    }

    async fn broadcast_to_room(&self, room: &str, event: &str, payload: serde_json::Value) -> bool {
        if !self.is_server_available() {
            return false;
        }
        if self.fail_rooms.lock().unwrap().contains(room) {
            return false;
        }
        self.sent
            .lock()
            .unwrap()
            .push((room.to_owned(), event.to_owned(), payload));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_handle_connects_and_emits_status() {
        let handle = FakeCapabilityHandle::new();
        let mut rx = handle.events();
        handle.connect().await.unwrap();
        assert_eq!(handle.status(), ConnectionStatus::Connected);
        match rx.recv().await.unwrap() {
            HandleEvent::Status(ConnectionStatus::Connected) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fake_registry_denies_unknown_capability() {
        let registry = FakeCapabilityRegistry::new();
        registry.deny("acme", "stream-stock-quote");
        let err = registry.resolve("acme", "stream-stock-quote").await.unwrap_err();
        assert!(matches!(err, CapabilityError::NotFound { .. }));
    }

    #[tokio::test]
    async fn fake_gateway_reports_unavailable_after_toggle() {
        let gw = FakeBroadcastGateway::new();
        assert!(gw.is_server_available());
        gw.set_available(false);
        let ok = gw
            .broadcast_to_room("symbol:AAPL.US", "data", serde_json::json!({}))
            .await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn fake_rule_service_normalizes_both_directions() {
        let rules = FakeRuleReadService::new();
        rules.put_symbol_mapping("longport", "700.HK", "700.HK");
        let std_form = rules
            .normalize_symbol("700.HK", "longport", NormalizeDirection::ToStandard)
            .await;
        assert_eq!(std_form.as_deref(), Some("700.HK"));
    }
}
