use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;
use tracing_subscriber::EnvFilter;

use streamgate::adaptive::AdaptiveConcurrencyController;
use streamgate::client_state::ClientStateManager;
use streamgate::config::{self, Config};
use streamgate::fetcher::{FetcherConfig, StreamDataFetcher};
use streamgate::gateway_ws::{ws_gateway_handler, GatewayDeps, GatewayState};
use streamgate::health;
use streamgate::pipeline::{CategoryTable, Pipeline};
use streamgate::recovery::RecoveryWorkerPool;
use streamgate::replay_cache::{InProcessWarmCacheStore, ReplayCache};

use streamgate_protocol::capability::{CapabilityError, CapabilityHandle, CapabilityRegistry};
use streamgate_protocol::rule::{NormalizeDirection, Rule, RuleChangeEvent, RuleReadService};
use tokio::sync::broadcast;

/// Resolves no providers. Real deployments inject a provider-SDK-backed
/// `CapabilityRegistry` here — spec.md §1 places those SDKs out of scope,
/// this crate only owns the trait they implement against.
#[derive(Debug, Default)]
struct UnconfiguredCapabilityRegistry;

#[async_trait]
impl CapabilityRegistry for UnconfiguredCapabilityRegistry {
    async fn resolve(
        &self,
        provider: &str,
        capability: &str,
    ) -> Result<Arc<dyn CapabilityHandle>, CapabilityError> {
        Err(CapabilityError::NotFound {
            provider: provider.to_owned(),
            capability: capability.to_owned(),
        })
    }
}

/// Matches no rules and never announces a change. Real deployments inject
/// the rule store here (spec §6 "rule read interface" — external
/// collaborator, out of scope beyond the trait).
struct UnconfiguredRuleReadService {
    changes: broadcast::Sender<RuleChangeEvent>,
}

impl UnconfiguredRuleReadService {
    fn new() -> Self {
        let (changes, _rx) = broadcast::channel(1);
        Self { changes }
    }
}

#[async_trait]
impl RuleReadService for UnconfiguredRuleReadService {
    async fn find_rule_for(&self, _provider: &str, _category: &str) -> Option<Rule> {
        None
    }

    async fn normalize_symbol(
        &self,
        form: &str,
        _provider: &str,
        _direction: NormalizeDirection,
    ) -> Option<String> {
        Some(form.to_owned())
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<RuleChangeEvent> {
        self.changes.subscribe()
    }
}

#[tokio::main]
async fn main() {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "streamgate.toml".to_owned());
    let config = match std::fs::metadata(&config_path) {
        Ok(_) => config::load_config_from_path(&PathBuf::from(&config_path))
            .expect("failed to load config"),
        Err(_) => Config::default(),
    };
    let (config, log_level) = config::apply_env_overrides(config);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let registry = Arc::new(UnconfiguredCapabilityRegistry) as Arc<dyn CapabilityRegistry>;
    let adaptive = Arc::new(AdaptiveConcurrencyController::new(config.adaptive.clone()));
    let fetcher_config = FetcherConfig {
        map_cleanup_interval: Duration::from_millis(config.reaper.map_cleanup_interval_ms),
        zombie_inactivity: Duration::from_millis(config.reaper.zombie_connection_inactivity_ms.max(0) as u64),
        ..FetcherConfig::default()
    };
    let fetcher = StreamDataFetcher::new(registry, config.pool.clone(), adaptive.clone(), fetcher_config);
    fetcher.spawn_sweeper();
    adaptive.clone().spawn_ticker();
    health::spawn_periodic_health_check(fetcher.clone(), adaptive, Duration::from_secs(60));

    let clients = Arc::new(ClientStateManager::new(Duration::from_millis(
        config.reaper.client_timeout_ms.max(0) as u64,
    )));
    clients.spawn_idle_reaper(Duration::from_millis(config.reaper.map_cleanup_interval_ms));

    let warm_store = Arc::new(InProcessWarmCacheStore::new());
    let cache = Arc::new(ReplayCache::new(config.hot_cache.clone(), config.warm_cache.clone(), warm_store));
    cache.clone().spawn_expiry_sweeper(Duration::from_millis(config.reaper.map_cleanup_interval_ms));

    let gateway = GatewayState::new();

    let rules = Arc::new(UnconfiguredRuleReadService::new());

    let pipeline = Pipeline::new(
        rules,
        gateway.clone(),
        cache.clone(),
        clients.clone(),
        CategoryTable::default(),
        config.pipeline.clone(),
    );
    fetcher.set_tick_sink(pipeline);

    let recovery = RecoveryWorkerPool::new(config.recovery.clone(), cache.clone(), gateway.clone());

    let shutdown_fetcher = fetcher.clone();
    let deps = GatewayDeps {
        gateway,
        clients,
        fetcher,
        recovery,
        default_provider: "default".to_owned(),
    };

    let router = axum::Router::new()
        .route("/ws", axum::routing::get(ws_gateway_handler))
        .with_state(deps);

    let bind_addr: SocketAddr = config.bind_addr.parse().expect("invalid bind address");
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "streamgate listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_fetcher))
    .await
    .expect("server error");
    info!("streamgate shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT), then publishes the fetcher's
/// destroy signal and closes every upstream connection (§4.2 Shutdown,
/// 10s ceiling) before returning to let `axum::serve`'s graceful shutdown
/// unwind, matching `services/server/src/main.rs`.
async fn shutdown_signal(fetcher: Arc<StreamDataFetcher>) {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }

    fetcher.shutdown().await;
}
