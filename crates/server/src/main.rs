//! voxgate server entry point.

use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voxgate_config::Settings;
use voxgate_server::{create_router, init_metrics, state::Providers, AppState};
use voxgate_store::{CounterStore, InMemoryCounterStore, ScyllaConfig, StorageLayer};
use voxgate_voice::providers::{HttpProviderConfig, HttpSpeechToText, HttpTextToSpeech, HttpTurnModel};
use voxgate_webhook::HttpTransport;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::var("VOXGATE_CONFIG").unwrap_or_else(|_| "voxgate.toml".to_string());
    let settings = match Settings::load(Some(Path::new(&config_path))) {
        Ok(settings) => settings,
        Err(e) => {
            // Tracing is not up yet.
            eprintln!("warning: failed to load {config_path}: {e}; using defaults");
            Settings::default()
        }
    };

    init_tracing(&settings);
    settings.validate()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = ?settings.environment,
        "starting voxgate"
    );

    let _metrics_handle = init_metrics();
    tracing::info!("prometheus metrics at /metrics");

    // Durable storage: ScyllaDB when enabled, in-memory otherwise.
    let storage = if settings.persistence.enabled {
        let scylla_config = ScyllaConfig {
            hosts: settings.persistence.scylla_hosts.clone(),
            keyspace: settings.persistence.keyspace.clone(),
            replication_factor: settings.persistence.replication_factor,
            datacenter: settings.persistence.scylla_datacenter.clone(),
            ..Default::default()
        };
        match StorageLayer::scylla(scylla_config).await {
            Ok(storage) => {
                tracing::info!(
                    hosts = ?settings.persistence.scylla_hosts,
                    keyspace = %settings.persistence.keyspace,
                    "scylla storage initialized"
                );
                storage
            }
            Err(e) => {
                tracing::error!(error = %e, "scylla unavailable, falling back to in-memory storage");
                StorageLayer::in_memory()
            }
        }
    } else {
        tracing::info!("persistence disabled, using in-memory storage");
        StorageLayer::in_memory()
    };

    let counters = build_counter_store(&settings).await;

    let provider_config = HttpProviderConfig {
        stt_endpoint: settings.providers.stt_endpoint.clone(),
        llm_endpoint: settings.providers.llm_endpoint.clone(),
        tts_endpoint: settings.providers.tts_endpoint.clone(),
        api_key: settings.providers.provider_api_key.clone(),
    };
    let providers = Providers {
        stt: Arc::new(HttpSpeechToText::new(provider_config.clone())),
        llm: Arc::new(HttpTurnModel::new(provider_config.clone())),
        tts: Arc::new(HttpTextToSpeech::new(provider_config)),
    };

    let bind_addr: std::net::SocketAddr = settings.server.bind_addr.parse()?;
    let state = AppState::build(
        settings,
        storage,
        counters,
        providers,
        Arc::new(HttpTransport::new()),
    );

    // Background jobs: idle-session cleanup, counter reconciliation,
    // pregeneration workers.
    let _session_cleanup = state.sessions.start_cleanup_task();
    let _reconciler = state.start_reconciler();
    let _pregen_workers = state.pregen.start();

    let app = create_router(state);
    tracing::info!(addr = %bind_addr, "listening");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("server shutdown complete");
    Ok(())
}

#[cfg(feature = "redis")]
async fn build_counter_store(settings: &Settings) -> Arc<dyn CounterStore> {
    if settings.persistence.redis_url.is_empty() {
        tracing::info!("no redis url configured, using in-memory counters");
        return Arc::new(InMemoryCounterStore::new());
    }
    match voxgate_store::RedisCounterStore::connect(&settings.persistence.redis_url).await {
        // One immediate retry per round-trip; callers fail open/closed
        // beyond that.
        Ok(store) => Arc::new(voxgate_store::RetryingCounterStore::new(store)),
        Err(e) => {
            tracing::error!(error = %e, "redis unavailable, falling back to in-memory counters");
            Arc::new(InMemoryCounterStore::new())
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn build_counter_store(settings: &Settings) -> Arc<dyn CounterStore> {
    if !settings.persistence.redis_url.is_empty() {
        tracing::warn!("redis url configured but the redis feature is disabled");
    }
    Arc::new(InMemoryCounterStore::new())
}

fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "voxgate=info,tower_http=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if settings.environment.is_strict() {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("ctrl-c handler installs");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("sigterm handler installs")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received ctrl-c, shutting down");
        }
        _ = terminate => {
            tracing::info!("received sigterm, shutting down");
        }
    }
}
