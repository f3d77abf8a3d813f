//! Tandem matchmaker server entry point
//!
//! Wires the store, directory and verifier seams into the QUIC server
//! and the HTTP health surface, spawns the background sweeps, and runs
//! until Ctrl+C.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use tandem::api::{self, AppState};
use tandem::directory::{MemoryDirectory, StoreTokenVerifier, UserDirectory};
use tandem::server::breaker::{BreakerConfig, CircuitBreaker};
use tandem::server::chat_router::ChatRouter;
use tandem::server::hub::ConnectionHub;
use tandem::server::janitor::Janitor;
use tandem::server::match_server::MatchServer;
use tandem::server::matcher::Matcher;
use tandem::server::stats::StatsBroadcaster;
use tandem::{Config, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tandem=debug")),
        )
        .init();

    info!("Starting Tandem matchmaker v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::from_env());
    info!(
        bind = %config.bind_addr,
        http = %config.http_addr,
        store = %config.store_url,
        token_key_set = !config.token_key.is_empty(),
        origins = config.allowed_origins.len(),
        "Loaded configuration"
    );

    let store = Arc::new(Store::new());
    let directory: Arc<dyn UserDirectory> = Arc::new(MemoryDirectory::new());
    let verifier = Arc::new(StoreTokenVerifier::new(Arc::clone(&store)));

    let hub = Arc::new(ConnectionHub::new(
        config.recovery_window,
        config.room_retention,
    ));
    let stats = Arc::new(StatsBroadcaster::new(
        Arc::clone(&store),
        Arc::clone(&directory),
        Arc::clone(&hub),
        config.stats_cache_ttl,
        config.stats_debounce,
    ));
    let matcher = Arc::new(Matcher::new(
        Arc::clone(&store),
        Arc::clone(&directory),
        Arc::clone(&hub),
        Arc::clone(&stats),
        Arc::new(CircuitBreaker::new("matcher", BreakerConfig::matcher())),
    ));
    let chat_router = Arc::new(ChatRouter::new(
        Arc::clone(&store),
        Arc::clone(&directory),
        Arc::clone(&hub),
        Arc::new(CircuitBreaker::new("chat", BreakerConfig::chat())),
    ));

    let server = Arc::new(MatchServer::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&directory),
        verifier,
        Arc::clone(&hub),
        Arc::clone(&matcher),
        chat_router,
        Arc::clone(&stats),
    ));

    // Background work: sweeps and presence refresh
    let janitor = Arc::new(Janitor::new(Arc::clone(&store), Arc::clone(&hub), matcher));
    let _sweepers = janitor.spawn();
    let _activity = server.spawn_activity_refresher();

    let app_state = AppState {
        store,
        hub,
        config: Arc::clone(&config),
    };
    let http_addr = config.http_addr;

    tokio::select! {
        result = Arc::clone(&server).run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "QUIC server failed");
                return Err(e.into());
            }
        }
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
