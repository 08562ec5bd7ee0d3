use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod auth;
mod config;
mod error;
mod ledger;
mod metrics;
mod mirror;
mod models;
mod services;
mod state;
mod stream;
mod venue;

use crate::auth::AllowAllVerifier;
use crate::config::AppConfig;
use crate::ledger::InMemoryLedger;
use crate::mirror::MirrorStore;
use crate::venue::Venue;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "memeperp_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("Starting memeperp-core v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.environment);
    tracing::info!("Symbols: {:?}", config.symbols);

    // Install the Prometheus exporter
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
    {
        Ok(()) => {
            crate::metrics::describe();
            tracing::info!("Metrics exporter listening on {}", metrics_addr);
        }
        Err(e) => tracing::warn!("Metrics exporter disabled: {}", e),
    }

    // Durable mirror (graceful degradation when Redis is away)
    let mirror = Arc::new(MirrorStore::connect(&config.mirror_url).await);
    if mirror.is_available() {
        tracing::info!("Mirror connected at {}", config.mirror_url);
    } else {
        tracing::warn!("Mirror unavailable, serving from memory");
    }

    // Settlement-ledger collaborator. The production RPC client ships with
    // the relayer deployment; local runs settle against the in-memory ledger.
    let ledger = Arc::new(InMemoryLedger::new());
    tracing::info!("Ledger collaborator initialized (in-memory)");

    // The transport layer wires the production signature scheme; standalone
    // runs accept all intents.
    let verifier = Arc::new(AllowAllVerifier);

    // Build and start the venue
    let venue = Venue::build(config, ledger, mirror, verifier);
    venue.startup().await?;
    tracing::info!("Startup reconciliation complete, ingress open");

    venue.spawn_tasks();
    tracing::info!("Venue running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    Ok(())
}
