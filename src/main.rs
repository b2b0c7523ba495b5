//! Atomic swap coordinator - cross-chain HTLC swaps with per-order monitoring
//!
//! Creates hash time-locked contracts on two chains under one secret hash,
//! watches both legs, redeems the source as soon as the secret is revealed
//! on the destination, and refunds whichever leg times out.

use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod clock;
mod config;
mod error;
mod events;
mod metrics;
mod monitor;
mod order;
mod secret;
mod state;

use chain::AdapterRegistry;
use clock::SystemClock;
use config::Settings;
use metrics::MetricsServer;
use monitor::OrderMonitor;
use order::service::OrderService;
use state::{MemoryOrderStore, OrderStore, PgOrderStore};

/// Settled transactions kept by the confirmation tracker between sweeps
const TRACKER_CACHE_ENTRIES: usize = 10_000;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting atomic swap coordinator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for instance {} with {} chains and {} pairs",
        settings.service.instance_id,
        settings.enabled_chains().len(),
        settings.pairs.len()
    );

    // Order store: PostgreSQL when configured, otherwise process memory
    let store: Arc<dyn OrderStore> = match &settings.database {
        Some(database) => {
            let store = PgOrderStore::new(database).await?;
            info!("Database connection established");
            store.run_migrations().await?;
            info!("Database migrations complete");
            Arc::new(store)
        }
        None => {
            warn!("No database configured, orders are kept in memory only");
            Arc::new(MemoryOrderStore::new())
        }
    };

    // Chain adapters, injected into everything that talks to a chain
    let adapters = Arc::new(AdapterRegistry::from_settings(&settings).await?);
    info!("Chain adapters initialized: {:?}", adapters.connected_chains());

    let monitor = Arc::new(OrderMonitor::new(
        adapters.clone(),
        store.clone(),
        Arc::new(SystemClock),
        settings.monitor.clone(),
    ));
    let service = Arc::new(OrderService::new(
        &settings,
        adapters.clone(),
        store.clone(),
        monitor.clone(),
        Arc::new(SystemClock),
    ));

    let resumed = monitor.resume().await?;
    info!("Order monitor initialized, {} open orders resumed", resumed);

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = api::AppState {
            service: service.clone(),
            store: store.clone(),
            adapters: adapters.clone(),
            started_at: Instant::now(),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let adapters = adapters.clone();
        let store = store.clone();
        let tracker = monitor.tracker();
        let interval = settings.service.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                for (chain, healthy) in adapters.health_check().await {
                    if !healthy {
                        warn!("Chain {} health check failed", chain);
                    }
                }

                if let Err(e) = store.health_check().await {
                    warn!("Order store health check failed: {}", e);
                }

                tracker.cleanup_cache(TRACKER_CACHE_ENTRIES).await;
            }
        }
    });

    info!("Atomic swap coordinator is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Open orders are resumed from the store on the next start
    monitor.stop_all();

    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Atomic swap coordinator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,atomic_swap_coordinator=debug,sqlx=warn,hyper=warn")
    });

    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
