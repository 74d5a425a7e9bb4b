//! stratix-ingest - Bulk Import Microservice
//!
//! Accepts spreadsheet uploads of areas, users, objectives and initiatives
//! for one tenant at a time, validates every row, and writes the valid rows
//! in bounded, all-or-nothing batches with live progress over SSE.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stratix_ingest::config::{Args, IngestConfig, StorageBackend};
use stratix_ingest::storage::{FsObjectStore, HttpObjectStore, ObjectStore};
use stratix_ingest::AppState;

/// How long running jobs get to reach a batch boundary at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = IngestConfig::resolve(&args).context("Invalid configuration")?;

    // RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting stratix-ingest (Bulk Import) microservice");
    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("GIT_HASH"),
        build_profile = env!("BUILD_PROFILE"),
        "Build info"
    );

    let database = config.database_location();
    info!("Database: {}", database);
    let pool = stratix_ingest::db::init_database_pool(&database, config.database.max_connections)
        .await
        .context("Failed to open database")?;

    // Jobs interrupted by the previous process can never finish
    let stale = stratix_ingest::db::jobs::cleanup_stale_jobs(&pool)
        .await
        .context("Failed to clean up stale jobs")?;
    if stale > 0 {
        warn!(jobs = stale, "Cancelled jobs left running by a previous process");
    }

    let store: Arc<dyn ObjectStore> = match config.storage.backend {
        StorageBackend::Filesystem => {
            let store = FsObjectStore::new(config.storage_root());
            store
                .ensure_root()
                .await
                .context("Failed to create object storage root")?;
            info!("Object storage: {}", store.root().display());
            Arc::new(store)
        }
        StorageBackend::Http => {
            let base_url = config
                .storage
                .base_url
                .as_deref()
                .context("storage.base_url is required for the http backend")?;
            info!("Object storage: {} (bucket {})", base_url, config.storage.bucket);
            Arc::new(
                HttpObjectStore::new(
                    base_url,
                    &config.storage.bucket,
                    config.storage.token.clone(),
                    config.storage_timeout(),
                )
                .context("Failed to configure object storage client")?,
            )
        }
    };

    let shutdown = CancellationToken::new();
    let state = AppState::new(pool.clone(), store, &config, shutdown.clone());

    let initial = state.health.probe_all().await;
    info!(status = %initial.status, "Initial dependency probe");
    let poller = Arc::clone(&state.health).spawn_poller(
        config.poll_interval(),
        state.event_bus.clone(),
        shutdown.clone(),
    );

    let imports = Arc::clone(&state.imports);
    let app = stratix_ingest::build_router(state);

    let addr = config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("HTTP server stopped, winding down jobs");
    imports.shutdown(SHUTDOWN_GRACE).await;
    shutdown.cancel();
    if let Err(e) = poller.await {
        warn!("Health poller ended abnormally: {}", e);
    }
    pool.close().await;

    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
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
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
