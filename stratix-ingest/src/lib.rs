//! stratix-ingest library interface
//!
//! Exposes the service's building blocks for the binary and for
//! integration tests.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::extract::DefaultBodyLimit;
use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use stratix_common::events::EventBus;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::IngestConfig;
use crate::services::{
    BatchWriter, HealthMonitor, HealthRegistry, ImportContext, ImportService, ProgressEmitter,
    QueueGauge, Resilience, SqliteBatchWriter,
};
use crate::storage::ObjectStore;

/// Operations events buffered per subscriber
const EVENT_BUS_CAPACITY: usize = 256;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Operations events (job status, dependency health)
    pub event_bus: EventBus,
    pub imports: Arc<ImportService>,
    pub health: Arc<HealthMonitor>,
    pub max_upload_bytes: usize,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    /// Wire the pipeline with the SQLite batch writer
    pub fn new(
        db: SqlitePool,
        store: Arc<dyn ObjectStore>,
        config: &IngestConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let writer = Arc::new(SqliteBatchWriter::new(db.clone()));
        Self::with_writer(db, store, writer, config, shutdown)
    }

    /// Wire the pipeline around an explicit batch writer
    pub fn with_writer(
        db: SqlitePool,
        store: Arc<dyn ObjectStore>,
        writer: Arc<dyn BatchWriter>,
        config: &IngestConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let event_bus = EventBus::new(EVENT_BUS_CAPACITY);
        let registry = HealthRegistry::new();
        let gauge = QueueGauge::new();
        let resilience = Resilience::new(
            config.retry_policy(),
            config.breaker_config(),
            registry.clone(),
        );
        let emitter = Arc::new(ProgressEmitter::new(
            config.import.progress_capacity,
            event_bus.clone(),
        ));

        let ctx = ImportContext {
            pool: db.clone(),
            store: Arc::clone(&store),
            writer,
            resilience,
            emitter,
            gauge: gauge.clone(),
            settings: config.pipeline_settings(),
        };
        let imports = Arc::new(ImportService::new(
            ctx,
            config.import.max_concurrent_jobs,
            shutdown,
        ));
        let health = Arc::new(HealthMonitor::new(
            db.clone(),
            store,
            registry,
            gauge,
            config.probe_timeout(),
        ));

        Self {
            db,
            event_bus,
            imports,
            health,
            max_upload_bytes: config.import.max_upload_bytes,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    let max_upload_bytes = state.max_upload_bytes;
    Router::new()
        .merge(api::import_routes())
        .merge(api::template_routes())
        .merge(api::health_routes())
        .route("/events", get(api::event_stream))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
