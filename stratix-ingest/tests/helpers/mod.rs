//! Test Helper Utilities
//!
//! Throwaway database + storage root, fault-injecting batch writers and CSV
//! builders shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stratix_common::events::{EventBus, JobStatus};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use stratix_ingest::config::IngestConfig;
use stratix_ingest::db;
use stratix_ingest::models::{ImportBatch, ImportJob, ImportTarget};
use stratix_ingest::services::writer::BatchCommit;
use stratix_ingest::services::{
    BatchWriter, HealthRegistry, ImportContext, JobOrchestrator, PipelineSettings,
    ProgressEmitter, QueueGauge, Resilience, SqliteBatchWriter, WriteError,
};
use stratix_ingest::storage::{FsObjectStore, ObjectStore};

/// Config with fast retries so failure tests finish quickly
pub fn test_config() -> IngestConfig {
    let mut config = IngestConfig::default();
    config.retry.max_retries = 3;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.retry.jitter = false;
    config.circuit_breaker.failure_threshold = 50;
    config.circuit_breaker.cool_down_ms = 200;
    config.import.progress_capacity = 1024;
    config.health.poll_interval_ms = 50;
    config.health.probe_timeout_ms = 500;
    config
}

/// Fast retries against a breaker with production tuning
pub fn default_breaker_config() -> IngestConfig {
    let mut config = test_config();
    config.circuit_breaker = IngestConfig::default().circuit_breaker;
    config
}

/// Temporary database and object storage root
///
/// Keep the value alive for the duration of the test.
pub struct TestEnv {
    pub dir: TempDir,
    pub pool: SqlitePool,
    pub storage_root: PathBuf,
    pub store: Arc<FsObjectStore>,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("stratix_test.db");
        let pool = db::init_database_pool(&db_path.to_string_lossy(), 5)
            .await
            .unwrap();

        let storage_root = dir.path().join("objects");
        let store = Arc::new(FsObjectStore::new(&storage_root));
        store.ensure_root().await.unwrap();

        Self {
            dir,
            pool,
            storage_root,
            store,
            tenant_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
        }
    }

    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    /// Pipeline context around `writer`
    pub fn context(&self, writer: Arc<dyn BatchWriter>, settings: PipelineSettings) -> ImportContext {
        self.context_with(writer, settings, &test_config())
    }

    /// Pipeline context with retry and breaker tuning taken from `config`
    pub fn context_with(
        &self,
        writer: Arc<dyn BatchWriter>,
        settings: PipelineSettings,
        config: &IngestConfig,
    ) -> ImportContext {
        ImportContext {
            pool: self.pool.clone(),
            store: self.object_store(),
            writer,
            resilience: Resilience::new(
                config.retry_policy(),
                config.breaker_config(),
                HealthRegistry::new(),
            ),
            emitter: Arc::new(ProgressEmitter::new(1024, EventBus::new(64))),
            gauge: QueueGauge::new(),
            settings,
        }
    }

    pub fn sqlite_writer(&self) -> Arc<dyn BatchWriter> {
        Arc::new(SqliteBatchWriter::new(self.pool.clone()))
    }

    /// Store `csv` under `key`
    pub async fn put(&self, key: &str, csv: &str) {
        self.store.put(key, csv.as_bytes()).await.unwrap();
    }

    /// Queued job for an already stored file
    pub async fn queued_job(&self, ctx: &ImportContext, target: ImportTarget, key: &str) -> ImportJob {
        let job = ImportJob::new(
            self.tenant_id,
            self.user_id,
            target,
            key.to_string(),
            key.rsplit('/').next().unwrap().to_string(),
            None,
        );
        db::jobs::save_job(&self.pool, &job).await.unwrap();
        ctx.emitter.register(&job);
        job
    }

    /// Store `csv` and run a job for it to completion
    pub async fn run(&self, ctx: &ImportContext, target: ImportTarget, csv: &str) -> ImportJob {
        let key = format!("{}/{}/upload.csv", self.tenant_id, Uuid::new_v4());
        self.put(&key, csv).await;
        let job = self.queued_job(ctx, target, &key).await;
        JobOrchestrator::new(ctx.clone(), job, CancellationToken::new())
            .run()
            .await
    }
}

pub fn settings(batch_size: usize, writer_concurrency: usize) -> PipelineSettings {
    PipelineSettings {
        batch_size,
        queue_capacity: 2,
        writer_concurrency,
    }
}

pub fn assert_balanced(job: &ImportJob) {
    assert_eq!(
        job.processed_rows + job.write_failed_rows + job.validation_failed_rows,
        job.total_rows,
        "outcome counts must add up to total for job in {}",
        job.status
    );
}

pub fn assert_status(job: &ImportJob, status: JobStatus) {
    assert_eq!(
        job.status, status,
        "unexpected status, last error: {:?}",
        job.last_error
    );
}

// ----------------------------------------------------------------------------
// CSV builders
// ----------------------------------------------------------------------------

pub fn areas_csv(count: usize) -> String {
    let mut csv = String::from("name,description\n");
    for i in 1..=count {
        csv.push_str(&format!("Area {},Generated area\n", i));
    }
    csv
}

pub fn users_csv(count: usize, area: &str) -> String {
    let mut csv = String::from("email,full_name,role,area\n");
    for i in 1..=count {
        csv.push_str(&format!("user{}@example.com,User {},member,{}\n", i, i, area));
    }
    csv
}

// ----------------------------------------------------------------------------
// Fault-injecting writers
// ----------------------------------------------------------------------------

/// What a [`FaultyWriter`] does to the batches it intercepts
#[derive(Debug, Clone)]
pub enum Fault {
    /// Every attempt on batches with `sequence >= from` fails transiently
    TransientFrom(usize),
    /// Batch `sequence` is rejected permanently
    RejectBatch(usize),
    /// Each batch takes `delay` before committing
    Slow(Duration),
}

/// SQLite writer with injected faults and per-batch attempt counts
pub struct FaultyWriter {
    inner: SqliteBatchWriter,
    fault: Fault,
    attempts: Mutex<HashMap<usize, u32>>,
    calls: AtomicU32,
}

impl FaultyWriter {
    pub fn new(pool: SqlitePool, fault: Fault) -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteBatchWriter::new(pool),
            fault,
            attempts: Mutex::new(HashMap::new()),
            calls: AtomicU32::new(0),
        })
    }

    pub fn attempts(&self, sequence: usize) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(&sequence)
            .copied()
            .unwrap_or(0)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchWriter for FaultyWriter {
    async fn write_batch(
        &self,
        tenant_id: Uuid,
        batch: &ImportBatch,
    ) -> Result<BatchCommit, WriteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(batch.sequence)
            .or_insert(0) += 1;

        match self.fault {
            Fault::TransientFrom(from) if batch.sequence >= from => {
                Err(WriteError::Transient("database is locked".to_string()))
            }
            Fault::RejectBatch(sequence) if batch.sequence == sequence => Err(WriteError::Rejected {
                row: batch.records.first().map(|r| r.row),
                message: "CHECK constraint failed".to_string(),
            }),
            Fault::Slow(delay) => {
                tokio::time::sleep(delay).await;
                self.inner.write_batch(tenant_id, batch).await
            }
            _ => self.inner.write_batch(tenant_id, batch).await,
        }
    }
}
