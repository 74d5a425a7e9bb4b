//! Job Orchestrator
//!
//! Drives one import job through its lifecycle:
//!
//! ```text
//! QUEUED → VALIDATING → WRITING → COMPLETED
//!              │           │
//!              └─▶ FAILED ◀┘          any non-terminal ─▶ CANCELLED
//! ```
//!
//! Each working state has a dedicated `phase_*` method:
//!
//! - **VALIDATING** (`phase_validating.rs`): fetch the raw file, parse and
//!   validate rows against the tenant's data, plan batches
//! - **WRITING** (`phase_writing.rs`): bounded worker pool committing batches
//!   in foreign-key order through the resilience layer
//!
//! Whatever happens, every row of the file ends the job in exactly one
//! bucket: succeeded, write-failed or validation-failed.

use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use stratix_common::events::JobStatus;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db;
use crate::models::{Dependency, EntityType, FailureCategory, ImportJob, RowFailure};
use crate::services::health_monitor::QueueGauge;
use crate::services::progress::ProgressEmitter;
use crate::services::resilience::Resilience;
use crate::services::writer::BatchWriter;
use crate::storage::ObjectStore;

mod phase_validating;
mod phase_writing;

/// Reason recorded for rows skipped because the job failed
pub const NOT_WRITTEN_FAILED: &str = "not written: job failed";
/// Reason recorded for rows skipped because the job was cancelled
pub const NOT_WRITTEN_CANCELLED: &str = "not written: job cancelled";

/// Per-job pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Maximum records per batch (one transaction)
    pub batch_size: usize,
    /// Planned batches buffered ahead of the writers
    pub queue_capacity: usize,
    /// Batches of one entity type written concurrently
    pub writer_concurrency: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            queue_capacity: 4,
            writer_concurrency: 4,
        }
    }
}

/// Everything a job needs from the running service
#[derive(Clone)]
pub struct ImportContext {
    pub pool: SqlitePool,
    pub store: Arc<dyn ObjectStore>,
    pub writer: Arc<dyn BatchWriter>,
    pub resilience: Resilience,
    pub emitter: Arc<ProgressEmitter>,
    pub gauge: QueueGauge,
    pub settings: PipelineSettings,
}

/// Why a job stopped before completing
#[derive(Debug)]
enum Interruption {
    Failed(String),
    Cancelled,
}

impl Interruption {
    fn status(&self) -> JobStatus {
        match self {
            Interruption::Failed(_) => JobStatus::Failed,
            Interruption::Cancelled => JobStatus::Cancelled,
        }
    }

    fn unwritten_reason(&self) -> &'static str {
        match self {
            Interruption::Failed(_) => NOT_WRITTEN_FAILED,
            Interruption::Cancelled => NOT_WRITTEN_CANCELLED,
        }
    }
}

/// Runs a single job to a terminal state
pub struct JobOrchestrator {
    ctx: ImportContext,
    job: ImportJob,
    cancel: CancellationToken,
    /// Planned batches not yet committed or rolled back, by sequence
    unsettled: BTreeMap<usize, (EntityType, Vec<usize>)>,
}

impl JobOrchestrator {
    pub fn new(ctx: ImportContext, job: ImportJob, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            job,
            cancel,
            unsettled: BTreeMap::new(),
        }
    }

    /// Execute the job and return it in its terminal state
    pub async fn run(mut self) -> ImportJob {
        let started = Instant::now();
        info!(
            job_id = %self.job.job_id,
            tenant_id = %self.job.tenant_id,
            target = %self.job.target,
            file = %self.job.file_name,
            "Starting import job"
        );

        let interruption = self.execute().await.err();
        self.finish(interruption).await;
        self.ctx.emitter.release(self.job.job_id);

        info!(
            job_id = %self.job.job_id,
            status = %self.job.status,
            total = self.job.total_rows,
            succeeded = self.job.processed_rows,
            write_failed = self.job.write_failed_rows,
            validation_failed = self.job.validation_failed_rows,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Import job finished"
        );
        self.job
    }

    async fn execute(&mut self) -> Result<(), Interruption> {
        self.check_cancelled()?;
        self.transition(JobStatus::Validating).await?;
        let plan = self.phase_validating().await?;

        self.check_cancelled()?;
        self.transition(JobStatus::Writing).await?;
        self.phase_writing(plan).await
    }

    fn check_cancelled(&self) -> Result<(), Interruption> {
        if self.cancel.is_cancelled() {
            Err(Interruption::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn transition(&mut self, to: JobStatus) -> Result<(), Interruption> {
        self.ctx
            .emitter
            .transition(&mut self.job, to)
            .map_err(|e| Interruption::Failed(e.to_string()))?;
        self.persist().await;
        Ok(())
    }

    /// Account for every remaining row and enter the terminal state
    async fn finish(&mut self, interruption: Option<Interruption>) {
        let status = match interruption {
            None => JobStatus::Completed,
            Some(interruption) => {
                if let Interruption::Failed(message) = &interruption {
                    self.job.record_error(message.clone());
                }
                self.abandon_unsettled(interruption.unwritten_reason()).await;
                interruption.status()
            }
        };

        let unaccounted = self.job.unaccounted_rows();
        if unaccounted > 0 {
            warn!(job_id = %self.job.job_id, rows = unaccounted, "Rows without an outcome counted as write-failed");
            self.job.record_write_failures(unaccounted);
        }

        if let Err(e) = self.ctx.emitter.transition(&mut self.job, status) {
            error!(job_id = %self.job.job_id, error = %e, "Could not enter terminal state");
        }
        self.persist().await;
    }

    /// Report rows of never-settled batches as write-failed with `reason`
    async fn abandon_unsettled(&mut self, reason: &str) {
        let unsettled = std::mem::take(&mut self.unsettled);
        if unsettled.is_empty() {
            return;
        }

        let batches = unsettled.len() as u64;
        let failures: Vec<RowFailure> = unsettled
            .into_values()
            .flat_map(|(entity, rows)| {
                rows.into_iter().map(move |row| RowFailure {
                    row,
                    entity_type: Some(entity),
                    category: FailureCategory::Write,
                    reasons: vec![reason.to_string()],
                })
            })
            .collect();

        info!(
            job_id = %self.job.job_id,
            batches,
            rows = failures.len(),
            reason,
            "Abandoning unwritten batches"
        );
        self.ctx.gauge.batches_settled(batches);
        self.job.record_write_failures(failures.len() as u64);
        if let Err(e) = self.store_failures(&failures).await {
            warn!(job_id = %self.job.job_id, error = %e, "Failed to record unwritten rows");
        }
    }

    /// Save the job row; failures are logged, the in-memory job stays authoritative
    ///
    /// Bypasses the breaker so a terminal state lands even after batch
    /// writes opened the circuit.
    async fn persist(&self) {
        let pool = &self.ctx.pool;
        let job = &self.job;
        if let Err(e) = self
            .ctx
            .resilience
            .call_ungated(Dependency::RelationalStore, "save job", || {
                db::jobs::save_job(pool, job)
            })
            .await
        {
            warn!(job_id = %job.job_id, status = %job.status, error = %e, "Failed to persist job state");
        }
    }

    async fn store_failures(&self, failures: &[RowFailure]) -> Result<(), String> {
        if failures.is_empty() {
            return Ok(());
        }
        let pool = &self.ctx.pool;
        let job_id = self.job.job_id;
        self.ctx
            .resilience
            .call_ungated(Dependency::RelationalStore, "record row failures", || {
                db::outcomes::record_failures(pool, job_id, failures)
            })
            .await
            .map_err(|e| e.to_string())
    }
}
