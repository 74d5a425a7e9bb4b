//! Import Service
//!
//! Admits uploads as queued jobs, runs at most `max_concurrent_jobs` of them
//! at a time and keeps the cancellation token of every live job. Reads are
//! always scoped to the caller's tenant; another tenant's job is reported
//! as not found.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use stratix_common::events::{JobStatus, ProgressEvent};
use thiserror::Error;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db;
use crate::models::{Dependency, ImportJob, ImportTarget, JobSummary};
use crate::services::orchestrator::{ImportContext, JobOrchestrator};
use crate::services::resilience::ResilienceError;
use crate::storage::{upload_key, validate_key, StorageError};

/// Failures surfaced to API callers
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("import job {0} not found")]
    NotFound(Uuid),

    #[error("{0}")]
    InvalidInput(String),

    #[error("import job {job_id} is {status}; summary is available once it finishes")]
    NotFinished { job_id: Uuid, status: JobStatus },

    #[error("import job {job_id} already {status}")]
    AlreadyFinished { job_id: Uuid, status: JobStatus },

    #[error("{dependency} unavailable: {message}")]
    Unavailable {
        dependency: Dependency,
        message: String,
    },

    #[error(transparent)]
    Common(#[from] stratix_common::Error),
}

impl ImportError {
    fn from_db(err: ResilienceError<stratix_common::Error>) -> Self {
        match err {
            ResilienceError::Permanent(e) => ImportError::Common(e),
            other => ImportError::Unavailable {
                dependency: Dependency::RelationalStore,
                message: other.to_string(),
            },
        }
    }

    fn from_storage(err: ResilienceError<StorageError>) -> Self {
        match err {
            ResilienceError::Permanent(StorageError::Rejected(message)) => {
                ImportError::InvalidInput(message)
            }
            ResilienceError::Permanent(e) => {
                ImportError::Common(stratix_common::Error::Storage(e.to_string()))
            }
            other => ImportError::Unavailable {
                dependency: Dependency::ObjectStorage,
                message: other.to_string(),
            },
        }
    }
}

/// Job admission, concurrency limit and cancellation registry
pub struct ImportService {
    ctx: ImportContext,
    slots: Arc<Semaphore>,
    running: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl ImportService {
    /// * `shutdown` - cancelling it cancels every queued and running job
    pub fn new(ctx: ImportContext, max_concurrent_jobs: usize, shutdown: CancellationToken) -> Self {
        Self {
            ctx,
            slots: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            running: Arc::new(Mutex::new(HashMap::new())),
            tasks: TaskTracker::new(),
            shutdown,
        }
    }

    /// Store an uploaded file and queue a job for it
    pub async fn submit_upload(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        target: ImportTarget,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<ImportJob, ImportError> {
        if bytes.is_empty() {
            return Err(ImportError::InvalidInput("uploaded file is empty".to_string()));
        }
        let checksum = format!("{:x}", Sha256::digest(bytes));
        let mut job = ImportJob::new(
            tenant_id,
            user_id,
            target,
            String::new(),
            file_name.to_string(),
            Some(checksum),
        );
        job.source_key = upload_key(tenant_id, job.job_id, file_name);

        let store = &self.ctx.store;
        let key = job.source_key.as_str();
        self.ctx
            .resilience
            .call(Dependency::ObjectStorage, "store upload", || store.put(key, bytes))
            .await
            .map_err(ImportError::from_storage)?;

        info!(
            job_id = %job.job_id,
            tenant_id = %tenant_id,
            key = %job.source_key,
            bytes = bytes.len(),
            "Stored upload"
        );
        self.admit(job).await
    }

    /// Queue a job for a file already present in object storage
    pub async fn submit_reference(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        target: ImportTarget,
        source_key: &str,
        file_name: Option<&str>,
    ) -> Result<ImportJob, ImportError> {
        validate_key(source_key).map_err(|e| ImportError::InvalidInput(e.to_string()))?;
        if !source_key.starts_with(&format!("{}/", tenant_id)) {
            return Err(ImportError::InvalidInput(format!(
                "source key '{}' is outside the tenant's storage prefix",
                source_key
            )));
        }
        let file_name = file_name
            .filter(|name| !name.trim().is_empty())
            .or_else(|| source_key.rsplit('/').next())
            .unwrap_or(source_key);

        let job = ImportJob::new(
            tenant_id,
            user_id,
            target,
            source_key.to_string(),
            file_name.to_string(),
            None,
        );
        self.admit(job).await
    }

    async fn admit(&self, job: ImportJob) -> Result<ImportJob, ImportError> {
        self.save(&job).await?;
        self.ctx.emitter.register(&job);

        let token = self.shutdown.child_token();
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.job_id, token.clone());
        self.ctx.gauge.job_queued();

        let queued = job.clone();
        let ctx = self.ctx.clone();
        let slots = Arc::clone(&self.slots);
        let running = Arc::clone(&self.running);
        self.tasks.spawn(async move {
            let job_id = job.job_id;
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                permit = slots.acquire_owned() => permit.ok(),
            };

            let gauge = ctx.gauge.clone();
            match permit {
                Some(_permit) => {
                    gauge.job_started();
                    JobOrchestrator::new(ctx, job, token).run().await;
                    gauge.job_finished();
                }
                None => {
                    // Cancelled while waiting; the orchestrator records it
                    gauge.job_dequeued();
                    JobOrchestrator::new(ctx, job, token).run().await;
                }
            }

            running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&job_id);
        });

        info!(job_id = %queued.job_id, target = %queued.target, "Import job queued");
        Ok(queued)
    }

    /// Request cooperative cancellation
    ///
    /// Returns the job as currently stored; the orchestrator moves it to
    /// `cancelled` at its next checkpoint.
    pub async fn cancel(&self, tenant_id: Uuid, job_id: Uuid) -> Result<ImportJob, ImportError> {
        let job = self.job(tenant_id, job_id).await?;
        if job.is_terminal() {
            return Err(ImportError::AlreadyFinished {
                job_id,
                status: job.status,
            });
        }

        let token = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .cloned();
        match token {
            Some(token) => {
                info!(job_id = %job_id, "Cancellation requested");
                token.cancel();
            }
            None => debug!(job_id = %job_id, "Cancel requested for job that is already winding down"),
        }
        Ok(job)
    }

    /// Current state of one of the tenant's jobs
    ///
    /// Reads skip the breaker: a circuit opened by batch writes must not
    /// hide the outcome of the job that opened it.
    pub async fn job(&self, tenant_id: Uuid, job_id: Uuid) -> Result<ImportJob, ImportError> {
        let pool = &self.ctx.pool;
        let job = self
            .ctx
            .resilience
            .call_ungated(Dependency::RelationalStore, "load job", || {
                db::jobs::load_job(pool, job_id)
            })
            .await
            .map_err(ImportError::from_db)?;

        match job {
            Some(job) if job.tenant_id == tenant_id => Ok(job),
            _ => Err(ImportError::NotFound(job_id)),
        }
    }

    /// Most recent jobs of the tenant, newest first
    pub async fn list(&self, tenant_id: Uuid, limit: u32) -> Result<Vec<ImportJob>, ImportError> {
        let pool = &self.ctx.pool;
        self.ctx
            .resilience
            .call_ungated(Dependency::RelationalStore, "list jobs", || {
                db::jobs::list_jobs(pool, tenant_id, limit)
            })
            .await
            .map_err(ImportError::from_db)
    }

    /// Final counts plus per-row failures of a finished job
    pub async fn summary(&self, tenant_id: Uuid, job_id: Uuid) -> Result<JobSummary, ImportError> {
        let job = self.job(tenant_id, job_id).await?;
        if !job.is_terminal() {
            return Err(ImportError::NotFinished {
                job_id,
                status: job.status,
            });
        }

        let pool = &self.ctx.pool;
        let failures = self
            .ctx
            .resilience
            .call_ungated(Dependency::RelationalStore, "load row failures", || {
                db::outcomes::load_failures(pool, job_id)
            })
            .await
            .map_err(ImportError::from_db)?;
        Ok(JobSummary::from_job(&job, failures))
    }

    /// Latest progress plus a live receiver while the job is running
    pub async fn subscribe(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
    ) -> Result<(ProgressEvent, Option<broadcast::Receiver<ProgressEvent>>), ImportError> {
        let job = self.job(tenant_id, job_id).await?;
        // Jobs from an earlier process have no live channel
        Ok(self
            .ctx
            .emitter
            .subscribe(job_id)
            .unwrap_or_else(|| (job.snapshot(), None)))
    }

    /// Jobs that have not yet reached a terminal state
    pub fn live_jobs(&self) -> usize {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Cancel everything and wait up to `grace` for jobs to wind down
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        self.tasks.close();
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            warn!(
                live_jobs = self.live_jobs(),
                grace_ms = grace.as_millis() as u64,
                "Jobs still running at shutdown"
            );
        }
    }

    async fn save(&self, job: &ImportJob) -> Result<(), ImportError> {
        let pool = &self.ctx.pool;
        self.ctx
            .resilience
            .call(Dependency::RelationalStore, "create job", || {
                db::jobs::save_job(pool, job)
            })
            .await
            .map_err(ImportError::from_db)
    }
}
