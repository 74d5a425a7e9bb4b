//! Import job state machine
//!
//! A job progresses `queued → validating → writing → completed`, may fail
//! from `validating` or `writing`, and may be cancelled from any
//! non-terminal state. Terminal states are final.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratix_common::events::{JobStatus, ProgressEvent};
use thiserror::Error;
use uuid::Uuid;

use super::ImportTarget;

/// Rejected status change
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("illegal job transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Applied status change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub job_id: Uuid,
    pub old_status: JobStatus,
    pub new_status: JobStatus,
    pub transitioned_at: DateTime<Utc>,
}

/// One upload-to-completion run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    pub job_id: Uuid,
    pub tenant_id: Uuid,
    /// User who submitted the upload
    pub submitted_by: Uuid,
    /// Declared entity type (or mixed workbook)
    pub target: ImportTarget,
    /// Object storage key of the raw file
    pub source_key: String,
    pub file_name: String,
    /// SHA-256 of the uploaded bytes (hex), when the service stored them
    pub source_sha256: Option<String>,
    pub status: JobStatus,
    pub total_rows: u64,
    /// Rows committed so far (succeeded)
    pub processed_rows: u64,
    pub write_failed_rows: u64,
    pub validation_failed_rows: u64,
    pub batches_total: u64,
    pub batches_completed: u64,
    pub warnings: Vec<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ImportJob {
    /// Create a queued job for an accepted upload
    pub fn new(
        tenant_id: Uuid,
        submitted_by: Uuid,
        target: ImportTarget,
        source_key: String,
        file_name: String,
        source_sha256: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            tenant_id,
            submitted_by,
            target,
            source_key,
            file_name,
            source_sha256,
            status: JobStatus::Queued,
            total_rows: 0,
            processed_rows: 0,
            write_failed_rows: 0,
            validation_failed_rows: 0,
            batches_total: 0,
            batches_completed: 0,
            warnings: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Apply a lifecycle transition
    ///
    /// Only the progress emitter calls this, so every visible status change
    /// is also published.
    pub(crate) fn transition_to(
        &mut self,
        new_status: JobStatus,
    ) -> Result<StateTransition, InvalidTransition> {
        if !self.status.can_transition_to(new_status) {
            return Err(InvalidTransition {
                from: self.status,
                to: new_status,
            });
        }

        let now = Utc::now();
        let transition = StateTransition {
            job_id: self.job_id,
            old_status: self.status,
            new_status,
            transitioned_at: now,
        };
        self.status = new_status;
        self.updated_at = now;
        if new_status.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(transition)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Total row count is fixed once validation has produced the record set
    pub fn set_total(&mut self, total_rows: u64) {
        self.total_rows = total_rows;
        self.touch();
    }

    /// Count a committed batch; processed never exceeds total
    pub fn record_committed(&mut self, rows: u64) {
        self.processed_rows = self.processed_rows.saturating_add(rows).min(self.total_rows);
        self.touch();
    }

    pub fn record_write_failures(&mut self, rows: u64) {
        self.write_failed_rows += rows;
        self.touch();
    }

    pub fn record_validation_failures(&mut self, rows: u64) {
        self.validation_failed_rows += rows;
        self.touch();
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.touch();
    }

    /// Rows not yet classified as succeeded, write-failed or validation-failed
    pub fn unaccounted_rows(&self) -> u64 {
        self.total_rows.saturating_sub(
            self.processed_rows + self.write_failed_rows + self.validation_failed_rows,
        )
    }

    /// Current progress snapshot
    pub fn snapshot(&self) -> ProgressEvent {
        ProgressEvent {
            job_id: self.job_id,
            phase: self.status,
            processed: self.processed_rows,
            total: self.total_rows,
            write_failed: self.write_failed_rows,
            validation_failed: self.validation_failed_rows,
            batches_completed: self.batches_completed,
            batches_total: self.batches_total,
            last_error: self.last_error.clone(),
            timestamp: Utc::now(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityType;

    fn job() -> ImportJob {
        ImportJob::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            ImportTarget::Single(EntityType::Areas),
            "tenant/areas.csv".to_string(),
            "areas.csv".to_string(),
            None,
        )
    }

    #[test]
    fn test_new_job_is_queued() {
        let job = job();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.finished_at.is_none());
    }

    #[test]
    fn test_terminal_transition_sets_finished_at() {
        let mut job = job();
        job.transition_to(JobStatus::Validating).unwrap();
        job.transition_to(JobStatus::Writing).unwrap();
        let transition = job.transition_to(JobStatus::Completed).unwrap();

        assert_eq!(transition.old_status, JobStatus::Writing);
        assert!(job.finished_at.is_some());
        assert!(job.is_terminal());
    }

    #[test]
    fn test_illegal_transition_leaves_status_untouched() {
        let mut job = job();
        let err = job.transition_to(JobStatus::Completed).unwrap_err();
        assert_eq!(err.from, JobStatus::Queued);
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn test_processed_is_capped_at_total() {
        let mut job = job();
        job.set_total(10);
        job.record_committed(7);
        job.record_committed(7);
        assert_eq!(job.processed_rows, 10);
    }

    #[test]
    fn test_unaccounted_rows() {
        let mut job = job();
        job.set_total(10);
        job.record_committed(5);
        job.record_validation_failures(1);
        job.record_write_failures(2);
        assert_eq!(job.unaccounted_rows(), 2);
    }
}
