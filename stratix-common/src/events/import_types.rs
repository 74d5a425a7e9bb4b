//! Import job type definitions
//!
//! Supporting types for import job progress tracking, shared between the
//! ingest service and anything consuming its progress streams.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Import job lifecycle status
///
/// ```text
/// queued → validating → writing → completed
///             │            │
///             └─→ failed ←─┘
/// (any non-terminal) → cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted, waiting for a job slot
    Queued,
    /// Reading the source file and validating rows
    Validating,
    /// Committing batches
    Writing,
    /// Finished (possibly with row-level failures)
    Completed,
    /// Aborted by a fatal condition
    Failed,
    /// Stopped by the submitting user
    Cancelled,
}

impl JobStatus {
    /// Terminal states have no outgoing transitions
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self → next` is a legal lifecycle transition
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, Validating) => true,
            (Validating, Writing) | (Validating, Failed) => true,
            (Writing, Completed) | (Writing, Failed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Validating => "validating",
            JobStatus::Writing => "writing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "validating" => Ok(JobStatus::Validating),
            "writing" => Ok(JobStatus::Writing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Point-in-time progress snapshot for one import job
///
/// Snapshots are never mutated after emission; every update is a new value.
/// Within one job `processed` is non-decreasing and never exceeds `total`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    /// Current lifecycle phase
    pub phase: JobStatus,
    /// Rows committed so far
    pub processed: u64,
    /// Rows in the source file
    pub total: u64,
    pub write_failed: u64,
    pub validation_failed: u64,
    pub batches_completed: u64,
    pub batches_total: u64,
    /// Most recent error (batch rollback, retry exhaustion, fatal condition)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Percentage of rows accounted for (committed or failed)
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return if self.is_terminal() { 100.0 } else { 0.0 };
        }
        let accounted = self.processed + self.write_failed + self.validation_failed;
        (accounted.min(self.total) as f64 / self.total as f64) * 100.0
    }
}
