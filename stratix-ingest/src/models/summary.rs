//! Final job report

use serde::{Deserialize, Serialize};
use stratix_common::events::JobStatus;
use uuid::Uuid;

use super::{EntityType, ImportJob};

/// Which stage rejected a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Validation,
    Write,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::Validation => "validation",
            FailureCategory::Write => "write",
        }
    }
}

impl std::str::FromStr for FailureCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation" => Ok(FailureCategory::Validation),
            "write" => Ok(FailureCategory::Write),
            other => Err(format!("unknown failure category '{}'", other)),
        }
    }
}

/// One failed source row with its reasons
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFailure {
    pub row: usize,
    /// Unknown when a mixed-workbook row named no valid entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<EntityType>,
    pub category: FailureCategory,
    pub reasons: Vec<String>,
}

/// Final counts and per-row failure reasons for a finished job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub total_rows: u64,
    pub succeeded: u64,
    pub write_failed: u64,
    pub validation_failed: u64,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub failures: Vec<RowFailure>,
}

impl JobSummary {
    pub fn from_job(job: &ImportJob, failures: Vec<RowFailure>) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status,
            total_rows: job.total_rows,
            succeeded: job.processed_rows,
            write_failed: job.write_failed_rows,
            validation_failed: job.validation_failed_rows,
            warnings: job.warnings.clone(),
            last_error: job.last_error.clone(),
            failures,
        }
    }

    /// Every row ends in exactly one outcome bucket
    pub fn is_balanced(&self) -> bool {
        self.succeeded + self.write_failed + self.validation_failed == self.total_rows
    }
}
