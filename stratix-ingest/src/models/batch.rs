//! Transaction-sized groups of valid records

use serde::{Deserialize, Serialize};

use super::{CandidateRecord, EntityType};

/// Commit state of one batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Committed,
    RolledBack { error: String },
    /// Never attempted (job cancelled or aborted first)
    Skipped { reason: String },
}

/// Bounded, ordered group of records sharing one entity type and one transaction
#[derive(Debug, Clone)]
pub struct ImportBatch {
    /// 1-based position in the job's plan
    pub sequence: usize,
    pub entity_type: EntityType,
    pub records: Vec<CandidateRecord>,
    pub status: BatchStatus,
}

impl ImportBatch {
    pub fn new(sequence: usize, entity_type: EntityType, records: Vec<CandidateRecord>) -> Self {
        Self {
            sequence,
            entity_type,
            records,
            status: BatchStatus::Pending,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Source rows covered by this batch
    pub fn rows(&self) -> Vec<usize> {
        self.records.iter().map(|r| r.row).collect()
    }
}
