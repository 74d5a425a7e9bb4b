//! Data models for stratix-ingest (bulk import service)

pub mod batch;
pub mod entity;
pub mod health;
pub mod import_job;
pub mod record;
pub mod summary;

pub use batch::{BatchStatus, ImportBatch};
pub use entity::{EntityType, ImportTarget};
pub use health::{CircuitState, Dependency, DependencyHealth, HealthSnapshot, QueueDepth};
pub use import_job::{ImportJob, InvalidTransition, StateTransition};
pub use record::{normalize_key, CandidateRecord, FieldValue, ReferenceId, Validation};
pub use summary::{FailureCategory, JobSummary, RowFailure};
