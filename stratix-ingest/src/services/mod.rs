//! Import pipeline components
//!
//! template → parser → batch_planner → writer, driven per job by the
//! orchestrator. Resilience, progress and health are shared by all jobs.

pub mod batch_planner;
pub mod health_monitor;
pub mod import_service;
pub mod orchestrator;
pub mod parser;
pub mod progress;
pub mod resilience;
pub mod template;
pub mod writer;

pub use batch_planner::Plan;
pub use health_monitor::{HealthMonitor, HealthRegistry, QueueGauge};
pub use import_service::{ImportError, ImportService};
pub use orchestrator::{ImportContext, JobOrchestrator, PipelineSettings};
pub use parser::{ParseError, ParseOutcome, ReferenceIndex};
pub use progress::ProgressEmitter;
pub use resilience::{BreakerConfig, CircuitBreaker, Resilience, ResilienceError, RetryPolicy};
pub use template::{FieldKind, FieldSpec, Template};
pub use writer::{BatchWriter, SqliteBatchWriter, WriteError};
