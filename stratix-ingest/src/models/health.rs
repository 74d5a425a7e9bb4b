//! Dependency health snapshot types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// External dependency guarded by a circuit breaker and probed by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    RelationalStore,
    ObjectStorage,
}

impl Dependency {
    pub fn as_str(self) -> &'static str {
        match self {
            Dependency::RelationalStore => "relational_store",
            Dependency::ObjectStorage => "object_storage",
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Last known state of one dependency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub reachable: bool,
    pub circuit: CircuitState,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Round-trip of the most recent probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl Default for DependencyHealth {
    /// Unknown until the first probe; reported unreachable rather than healthy
    fn default() -> Self {
        Self {
            reachable: false,
            circuit: CircuitState::Closed,
            last_success: None,
            last_failure: None,
            last_error: None,
            latency_ms: None,
        }
    }
}

/// Pipeline backlog at snapshot time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Jobs accepted but waiting for a job slot
    pub queued_jobs: u64,
    /// Jobs currently validating or writing
    pub active_jobs: u64,
    /// Planned batches not yet committed across all jobs
    pub pending_batches: u64,
}

/// Health report recomputed on every poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: String,
    pub relational_store: DependencyHealth,
    pub object_storage: DependencyHealth,
    pub queue: QueueDepth,
    pub checked_at: DateTime<Utc>,
}

impl DependencyHealth {
    /// Reachable and not short-circuited
    pub fn is_available(&self) -> bool {
        self.reachable && self.circuit != CircuitState::Open
    }
}

impl HealthSnapshot {
    pub fn new(
        relational_store: DependencyHealth,
        object_storage: DependencyHealth,
        queue: QueueDepth,
    ) -> Self {
        let healthy = relational_store.is_available() && object_storage.is_available();
        Self {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            relational_store,
            object_storage,
            queue,
            checked_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.relational_store.is_available() && self.object_storage.is_available()
    }
}
