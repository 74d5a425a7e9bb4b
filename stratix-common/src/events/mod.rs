//! Event types for the Stratix event system
//!
//! Provides shared event definitions and the EventBus used for operational
//! broadcasting (job lifecycle and dependency health). Row-level data never
//! travels on the bus.

mod import_types;

pub use import_types::{JobStatus, ProgressEvent};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Stratix operational events
///
/// Events are broadcast via EventBus and can be serialized for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StratixEvent {
    /// Import job changed lifecycle status
    JobStatusChanged {
        job_id: Uuid,
        tenant_id: Uuid,
        old_status: JobStatus,
        new_status: JobStatus,
        timestamp: DateTime<Utc>,
    },

    /// A dependency (relational store, object storage) became reachable or unreachable
    DependencyHealthChanged {
        /// Dependency name ("relational_store", "object_storage")
        dependency: String,
        reachable: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl StratixEvent {
    /// SSE event name
    pub fn event_type(&self) -> &'static str {
        match self {
            StratixEvent::JobStatusChanged { .. } => "JobStatusChanged",
            StratixEvent::DependencyHealthChanged { .. } => "DependencyHealthChanged",
        }
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Central event distribution bus for service-wide events
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers (oldest events dropped)
///
/// # Examples
///
/// ```
/// use stratix_common::events::{EventBus, StratixEvent};
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(StratixEvent::DependencyHealthChanged {
///     dependency: "object_storage".to_string(),
///     reachable: false,
///     error: Some("connection refused".to_string()),
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert_eq!(rx.try_recv().unwrap().event_type(), "DependencyHealthChanged");
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StratixEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// * `capacity` - Number of events to buffer before dropping old events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<StratixEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: StratixEvent,
    ) -> Result<usize, broadcast::error::SendError<StratixEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: StratixEvent) {
        let _ = self.tx.send(event);
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
