//! Progress Emitter
//!
//! One broadcast channel per job carrying immutable [`ProgressEvent`]
//! snapshots. Publishing never blocks: a slow subscriber lags and loses the
//! oldest snapshots, and can always catch up from the latest one. The
//! emitter is also the only place a job's visible status changes, so every
//! transition is published.
//!
//! A terminal transition closes the job's channel. The entry itself is
//! released once the terminal state is durable; after that subscribers are
//! served from the stored job.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use stratix_common::events::{EventBus, JobStatus, ProgressEvent, StratixEvent};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{ImportJob, InvalidTransition, StateTransition};

struct JobChannel {
    /// Dropped once the job is terminal so subscribers see the stream end
    tx: Option<broadcast::Sender<ProgressEvent>>,
    latest: ProgressEvent,
}

/// Live progress hub shared by all jobs
pub struct ProgressEmitter {
    channels: RwLock<HashMap<Uuid, JobChannel>>,
    capacity: usize,
    events: EventBus,
}

impl ProgressEmitter {
    /// * `capacity` - snapshots buffered per subscriber before the oldest are dropped
    pub fn new(capacity: usize, events: EventBus) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            events,
        }
    }

    /// Open the channel for a new job
    pub fn register(&self, job: &ImportJob) {
        let (tx, _) = broadcast::channel(self.capacity);
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels.insert(
            job.job_id,
            JobChannel {
                tx: Some(tx),
                latest: job.snapshot(),
            },
        );
    }

    /// Publish the job's current counts
    ///
    /// `processed` is clamped so it never goes backwards and never exceeds
    /// `total`, whatever order concurrent workers report in.
    pub fn publish(&self, job: &ImportJob) {
        let mut event = job.snapshot();
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let Some(channel) = channels.get_mut(&job.job_id) else {
            debug!(job_id = %job.job_id, "Progress for unregistered job dropped");
            return;
        };

        event.processed = event.processed.max(channel.latest.processed).min(event.total);
        channel.latest = event.clone();
        if let Some(tx) = &channel.tx {
            // No subscribers is fine; the latest snapshot is kept regardless
            let _ = tx.send(event);
        }
    }

    /// Change the job's status and publish it
    ///
    /// Illegal transitions leave the job untouched and publish nothing.
    /// Reaching a terminal state closes the job's channel after the final
    /// snapshot.
    pub fn transition(
        &self,
        job: &mut ImportJob,
        to: JobStatus,
    ) -> Result<StateTransition, InvalidTransition> {
        let transition = job.transition_to(to)?;
        info!(
            job_id = %job.job_id,
            from = %transition.old_status,
            to = %transition.new_status,
            "Job status changed"
        );

        self.publish(job);
        self.events.emit_lossy(StratixEvent::JobStatusChanged {
            job_id: job.job_id,
            tenant_id: job.tenant_id,
            old_status: transition.old_status,
            new_status: transition.new_status,
            timestamp: Utc::now(),
        });

        if to.is_terminal() {
            self.retire(job.job_id);
        }
        Ok(transition)
    }

    /// Latest snapshot plus a live receiver (absent once the job is terminal)
    ///
    /// `None` for jobs this emitter does not track: never registered, or
    /// already released.
    pub fn subscribe(
        &self,
        job_id: Uuid,
    ) -> Option<(ProgressEvent, Option<broadcast::Receiver<ProgressEvent>>)> {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        channels.get(&job_id).map(|channel| {
            (
                channel.latest.clone(),
                channel.tx.as_ref().map(broadcast::Sender::subscribe),
            )
        })
    }

    pub fn latest(&self, job_id: Uuid) -> Option<ProgressEvent> {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        channels.get(&job_id).map(|channel| channel.latest.clone())
    }

    fn retire(&self, job_id: Uuid) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(channel) = channels.get_mut(&job_id) {
            channel.tx = None;
        }
    }

    /// Forget a job whose final state has been persisted
    pub fn release(&self, job_id: Uuid) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if channels.remove(&job_id).is_some() {
            debug!(job_id = %job_id, "Progress channel released");
        }
    }

    /// Jobs with a progress entry
    pub fn tracked(&self) -> usize {
        self.channels.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, ImportTarget};

    fn job() -> ImportJob {
        ImportJob::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            ImportTarget::Single(EntityType::Areas),
            "k".to_string(),
            "areas.csv".to_string(),
            None,
        )
    }

    #[tokio::test]
    async fn test_subscriber_gets_latest_then_updates() {
        let emitter = ProgressEmitter::new(16, EventBus::new(16));
        let mut job = job();
        emitter.register(&job);

        emitter.transition(&mut job, JobStatus::Validating).unwrap();
        let (latest, rx) = emitter.subscribe(job.job_id).unwrap();
        assert_eq!(latest.phase, JobStatus::Validating);

        let mut rx = rx.unwrap();
        job.set_total(10);
        job.record_committed(4);
        emitter.publish(&job);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.processed, 4);
        assert_eq!(event.total, 10);
    }

    #[tokio::test]
    async fn test_processed_never_decreases() {
        let emitter = ProgressEmitter::new(16, EventBus::new(16));
        let mut job = job();
        job.set_total(10);
        emitter.register(&job);

        job.record_committed(6);
        emitter.publish(&job);

        // A stale copy reporting fewer rows must not move the counter back
        let mut stale = job.clone();
        stale.processed_rows = 3;
        emitter.publish(&stale);

        assert_eq!(emitter.latest(job.job_id).unwrap().processed, 6);
    }

    #[tokio::test]
    async fn test_terminal_closes_stream() {
        let emitter = ProgressEmitter::new(16, EventBus::new(16));
        let mut job = job();
        emitter.register(&job);
        let (_, rx) = emitter.subscribe(job.job_id).unwrap();
        let mut rx = rx.unwrap();

        emitter.transition(&mut job, JobStatus::Cancelled).unwrap();

        let last = rx.recv().await.unwrap();
        assert_eq!(last.phase, JobStatus::Cancelled);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));

        // Late subscribers still get the final snapshot until release
        let (latest, rx) = emitter.subscribe(job.job_id).unwrap();
        assert!(latest.is_terminal());
        assert!(rx.is_none());
    }

    #[tokio::test]
    async fn test_release_drops_finished_job() {
        let emitter = ProgressEmitter::new(16, EventBus::new(16));
        let mut finished = job();
        let running = job();
        emitter.register(&finished);
        emitter.register(&running);

        emitter.transition(&mut finished, JobStatus::Cancelled).unwrap();
        emitter.release(finished.job_id);

        assert_eq!(emitter.tracked(), 1);
        assert!(emitter.subscribe(finished.job_id).is_none());
        assert!(emitter.latest(finished.job_id).is_none());
        assert!(emitter.subscribe(running.job_id).is_some());

        // Releasing twice is harmless
        emitter.release(finished.job_id);
        assert_eq!(emitter.tracked(), 1);
    }

    #[tokio::test]
    async fn test_illegal_transition_publishes_nothing() {
        let bus = EventBus::new(16);
        let mut ops = bus.subscribe();
        let emitter = ProgressEmitter::new(16, bus);
        let mut job = job();
        emitter.register(&job);

        assert!(emitter.transition(&mut job, JobStatus::Completed).is_err());
        assert!(ops.try_recv().is_err());
        assert_eq!(emitter.latest(job.job_id).unwrap().phase, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_transition_announced_on_event_bus() {
        let bus = EventBus::new(16);
        let mut ops = bus.subscribe();
        let emitter = ProgressEmitter::new(16, bus);
        let mut job = job();
        emitter.register(&job);

        emitter.transition(&mut job, JobStatus::Validating).unwrap();

        match ops.try_recv().unwrap() {
            StratixEvent::JobStatusChanged { job_id, new_status, .. } => {
                assert_eq!(job_id, job.job_id);
                assert_eq!(new_status, JobStatus::Validating);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_never_blocks_on_slow_subscriber() {
        let emitter = ProgressEmitter::new(2, EventBus::new(16));
        let mut job = job();
        job.set_total(100);
        emitter.register(&job);
        let (_, rx) = emitter.subscribe(job.job_id).unwrap();
        let mut rx = rx.unwrap();

        for _ in 0..10 {
            job.record_committed(10);
            emitter.publish(&job);
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert_eq!(rx.recv().await.unwrap().processed, 90);
        assert_eq!(rx.recv().await.unwrap().processed, 100);
    }
}
