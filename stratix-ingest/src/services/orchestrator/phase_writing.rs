//! WRITING phase: bounded worker pool over the planned batches
//!
//! Batches arrive through the planner's bounded queue. Up to
//! `writer_concurrency` batches of the same entity type are written at
//! once; a batch of a later type waits until every earlier batch has
//! settled, so foreign keys always point at committed rows.
//!
//! Cancellation is checked between batches. Batches already in flight run
//! to commit or rollback; nothing is ever left half-written.

use std::sync::Arc;
use std::time::Instant;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use super::{Interruption, JobOrchestrator};
use crate::models::{Dependency, EntityType, FailureCategory, ImportBatch, RowFailure};
use crate::services::batch_planner::{self, Plan};
use crate::services::resilience::ResilienceError;
use crate::services::writer::{BatchCommit, WriteError};

/// Result of one batch as reported by its worker
struct BatchOutcome {
    sequence: usize,
    entity_type: EntityType,
    result: Result<BatchCommit, ResilienceError<WriteError>>,
}

impl JobOrchestrator {
    pub(super) async fn phase_writing(&mut self, plan: Plan) -> Result<(), Interruption> {
        let Plan { batches, .. } = plan;
        if batches.is_empty() {
            debug!(job_id = %self.job.job_id, "No valid rows to write");
            return Ok(());
        }

        let started = Instant::now();
        let concurrency = self.ctx.settings.writer_concurrency.max(1);
        let stop_feeding = self.cancel.child_token();
        let (mut queue, producer) = batch_planner::spawn_producer(
            batches,
            self.ctx.settings.queue_capacity,
            stop_feeding.clone(),
        );

        let mut in_flight: JoinSet<BatchOutcome> = JoinSet::new();
        let mut stage: Option<u8> = None;
        let mut interruption: Option<Interruption> = None;

        loop {
            if interruption.is_none() && self.cancel.is_cancelled() {
                interruption = Some(Interruption::Cancelled);
            }
            if interruption.is_some() {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => continue,
                next = queue.recv() => next,
            };
            let Some(batch) = next else { break };

            // Stage barrier between entity types, then the concurrency cap
            let rank = batch.entity_type.rank();
            let crosses_stage = stage.is_some_and(|current| current != rank);
            while (crosses_stage && !in_flight.is_empty()) || in_flight.len() >= concurrency {
                let Some(joined) = in_flight.join_next().await else { break };
                if let Err(stop) = self.settle(joined).await {
                    interruption.get_or_insert(stop);
                }
            }
            if interruption.is_none() && self.cancel.is_cancelled() {
                interruption = Some(Interruption::Cancelled);
            }
            if interruption.is_some() {
                // Still listed as unsettled; abandoned when the job finishes
                break;
            }

            stage = Some(rank);
            self.dispatch(&mut in_flight, batch);
        }

        stop_feeding.cancel();
        drop(queue);
        while let Some(joined) = in_flight.join_next().await {
            if let Err(stop) = self.settle(joined).await {
                interruption.get_or_insert(stop);
            }
        }
        match producer.await {
            Ok(fed) => debug!(job_id = %self.job.job_id, batches = fed, "Batch producer finished"),
            Err(e) => warn!(job_id = %self.job.job_id, error = %e, "Batch producer task failed"),
        }

        match interruption {
            Some(stop) => Err(stop),
            None => {
                info!(
                    job_id = %self.job.job_id,
                    batches = self.job.batches_completed,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "All batches settled"
                );
                Ok(())
            }
        }
    }

    fn dispatch(&self, in_flight: &mut JoinSet<BatchOutcome>, batch: ImportBatch) {
        let writer = Arc::clone(&self.ctx.writer);
        let resilience = self.ctx.resilience.clone();
        let tenant_id = self.job.tenant_id;
        let job_id = self.job.job_id;

        in_flight.spawn(async move {
            debug!(
                job_id = %job_id,
                batch = batch.sequence,
                entity = %batch.entity_type,
                rows = batch.len(),
                "Writing batch"
            );
            let result = resilience
                .call(Dependency::RelationalStore, "write batch", || {
                    writer.write_batch(tenant_id, &batch)
                })
                .await;
            BatchOutcome {
                sequence: batch.sequence,
                entity_type: batch.entity_type,
                result,
            }
        });
    }

    /// Fold one finished batch into the job's counts
    ///
    /// A rejected batch only fails its own rows. A batch whose dependency
    /// stayed unavailable through every retry stops the job.
    async fn settle(
        &mut self,
        joined: Result<BatchOutcome, JoinError>,
    ) -> Result<(), Interruption> {
        let outcome =
            joined.map_err(|e| Interruption::Failed(format!("batch writer task failed: {}", e)))?;
        let rows = self
            .unsettled
            .remove(&outcome.sequence)
            .map(|(_, rows)| rows)
            .unwrap_or_default();
        self.ctx.gauge.batches_settled(1);
        self.job.batches_completed += 1;

        let verdict = match outcome.result {
            Ok(commit) => {
                debug!(
                    job_id = %self.job.job_id,
                    batch = commit.sequence,
                    rows = commit.rows,
                    "Batch committed"
                );
                self.job.record_committed(commit.rows as u64);
                Ok(())
            }
            Err(ResilienceError::Permanent(e)) => {
                warn!(job_id = %self.job.job_id, batch = outcome.sequence, error = %e, "Batch rolled back");
                let message = format!("batch {} rolled back: {}", outcome.sequence, e);
                self.fail_rows(outcome.entity_type, &rows, &message).await;
                self.job.record_error(message);
                Ok(())
            }
            Err(e) => {
                error!(
                    job_id = %self.job.job_id,
                    batch = outcome.sequence,
                    error = %e,
                    "Batch could not be written, stopping job"
                );
                let message = format!("batch {} not written: {}", outcome.sequence, e);
                self.fail_rows(outcome.entity_type, &rows, &message).await;
                Err(Interruption::Failed(message))
            }
        };

        self.ctx.emitter.publish(&self.job);
        self.persist().await;
        verdict
    }

    async fn fail_rows(&mut self, entity: EntityType, rows: &[usize], reason: &str) {
        let failures: Vec<RowFailure> = rows
            .iter()
            .map(|&row| RowFailure {
                row,
                entity_type: Some(entity),
                category: FailureCategory::Write,
                reasons: vec![reason.to_string()],
            })
            .collect();
        self.job.record_write_failures(failures.len() as u64);
        if let Err(e) = self.store_failures(&failures).await {
            warn!(job_id = %self.job.job_id, error = %e, "Failed to record write failures");
        }
    }
}
