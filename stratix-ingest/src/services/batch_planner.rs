//! Batch Planner
//!
//! Groups valid records into bounded batches, one entity type per batch,
//! ordered so every prerequisite type is planned before its dependents.
//! Invalid records never reach a batch.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::{CandidateRecord, EntityType, ImportBatch};

/// Ordered batches plus the records excluded from writing
#[derive(Debug, Default)]
pub struct Plan {
    pub batches: Vec<ImportBatch>,
    pub invalid: Vec<CandidateRecord>,
}

impl Plan {
    /// Number of batches planned for one entity type
    pub fn batch_count(&self, entity: EntityType) -> usize {
        self.batches.iter().filter(|b| b.entity_type == entity).count()
    }

    /// Valid records across all batches
    pub fn valid_rows(&self) -> usize {
        self.batches.iter().map(ImportBatch::len).sum()
    }
}

/// Build the write plan
///
/// Records are stably ordered by entity rank, so source row order is kept
/// within each type. Each type yields `ceil(valid / max_batch_size)` batches.
pub fn plan(records: Vec<CandidateRecord>, max_batch_size: usize) -> Plan {
    let max_batch_size = max_batch_size.max(1);
    let (mut valid, invalid): (Vec<_>, Vec<_>) =
        records.into_iter().partition(CandidateRecord::is_valid);
    valid.sort_by_key(|r| r.entity_type.rank());

    let mut batches = Vec::new();
    let mut current: Vec<CandidateRecord> = Vec::with_capacity(max_batch_size);
    let mut current_type: Option<EntityType> = None;

    for record in valid {
        let flush = match current_type {
            Some(entity) => entity != record.entity_type || current.len() == max_batch_size,
            None => false,
        };
        if flush {
            if let Some(entity) = current_type {
                let records = std::mem::replace(&mut current, Vec::with_capacity(max_batch_size));
                batches.push(ImportBatch::new(batches.len() + 1, entity, records));
            }
        }
        current_type = Some(record.entity_type);
        current.push(record);
    }
    if let Some(entity) = current_type {
        if !current.is_empty() {
            batches.push(ImportBatch::new(batches.len() + 1, entity, current));
        }
    }

    debug!(
        batches = batches.len(),
        invalid = invalid.len(),
        max_batch_size,
        "Planned import batches"
    );
    Plan { batches, invalid }
}

/// Hand already-planned batches to the writers through a bounded queue
///
/// The whole plan is in memory before this runs; the queue only paces
/// hand-over, so at most `capacity` batches sit between producer and
/// writers and cancellation stops the rest from being offered. Stops early
/// when `cancel` fires or the consumer goes away. The join handle yields
/// the number of batches handed over.
pub fn spawn_producer(
    batches: Vec<ImportBatch>,
    capacity: usize,
    cancel: CancellationToken,
) -> (mpsc::Receiver<ImportBatch>, JoinHandle<usize>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(async move {
        let mut sent = 0;
        for batch in batches {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = tx.send(batch) => {
                    if result.is_err() {
                        break;
                    }
                    sent += 1;
                }
            }
        }
        sent
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(entity: EntityType, rows: std::ops::Range<usize>) -> Vec<CandidateRecord> {
        rows.map(|row| CandidateRecord::new(row, entity)).collect()
    }

    #[test]
    fn test_ceil_batches_per_type() {
        let mut input = records(EntityType::Areas, 2..12);
        input.extend(records(EntityType::Users, 12..15));

        let plan = plan(input, 4);

        assert_eq!(plan.batch_count(EntityType::Areas), 3);
        assert_eq!(plan.batch_count(EntityType::Users), 1);
        assert_eq!(plan.valid_rows(), 13);
        let sizes: Vec<usize> = plan.batches.iter().map(ImportBatch::len).collect();
        assert_eq!(sizes, vec![4, 4, 2, 3]);
    }

    #[test]
    fn test_invalid_records_are_excluded() {
        let mut input = records(EntityType::Areas, 2..6);
        input[1].invalidate("missing required field 'name'");

        let plan = plan(input, 10);

        assert_eq!(plan.invalid.len(), 1);
        assert_eq!(plan.invalid[0].row, 3);
        assert_eq!(plan.batches[0].rows(), vec![2, 4, 5]);
    }

    #[test]
    fn test_prerequisites_first_and_source_order_kept() {
        let mut input = Vec::new();
        input.extend(records(EntityType::Initiatives, 2..4));
        input.extend(records(EntityType::Areas, 4..6));
        input.extend(records(EntityType::Initiatives, 6..7));
        input.extend(records(EntityType::Objectives, 7..8));

        let plan = plan(input, 10);

        let order: Vec<(EntityType, Vec<usize>)> = plan
            .batches
            .iter()
            .map(|b| (b.entity_type, b.rows()))
            .collect();
        assert_eq!(
            order,
            vec![
                (EntityType::Areas, vec![4, 5]),
                (EntityType::Objectives, vec![7]),
                (EntityType::Initiatives, vec![2, 3, 6]),
            ]
        );
        let sequences: Vec<usize> = plan.batches.iter().map(|b| b.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[test]
    fn test_each_record_in_exactly_one_batch() {
        let plan = plan(records(EntityType::Users, 2..1003), 100);
        let mut rows: Vec<usize> = plan.batches.iter().flat_map(|b| b.rows()).collect();
        rows.dedup();
        assert_eq!(rows.len(), 1001);
        assert_eq!(plan.batches.len(), 11);
    }

    #[test]
    fn test_empty_input() {
        let plan = plan(Vec::new(), 10);
        assert!(plan.batches.is_empty());
    }

    #[tokio::test]
    async fn test_producer_applies_backpressure() {
        let plan = plan(records(EntityType::Areas, 2..12), 1);
        let (mut rx, handle) = spawn_producer(plan.batches, 2, CancellationToken::new());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!handle.is_finished(), "producer must wait for the consumer");

        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 10);
        assert_eq!(handle.await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_producer_stops_on_cancel() {
        let plan = plan(records(EntityType::Areas, 2..12), 1);
        let cancel = CancellationToken::new();
        let (mut rx, handle) = spawn_producer(plan.batches, 1, cancel.clone());

        assert!(rx.recv().await.is_some());
        cancel.cancel();
        let sent = handle.await.unwrap();
        assert!(sent < 10);
    }
}
