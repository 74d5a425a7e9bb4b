//! VALIDATING phase: fetch, parse, validate and plan

use std::time::Instant;
use tracing::{debug, info};

use super::{Interruption, JobOrchestrator};
use crate::db;
use crate::models::{Dependency, EntityType, FailureCategory, RowFailure};
use crate::services::batch_planner::{self, Plan};
use crate::services::parser::{self, ParseOutcome, ReferenceIndex};

impl JobOrchestrator {
    pub(super) async fn phase_validating(&mut self) -> Result<Plan, Interruption> {
        let started = Instant::now();

        let bytes = self.fetch_source().await?;
        let existing = self.load_references().await?;
        self.check_cancelled()?;

        let target = self.job.target;
        let outcome = tokio::task::spawn_blocking(move || parser::parse(&bytes, target, &existing))
            .await
            .map_err(|e| Interruption::Failed(format!("validation task failed: {}", e)))?
            .map_err(|e| Interruption::Failed(e.to_string()))?;

        let total = outcome.total_rows() as u64;
        let ParseOutcome {
            records,
            unclassified,
            warnings,
        } = outcome;
        self.job.set_total(total);
        self.job.warnings.extend(warnings);

        let plan = batch_planner::plan(records, self.ctx.settings.batch_size);

        let mut failures: Vec<RowFailure> = plan
            .invalid
            .iter()
            .map(|record| RowFailure {
                row: record.row,
                entity_type: Some(record.entity_type),
                category: FailureCategory::Validation,
                reasons: record.reasons().to_vec(),
            })
            .collect();
        failures.extend(unclassified.into_iter().map(|row| RowFailure {
            row: row.row,
            entity_type: None,
            category: FailureCategory::Validation,
            reasons: vec![row.reason],
        }));
        failures.sort_by_key(|f| f.row);
        self.job.record_validation_failures(failures.len() as u64);

        for batch in &plan.batches {
            self.unsettled
                .insert(batch.sequence, (batch.entity_type, batch.rows()));
        }
        self.job.batches_total = plan.batches.len() as u64;
        self.ctx.gauge.batches_planned(plan.batches.len() as u64);

        self.store_failures(&failures)
            .await
            .map_err(|e| Interruption::Failed(format!("could not record validation failures: {}", e)))?;

        self.ctx.emitter.publish(&self.job);
        self.persist().await;

        info!(
            job_id = %self.job.job_id,
            total,
            valid = plan.valid_rows(),
            invalid = failures.len(),
            batches = plan.batches.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Validation complete"
        );
        Ok(plan)
    }

    async fn fetch_source(&self) -> Result<Vec<u8>, Interruption> {
        let store = &self.ctx.store;
        let key = self.job.source_key.as_str();
        let bytes = self
            .ctx
            .resilience
            .call(Dependency::ObjectStorage, "fetch source file", || store.get(key))
            .await
            .map_err(|e| Interruption::Failed(format!("could not read source file '{}': {}", key, e)))?;

        debug!(job_id = %self.job.job_id, key, bytes = bytes.len(), "Fetched source file");
        Ok(bytes)
    }

    /// Natural keys of every type the upload's rows may reference
    async fn load_references(&self) -> Result<ReferenceIndex, Interruption> {
        let highest = self
            .job
            .target
            .entity_types()
            .into_iter()
            .map(EntityType::rank)
            .max()
            .unwrap_or(0);
        let prerequisites: Vec<EntityType> = EntityType::WRITE_ORDER
            .into_iter()
            .filter(|entity| entity.rank() < highest)
            .collect();
        if prerequisites.is_empty() {
            return Ok(ReferenceIndex::new());
        }

        let pool = &self.ctx.pool;
        let tenant_id = self.job.tenant_id;
        let prerequisites = prerequisites.as_slice();
        self.ctx
            .resilience
            .call(Dependency::RelationalStore, "load reference index", || {
                db::entities::load_reference_index(pool, tenant_id, prerequisites)
            })
            .await
            .map_err(|e| Interruption::Failed(format!("could not load existing records: {}", e)))
    }
}
