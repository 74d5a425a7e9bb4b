//! Transactional Writer
//!
//! One batch is one transaction: every row commits or none does. Rows are
//! upserted on `(tenant_id, natural_key)` so replaying a batch after a
//! retry, or re-running the same file, never duplicates anything.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use stratix_common::error::is_transient_sqlx;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::entities::find_id;
use crate::models::{CandidateRecord, EntityType, ImportBatch, ReferenceId};
use crate::services::resilience::Transience;
use crate::utils::begin_monitored;

/// Why a batch did not commit
#[derive(Debug, Clone, Error)]
pub enum WriteError {
    /// Lock contention, lost connection, pool exhaustion
    #[error("transient database error: {0}")]
    Transient(String),

    /// Constraint violation or unresolvable reference; retrying cannot help
    #[error("{}", rejected_message(.row, .message))]
    Rejected { row: Option<usize>, message: String },
}

fn rejected_message(row: &Option<usize>, message: &str) -> String {
    match row {
        Some(row) => format!("row {}: {}", row, message),
        None => message.to_string(),
    }
}

impl Transience for WriteError {
    fn is_transient(&self) -> bool {
        matches!(self, WriteError::Transient(_))
    }
}

impl WriteError {
    fn from_sqlx(row: Option<usize>, err: sqlx::Error) -> Self {
        if is_transient_sqlx(&err) {
            WriteError::Transient(err.to_string())
        } else {
            WriteError::Rejected {
                row,
                message: err.to_string(),
            }
        }
    }
}

/// Result of a committed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCommit {
    pub sequence: usize,
    pub rows: usize,
}

/// Writes one batch atomically for one tenant
#[async_trait]
pub trait BatchWriter: Send + Sync {
    async fn write_batch(&self, tenant_id: Uuid, batch: &ImportBatch)
        -> Result<BatchCommit, WriteError>;
}

/// SQLite implementation of [`BatchWriter`]
#[derive(Debug, Clone)]
pub struct SqliteBatchWriter {
    pool: SqlitePool,
}

impl SqliteBatchWriter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchWriter for SqliteBatchWriter {
    async fn write_batch(
        &self,
        tenant_id: Uuid,
        batch: &ImportBatch,
    ) -> Result<BatchCommit, WriteError> {
        let mut tx = begin_monitored(&self.pool, "writer::write_batch")
            .await
            .map_err(|e| WriteError::from_sqlx(None, e))?;

        let now = Utc::now().to_rfc3339();
        for record in &batch.records {
            if let Err(e) = write_record(tx.conn(), tenant_id, record, &now).await {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(
                        batch = batch.sequence,
                        error = %rollback_err,
                        "Rollback failed; connection dropped instead"
                    );
                }
                debug!(batch = batch.sequence, error = %e, "Batch rolled back");
                return Err(e);
            }
        }

        tx.commit()
            .await
            .map_err(|e| WriteError::from_sqlx(None, e))?;

        debug!(
            batch = batch.sequence,
            entity_type = %batch.entity_type,
            rows = batch.len(),
            "Batch committed"
        );
        Ok(BatchCommit {
            sequence: batch.sequence,
            rows: batch.len(),
        })
    }
}

fn date_text(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

/// Foreign key id for `field`, resolving same-file rows inside the transaction
async fn resolve_reference(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    record: &CandidateRecord,
    field: &str,
) -> Result<Option<String>, WriteError> {
    match record.reference(field) {
        None => Ok(None),
        Some(ReferenceId::Existing { id, .. }) => Ok(Some(id.to_string())),
        Some(ReferenceId::InFile {
            entity,
            natural_key,
            row,
        }) => {
            let id = find_id(conn, tenant_id, *entity, natural_key)
                .await
                .map_err(|e| WriteError::from_sqlx(Some(record.row), e))?;
            id.map(Some).ok_or_else(|| WriteError::Rejected {
                row: Some(record.row),
                message: format!(
                    "{} '{}' from row {} was not written",
                    entity.singular(),
                    natural_key,
                    row
                ),
            })
        }
    }
}

async fn write_record(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    record: &CandidateRecord,
    now: &str,
) -> Result<(), WriteError> {
    let natural_key = record.natural_key().ok_or_else(|| WriteError::Rejected {
        row: Some(record.row),
        message: format!("missing {}", record.entity_type.natural_key_field()),
    })?;

    let existing = find_id(conn, tenant_id, record.entity_type, &natural_key)
        .await
        .map_err(|e| WriteError::from_sqlx(Some(record.row), e))?;
    let id = existing.unwrap_or_else(|| Uuid::new_v4().to_string());
    let tenant = tenant_id.to_string();

    let result = match record.entity_type {
        EntityType::Areas => {
            sqlx::query(
                r#"
                INSERT INTO areas (id, tenant_id, natural_key, name, description, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(tenant_id, natural_key) DO UPDATE SET
                    name = excluded.name,
                    description = excluded.description,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&id)
            .bind(&tenant)
            .bind(&natural_key)
            .bind(record.text("name"))
            .bind(record.text("description"))
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await
        }
        EntityType::Users => {
            let area_id = resolve_reference(conn, tenant_id, record, "area").await?;
            sqlx::query(
                r#"
                INSERT INTO users (id, tenant_id, natural_key, email, full_name, role, area_id, active, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(tenant_id, natural_key) DO UPDATE SET
                    email = excluded.email,
                    full_name = excluded.full_name,
                    role = excluded.role,
                    area_id = excluded.area_id,
                    active = excluded.active,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&id)
            .bind(&tenant)
            .bind(&natural_key)
            .bind(record.text("email"))
            .bind(record.text("full_name"))
            .bind(record.text("role"))
            .bind(area_id)
            .bind(record.boolean("active").unwrap_or(true))
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await
        }
        EntityType::Objectives => {
            let area_id = resolve_reference(conn, tenant_id, record, "area").await?;
            sqlx::query(
                r#"
                INSERT INTO objectives (id, tenant_id, natural_key, title, area_id, description, quarter, target_date, progress, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(tenant_id, natural_key) DO UPDATE SET
                    title = excluded.title,
                    area_id = excluded.area_id,
                    description = excluded.description,
                    quarter = excluded.quarter,
                    target_date = excluded.target_date,
                    progress = excluded.progress,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&id)
            .bind(&tenant)
            .bind(&natural_key)
            .bind(record.text("title"))
            .bind(area_id)
            .bind(record.text("description"))
            .bind(record.text("quarter"))
            .bind(date_text(record.date("target_date")))
            .bind(record.number("progress"))
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await
        }
        EntityType::Initiatives => {
            let area_id = resolve_reference(conn, tenant_id, record, "area").await?;
            let objective_id = resolve_reference(conn, tenant_id, record, "objective").await?;
            let owner_id = resolve_reference(conn, tenant_id, record, "owner_email").await?;
            sqlx::query(
                r#"
                INSERT INTO initiatives (
                    id, tenant_id, natural_key, title, area_id, objective_id, owner_id,
                    description, status, progress, start_date, due_date, budget,
                    created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(tenant_id, natural_key) DO UPDATE SET
                    title = excluded.title,
                    area_id = excluded.area_id,
                    objective_id = excluded.objective_id,
                    owner_id = excluded.owner_id,
                    description = excluded.description,
                    status = excluded.status,
                    progress = excluded.progress,
                    start_date = excluded.start_date,
                    due_date = excluded.due_date,
                    budget = excluded.budget,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&id)
            .bind(&tenant)
            .bind(&natural_key)
            .bind(record.text("title"))
            .bind(area_id)
            .bind(objective_id)
            .bind(owner_id)
            .bind(record.text("description"))
            .bind(record.text("status").unwrap_or("planning"))
            .bind(record.number("progress").unwrap_or(0.0))
            .bind(date_text(record.date("start_date")))
            .bind(date_text(record.date("due_date")))
            .bind(record.number("budget"))
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await
        }
    };

    result
        .map(|_| ())
        .map_err(|e| WriteError::from_sqlx(Some(record.row), e))
}
