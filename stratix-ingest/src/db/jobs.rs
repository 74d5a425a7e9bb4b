//! Import job persistence
//!
//! Jobs outlive their run: the ledger is kept for history and audit.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use stratix_common::events::JobStatus;
use stratix_common::{Error, Result};
use uuid::Uuid;

use super::{parse_timestamp, parse_uuid};
use crate::models::{ImportJob, ImportTarget};

const JOB_COLUMNS: &str = r#"
    job_id, tenant_id, submitted_by, target, source_key, file_name, source_sha256,
    status, total_rows, processed_rows, write_failed_rows, validation_failed_rows,
    batches_total, batches_completed, warnings, last_error,
    created_at, updated_at, finished_at
"#;

/// Insert or update a job
pub async fn save_job(pool: &SqlitePool, job: &ImportJob) -> Result<()> {
    let warnings = serde_json::to_string(&job.warnings)?;

    sqlx::query(
        r#"
        INSERT INTO import_jobs (
            job_id, tenant_id, submitted_by, target, source_key, file_name, source_sha256,
            status, total_rows, processed_rows, write_failed_rows, validation_failed_rows,
            batches_total, batches_completed, warnings, last_error,
            created_at, updated_at, finished_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(job_id) DO UPDATE SET
            status = excluded.status,
            total_rows = excluded.total_rows,
            processed_rows = excluded.processed_rows,
            write_failed_rows = excluded.write_failed_rows,
            validation_failed_rows = excluded.validation_failed_rows,
            batches_total = excluded.batches_total,
            batches_completed = excluded.batches_completed,
            warnings = excluded.warnings,
            last_error = excluded.last_error,
            updated_at = excluded.updated_at,
            finished_at = excluded.finished_at
        "#,
    )
    .bind(job.job_id.to_string())
    .bind(job.tenant_id.to_string())
    .bind(job.submitted_by.to_string())
    .bind(job.target.to_string())
    .bind(&job.source_key)
    .bind(&job.file_name)
    .bind(&job.source_sha256)
    .bind(job.status.as_str())
    .bind(job.total_rows as i64)
    .bind(job.processed_rows as i64)
    .bind(job.write_failed_rows as i64)
    .bind(job.validation_failed_rows as i64)
    .bind(job.batches_total as i64)
    .bind(job.batches_completed as i64)
    .bind(warnings)
    .bind(&job.last_error)
    .bind(job.created_at.to_rfc3339())
    .bind(job.updated_at.to_rfc3339())
    .bind(job.finished_at.map(|dt| dt.to_rfc3339()))
    .execute(pool)
    .await?;

    Ok(())
}

/// Load a job by id
pub async fn load_job(pool: &SqlitePool, job_id: Uuid) -> Result<Option<ImportJob>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM import_jobs WHERE job_id = ?",
        JOB_COLUMNS
    ))
    .bind(job_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(|row| job_from_row(&row)).transpose()
}

/// Most recent jobs of one tenant, newest first
pub async fn list_jobs(pool: &SqlitePool, tenant_id: Uuid, limit: u32) -> Result<Vec<ImportJob>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM import_jobs WHERE tenant_id = ? ORDER BY created_at DESC LIMIT ?",
        JOB_COLUMNS
    ))
    .bind(tenant_id.to_string())
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

/// Cancel jobs left non-terminal by a previous process
///
/// Their background tasks died with that process, so they can never
/// progress. Rows they never classified are counted as write-failed so the
/// outcome totals still add up.
pub async fn cleanup_stale_jobs(pool: &SqlitePool) -> Result<usize> {
    let now = Utc::now().to_rfc3339();
    let result = sqlx::query(
        r#"
        UPDATE import_jobs
        SET status = 'cancelled',
            write_failed_rows = MAX(total_rows - processed_rows - validation_failed_rows, write_failed_rows),
            last_error = 'not written: service restarted while job was running',
            updated_at = ?,
            finished_at = ?
        WHERE status IN ('queued', 'validating', 'writing')
        "#,
    )
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() as usize)
}

fn job_from_row(row: &SqliteRow) -> Result<ImportJob> {
    let target: String = row.get("target");
    let target: ImportTarget = target
        .parse()
        .map_err(|e: String| Error::Internal(format!("Failed to parse target: {}", e)))?;

    let status: String = row.get("status");
    let status: JobStatus = status
        .parse()
        .map_err(|e: String| Error::Internal(format!("Failed to parse status: {}", e)))?;

    let warnings: String = row.get("warnings");
    let warnings: Vec<String> = serde_json::from_str(&warnings)?;

    let finished_at: Option<String> = row.get("finished_at");

    Ok(ImportJob {
        job_id: parse_uuid("job_id", row.get("job_id"))?,
        tenant_id: parse_uuid("tenant_id", row.get("tenant_id"))?,
        submitted_by: parse_uuid("submitted_by", row.get("submitted_by"))?,
        target,
        source_key: row.get("source_key"),
        file_name: row.get("file_name"),
        source_sha256: row.get("source_sha256"),
        status,
        total_rows: row.get::<i64, _>("total_rows") as u64,
        processed_rows: row.get::<i64, _>("processed_rows") as u64,
        write_failed_rows: row.get::<i64, _>("write_failed_rows") as u64,
        validation_failed_rows: row.get::<i64, _>("validation_failed_rows") as u64,
        batches_total: row.get::<i64, _>("batches_total") as u64,
        batches_completed: row.get::<i64, _>("batches_completed") as u64,
        warnings,
        last_error: row.get("last_error"),
        created_at: parse_timestamp("created_at", row.get("created_at"))?,
        updated_at: parse_timestamp("updated_at", row.get("updated_at"))?,
        finished_at: finished_at
            .map(|s| parse_timestamp("finished_at", &s))
            .transpose()?,
    })
}
