//! Per-row failure reports

use sqlx::{Row, SqlitePool};
use stratix_common::{Error, Result};
use uuid::Uuid;

use crate::models::{EntityType, FailureCategory, RowFailure};

/// Store failure reasons for a set of rows in one transaction
pub async fn record_failures(pool: &SqlitePool, job_id: Uuid, failures: &[RowFailure]) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }

    let job_id = job_id.to_string();
    let mut tx = pool.begin().await?;
    for failure in failures {
        let reasons = serde_json::to_string(&failure.reasons)?;
        sqlx::query(
            r#"
            INSERT INTO import_row_failures (job_id, row_number, entity_type, category, reasons)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(job_id, row_number) DO UPDATE SET
                category = excluded.category,
                reasons = excluded.reasons
            "#,
        )
        .bind(&job_id)
        .bind(failure.row as i64)
        .bind(failure.entity_type.map(EntityType::as_str))
        .bind(failure.category.as_str())
        .bind(reasons)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    Ok(())
}

/// Failures of one job ordered by source row
pub async fn load_failures(pool: &SqlitePool, job_id: Uuid) -> Result<Vec<RowFailure>> {
    let rows = sqlx::query(
        r#"
        SELECT row_number, entity_type, category, reasons
        FROM import_row_failures
        WHERE job_id = ?
        ORDER BY row_number
        "#,
    )
    .bind(job_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let entity_type: Option<String> = row.get("entity_type");
            let entity_type = entity_type
                .map(|s| s.parse::<EntityType>())
                .transpose()
                .map_err(Error::Internal)?;
            let category: String = row.get("category");
            let reasons: String = row.get("reasons");

            Ok(RowFailure {
                row: row.get::<i64, _>("row_number") as usize,
                entity_type,
                category: category.parse().map_err(Error::Internal)?,
                reasons: serde_json::from_str(&reasons)?,
            })
        })
        .collect()
}
