//! Database access for stratix-ingest
//!
//! One SQLite database holds the job ledger, per-row failure reports and the
//! tenant-scoped business tables the import writes into.

pub mod entities;
pub mod jobs;
pub mod outcomes;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use stratix_common::{Error, Result};
use uuid::Uuid;

/// Open (creating if needed) the database and ensure every table exists
///
/// `database` is either a `sqlite:` URL or a filesystem path.
pub async fn init_database_pool(database: &str, max_connections: u32) -> Result<SqlitePool> {
    let base = if database.starts_with("sqlite:") {
        SqliteConnectOptions::from_str(database)?
    } else {
        let path = Path::new(database);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        SqliteConnectOptions::new().filename(path)
    };
    let options = base
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    tracing::debug!(database, max_connections, "Connecting to database");

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Create stratix-ingest tables if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS import_jobs (
            job_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            submitted_by TEXT NOT NULL,
            target TEXT NOT NULL,
            source_key TEXT NOT NULL,
            file_name TEXT NOT NULL,
            source_sha256 TEXT,
            status TEXT NOT NULL,
            total_rows INTEGER NOT NULL DEFAULT 0,
            processed_rows INTEGER NOT NULL DEFAULT 0,
            write_failed_rows INTEGER NOT NULL DEFAULT 0,
            validation_failed_rows INTEGER NOT NULL DEFAULT 0,
            batches_total INTEGER NOT NULL DEFAULT 0,
            batches_completed INTEGER NOT NULL DEFAULT 0,
            warnings TEXT NOT NULL DEFAULT '[]',
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            finished_at TEXT
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_import_jobs_tenant ON import_jobs (tenant_id, created_at)",
        r#"
        CREATE TABLE IF NOT EXISTS import_row_failures (
            job_id TEXT NOT NULL REFERENCES import_jobs(job_id) ON DELETE CASCADE,
            row_number INTEGER NOT NULL,
            entity_type TEXT,
            category TEXT NOT NULL CHECK (category IN ('validation', 'write')),
            reasons TEXT NOT NULL,
            PRIMARY KEY (job_id, row_number)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS areas (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            natural_key TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (tenant_id, natural_key)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            natural_key TEXT NOT NULL,
            email TEXT NOT NULL,
            full_name TEXT NOT NULL,
            role TEXT NOT NULL CHECK (role IN ('ceo', 'admin', 'manager', 'member')),
            area_id TEXT REFERENCES areas(id),
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (tenant_id, natural_key)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS objectives (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            natural_key TEXT NOT NULL,
            title TEXT NOT NULL,
            area_id TEXT NOT NULL REFERENCES areas(id),
            description TEXT,
            quarter TEXT,
            target_date TEXT,
            progress REAL CHECK (progress BETWEEN 0 AND 100),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (tenant_id, natural_key)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS initiatives (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            natural_key TEXT NOT NULL,
            title TEXT NOT NULL,
            area_id TEXT NOT NULL REFERENCES areas(id),
            objective_id TEXT REFERENCES objectives(id),
            owner_id TEXT REFERENCES users(id),
            description TEXT,
            status TEXT NOT NULL DEFAULT 'planning'
                CHECK (status IN ('planning', 'in_progress', 'completed', 'on_hold')),
            progress REAL NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
            start_date TEXT,
            due_date TEXT,
            budget REAL CHECK (budget >= 0),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (tenant_id, natural_key)
        )
        "#,
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    tracing::info!(
        "Database tables initialized (import_jobs, import_row_failures, areas, users, objectives, initiatives)"
    );

    Ok(())
}

pub(crate) fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

pub(crate) fn parse_uuid(column: &str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("stratix.db");
        let database = path.to_string_lossy().to_string();

        let pool = init_database_pool(&database, 2).await.unwrap();
        init_tables(&pool).await.unwrap();

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
             AND name IN ('import_jobs', 'import_row_failures', 'areas', 'users', 'objectives', 'initiatives')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 6);
    }

    #[tokio::test]
    async fn test_foreign_keys_enforced() {
        let dir = TempDir::new().unwrap();
        let database = dir.path().join("fk.db").to_string_lossy().to_string();
        let pool = init_database_pool(&database, 1).await.unwrap();

        let result = sqlx::query(
            "INSERT INTO objectives (id, tenant_id, natural_key, title, area_id, created_at, updated_at) \
             VALUES ('o1', 't1', 'grow', 'Grow', 'no-such-area', 'now', 'now')",
        )
        .execute(&pool)
        .await;
        assert!(result.is_err());
    }
}
