//! Tenant-scoped lookups on the business tables

use sqlx::{Row, SqliteConnection, SqlitePool};
use stratix_common::Result;
use uuid::Uuid;

use super::parse_uuid;
use crate::models::EntityType;
use crate::services::parser::ReferenceIndex;

/// Natural keys already stored for `tenant_id`, for every type in `entities`
pub async fn load_reference_index(
    pool: &SqlitePool,
    tenant_id: Uuid,
    entities: &[EntityType],
) -> Result<ReferenceIndex> {
    let mut index = ReferenceIndex::new();
    for &entity in entities {
        let rows = sqlx::query(&format!(
            "SELECT id, natural_key FROM {} WHERE tenant_id = ?",
            entity.table()
        ))
        .bind(tenant_id.to_string())
        .fetch_all(pool)
        .await?;

        for row in rows {
            let id = parse_uuid("id", row.get("id"))?;
            let key: String = row.get("natural_key");
            index.insert(entity, &key, id);
        }
    }

    tracing::debug!(tenant_id = %tenant_id, keys = index.len(), "Loaded reference index");
    Ok(index)
}

/// Id of a tenant's row by natural key, inside an open transaction
pub async fn find_id(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    entity: EntityType,
    natural_key: &str,
) -> std::result::Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar(&format!(
        "SELECT id FROM {} WHERE tenant_id = ? AND natural_key = ?",
        entity.table()
    ))
    .bind(tenant_id.to_string())
    .bind(natural_key)
    .fetch_optional(conn)
    .await
}

/// Number of stored rows of one type for a tenant
pub async fn count(pool: &SqlitePool, tenant_id: Uuid, entity: EntityType) -> Result<u64> {
    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {} WHERE tenant_id = ?",
        entity.table()
    ))
    .bind(tenant_id.to_string())
    .fetch_one(pool)
    .await?;
    Ok(count as u64)
}
