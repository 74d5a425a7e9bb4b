//! Import job API handlers
//!
//! POST /imports/upload, POST /imports, GET /imports, GET /imports/:job_id,
//! POST /imports/:job_id/cancel, GET /imports/:job_id/summary

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use super::progress::job_event_stream;
use super::tenant::TenantContext;
use crate::error::{ApiError, ApiResult};
use crate::models::{ImportJob, ImportTarget, JobSummary};
use crate::AppState;

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 200;

/// POST /imports/upload query
#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub entity_type: String,
    pub file_name: Option<String>,
}

/// POST /imports request
#[derive(Debug, Deserialize)]
pub struct ReferenceImportRequest {
    pub entity_type: String,
    pub source_key: String,
    pub file_name: Option<String>,
}

/// GET /imports query
#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<u32>,
}

fn parse_target(raw: &str) -> ApiResult<ImportTarget> {
    raw.parse().map_err(ApiError::BadRequest)
}

/// POST /imports/upload?entity_type=&file_name=
///
/// Raw request body is the spreadsheet. Returns 202 with the queued job.
pub async fn upload(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ImportJob>)> {
    let target = parse_target(&params.entity_type)?;
    let file_name = params
        .file_name
        .unwrap_or_else(|| format!("{}.csv", target));

    let job = state
        .imports
        .submit_upload(tenant.tenant_id, tenant.user_id, target, &file_name, &body)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// POST /imports
///
/// Import a file already in object storage.
pub async fn import_by_reference(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(request): Json<ReferenceImportRequest>,
) -> ApiResult<(StatusCode, Json<ImportJob>)> {
    let target = parse_target(&request.entity_type)?;
    let job = state
        .imports
        .submit_reference(
            tenant.tenant_id,
            tenant.user_id,
            target,
            &request.source_key,
            request.file_name.as_deref(),
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// GET /imports?limit=
pub async fn list_imports(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<ImportJob>>> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    Ok(Json(state.imports.list(tenant.tenant_id, limit).await?))
}

/// GET /imports/:job_id
pub async fn get_import(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<ImportJob>> {
    Ok(Json(state.imports.job(tenant.tenant_id, job_id).await?))
}

/// POST /imports/:job_id/cancel
///
/// 202: cancellation takes effect at the job's next batch boundary.
pub async fn cancel_import(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(job_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<ImportJob>)> {
    let job = state.imports.cancel(tenant.tenant_id, job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// GET /imports/:job_id/summary
///
/// 409 until the job reaches a terminal state.
pub async fn get_summary(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobSummary>> {
    Ok(Json(state.imports.summary(tenant.tenant_id, job_id).await?))
}

/// Build import routes
pub fn import_routes() -> Router<AppState> {
    Router::new()
        .route("/imports", post(import_by_reference).get(list_imports))
        .route("/imports/upload", post(upload))
        .route("/imports/:job_id", get(get_import))
        .route("/imports/:job_id/cancel", post(cancel_import))
        .route("/imports/:job_id/events", get(job_event_stream))
        .route("/imports/:job_id/summary", get(get_summary))
}
