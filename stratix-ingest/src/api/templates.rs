//! Template endpoints: column schema as JSON or as a CSV header row

use axum::{
    extract::Path,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use crate::error::{ApiError, ApiResult};
use crate::models::ImportTarget;
use crate::services::template::{self, Template};
use crate::AppState;

fn target(raw: &str) -> ApiResult<ImportTarget> {
    raw.parse().map_err(ApiError::NotFound)
}

/// GET /templates/:entity_type
pub async fn get_template(Path(entity_type): Path<String>) -> ApiResult<Json<Template>> {
    Ok(Json(template::template_for(target(&entity_type)?)))
}

/// GET /templates/:entity_type/csv
pub async fn get_csv_template(Path(entity_type): Path<String>) -> ApiResult<impl IntoResponse> {
    let target = target(&entity_type)?;
    let csv = template::csv_template(target)
        .map_err(|e| ApiError::Internal(format!("could not render template: {}", e)))?;
    let disposition = format!("attachment; filename=\"{}_template.csv\"", target);

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        csv,
    ))
}

/// Build template routes
pub fn template_routes() -> Router<AppState> {
    Router::new()
        .route("/templates/:entity_type", get(get_template))
        .route("/templates/:entity_type/csv", get(get_csv_template))
}
