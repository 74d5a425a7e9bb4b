//! Health check endpoints
//!
//! Both endpoints probe the relational store and object storage live; a
//! dependency is only reported reachable after it answered.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::models::HealthSnapshot;
use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Module name ("stratix-ingest")
    pub module: &'static str,
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub build_profile: &'static str,
    pub uptime_seconds: u64,
    #[serde(flatten)]
    pub snapshot: HealthSnapshot,
}

async fn probe(state: &AppState) -> HealthResponse {
    let snapshot = state.health.probe_all().await;
    let uptime = Utc::now().signed_duration_since(state.startup_time);

    HealthResponse {
        module: "stratix-ingest",
        version: env!("CARGO_PKG_VERSION"),
        git_hash: env!("GIT_HASH"),
        build_timestamp: env!("BUILD_TIMESTAMP"),
        build_profile: env!("BUILD_PROFILE"),
        uptime_seconds: uptime.num_seconds().max(0) as u64,
        snapshot,
    }
}

/// GET /health
///
/// Always 200 so monitoring can read the details; see `status`.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(probe(&state).await)
}

/// GET /health/ready
///
/// 503 while any dependency is unreachable or its circuit is open.
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let response = probe(&state).await;
    let status = if response.snapshot.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness))
}
