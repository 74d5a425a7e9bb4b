//! Server-Sent Events for one job's progress
//!
//! The stream opens with the latest snapshot, then forwards every update
//! and ends after the terminal one. A client that falls behind skips the
//! snapshots it missed; the next one it gets is current.

use axum::{
    extract::{Path, State},
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;
use stratix_common::sse::{json_event, keep_alive};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};
use uuid::Uuid;

use super::tenant::TenantContext;
use crate::error::ApiResult;
use crate::AppState;

const PROGRESS_EVENT: &str = "JobProgress";

/// GET /imports/:job_id/events
pub async fn job_event_stream(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let (initial, receiver) = state.imports.subscribe(tenant.tenant_id, job_id).await?;
    info!(job_id = %job_id, phase = %initial.phase, "SSE client subscribed to job progress");

    let stream = async_stream::stream! {
        if let Some(event) = json_event(PROGRESS_EVENT, &initial) {
            yield Ok(event);
        }

        if let Some(mut rx) = receiver.filter(|_| !initial.is_terminal()) {
            loop {
                match rx.recv().await {
                    Ok(progress) => {
                        let terminal = progress.is_terminal();
                        if let Some(event) = json_event(PROGRESS_EVENT, &progress) {
                            yield Ok(event);
                        }
                        if terminal {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(job_id = %job_id, skipped, "SSE: progress subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
        debug!(job_id = %job_id, "SSE: progress stream ended");
    };

    Ok(Sse::new(stream).keep_alive(keep_alive()))
}
