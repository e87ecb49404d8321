//! Operator views over the durable queue.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::AppState;
use crate::pipeline::PipelineError;
use crate::worker::QueueOverview;

#[derive(Debug, Deserialize)]
pub struct QueueQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub item_id: i64,
    pub retried: bool,
}

#[derive(Debug, Serialize)]
pub struct ClearFailedResponse {
    pub cleared: usize,
}

#[derive(Debug, Serialize)]
pub struct ReprocessResponse {
    pub raw_response_id: i64,
    pub execution_id: String,
    pub observations: usize,
    pub summary: bool,
    pub vector_error: Option<String>,
}

/// GET /api/queue
pub async fn queue_overview(
    State(state): State<AppState>,
    Query(query): Query<QueueQuery>,
) -> Result<Json<QueueOverview>, Response> {
    state.queue_overview(query.limit.min(1000)).map(Json).map_err(|e| {
        error!("Failed to read queue: {:#}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("Database error: {}", e)).into_response()
    })
}

/// POST /api/queue/:id/retry
pub async fn retry_item(
    State(state): State<AppState>,
    Path(item_id): Path<i64>,
) -> Result<Json<RetryResponse>, Response> {
    let retried = state.retry_queue_item(item_id).map_err(|e| {
        error!("Failed to retry queue item {}: {:#}", item_id, e);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("Database error: {}", e)).into_response()
    })?;
    if !retried {
        return Err((StatusCode::NOT_FOUND, "No failed queue item with that id").into_response());
    }
    info!(item_id, "Queue item retried by operator");
    Ok(Json(RetryResponse { item_id, retried }))
}

/// POST /api/queue/clear-failed
pub async fn clear_failed(State(state): State<AppState>) -> Result<Json<ClearFailedResponse>, Response> {
    state
        .clear_failed_items()
        .map(|cleared| Json(ClearFailedResponse { cleared }))
        .map_err(|e| {
            error!("Failed to clear failed items: {:#}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Database error: {}", e)).into_response()
        })
}

/// POST /api/raw-responses/:id/reprocess
pub async fn reprocess_raw_response(
    State(state): State<AppState>,
    Path(raw_response_id): Path<i64>,
) -> Result<Json<ReprocessResponse>, Response> {
    match state.reprocess_raw_response(raw_response_id).await {
        Ok(outcome) => Ok(Json(ReprocessResponse {
            raw_response_id,
            execution_id: outcome.execution.id,
            observations: outcome.stored.observations.len(),
            summary: outcome.stored.summary.is_some(),
            vector_error: outcome.vector_error,
        })),
        Err(e @ PipelineError::Contract { .. }) => {
            Err((StatusCode::NOT_FOUND, e.to_string()).into_response())
        }
        Err(e) => {
            error!("Reprocessing raw response {} failed: {}", raw_response_id, e);
            Err((StatusCode::UNPROCESSABLE_ENTITY, e.to_string()).into_response())
        }
    }
}
