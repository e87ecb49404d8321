//! Health, readiness and metrics endpoints.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use super::AppState;
use crate::metrics;
use crate::query::ActiveQueryInfo;
use crate::worker::HealthReport;

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub pid: u32,
}

/// GET /api/readiness
///
/// Polled by a second launcher that lost the spawn lock race; a 200 means
/// the database answers and requests can be sent.
pub async fn readiness(State(state): State<AppState>) -> Response {
    match state.database().ping() {
        Ok(()) => (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready",
                pid: std::process::id(),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Database not ready: {}", e),
        )
            .into_response(),
    }
}

/// GET /api/health
pub async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.health())
}

/// GET /api/queries
pub async fn active_queries(State(state): State<AppState>) -> Json<Vec<ActiveQueryInfo>> {
    Json(state.active_queries())
}

/// GET /metrics
pub async fn prometheus_metrics() -> Response {
    match metrics::gather_text() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("Metrics error: {}", e)).into_response(),
    }
}
