//! Session lifecycle and enqueue endpoints used by the host hooks.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use super::AppState;
use crate::session::ActiveSessionInfo;
use crate::worker::{EnqueueOutcome, ObservationInput, SessionInit};

#[derive(Debug, Deserialize)]
pub struct InitSessionRequest {
    #[serde(alias = "contentSessionId")]
    pub content_session_id: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Deserialize)]
pub struct ObservationRequest {
    #[serde(alias = "contentSessionId")]
    pub content_session_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default)]
    pub tool_response: Value,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SummarizeRequest {
    #[serde(alias = "contentSessionId")]
    pub content_session_id: String,
    #[serde(default)]
    pub last_assistant_message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CloseStaleRequest {
    pub threshold_ms: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ActiveSessionsResponse {
    pub sessions: Vec<ActiveSessionInfo>,
    pub stale_count: usize,
}

#[derive(Debug, Serialize)]
pub struct CloseResponse {
    pub session_db_id: i64,
    pub closed: bool,
}

#[derive(Debug, Serialize)]
pub struct CloseStaleResponse {
    pub closed: Vec<i64>,
}

/// Tool inputs and outputs arrive as arbitrary JSON; strings are kept
/// verbatim, everything else is stored as compact JSON text.
fn flatten_value(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn internal_error(context: &str, e: anyhow::Error) -> Response {
    error!("{}: {:#}", context, e);
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{}: {}", context, e)).into_response()
}

/// POST /api/sessions/init
pub async fn init_session(
    State(state): State<AppState>,
    Json(req): Json<InitSessionRequest>,
) -> Result<Json<SessionInit>, Response> {
    if req.content_session_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "content_session_id is required").into_response());
    }
    state
        .init_session(&req.content_session_id, &req.project, &req.prompt)
        .map(Json)
        .map_err(|e| internal_error("Failed to initialize session", e))
}

/// POST /api/sessions/observations
pub async fn enqueue_observation(
    State(state): State<AppState>,
    Json(req): Json<ObservationRequest>,
) -> Result<Json<EnqueueOutcome>, Response> {
    if req.content_session_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "content_session_id is required").into_response());
    }
    debug!(tool = %req.tool_name, "Observation received");
    let input = ObservationInput {
        tool_name: req.tool_name,
        tool_input: flatten_value(req.tool_input),
        tool_response: flatten_value(req.tool_response),
        cwd: req.cwd,
    };
    state
        .enqueue_observation(&req.content_session_id, input)
        .map(Json)
        .map_err(|e| internal_error("Failed to enqueue observation", e))
}

/// POST /api/sessions/summarize
pub async fn enqueue_summarize(
    State(state): State<AppState>,
    Json(req): Json<SummarizeRequest>,
) -> Result<Json<EnqueueOutcome>, Response> {
    if req.content_session_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "content_session_id is required").into_response());
    }
    state
        .enqueue_summarize(&req.content_session_id, &req.last_assistant_message)
        .map(Json)
        .map_err(|e| internal_error("Failed to enqueue summary", e))
}

/// GET /api/sessions/active
pub async fn active_sessions(
    State(state): State<AppState>,
) -> Result<Json<ActiveSessionsResponse>, Response> {
    let sessions = state
        .get_active_sessions()
        .map_err(|e| internal_error("Failed to list sessions", e))?;
    let stale_count = sessions.iter().filter(|s| s.is_stale).count();
    Ok(Json(ActiveSessionsResponse {
        sessions,
        stale_count,
    }))
}

/// POST /api/sessions/:id/close
pub async fn close_session(
    State(state): State<AppState>,
    Path(session_db_id): Path<i64>,
) -> Result<Json<CloseResponse>, Response> {
    let closed = state
        .close_session(session_db_id)
        .map_err(|e| internal_error("Failed to close session", e))?;
    Ok(Json(CloseResponse {
        session_db_id,
        closed,
    }))
}

/// POST /api/sessions/close-stale
pub async fn close_stale_sessions(
    State(state): State<AppState>,
    body: Option<Json<CloseStaleRequest>>,
) -> Result<Json<CloseStaleResponse>, Response> {
    let threshold_ms = body.and_then(|Json(b)| b.threshold_ms);
    let closed = state
        .close_stale_sessions(threshold_ms)
        .map_err(|e| internal_error("Failed to close stale sessions", e))?;
    Ok(Json(CloseStaleResponse { closed }))
}
