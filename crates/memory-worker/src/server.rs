//! HTTP server startup and routing.
//!
//! All handlers share one [`WorkerService`] through an `Arc`; no component
//! sits behind a network hop except the model subprocess and the optional
//! Chroma server.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::api::{admin_api, queue_api, session_api, stream_api, AppState};
use crate::config::Config;
use crate::memory_db::MemoryDatabase;
use crate::worker::WorkerService;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Open the database, start the worker and serve until ctrl-c or SIGTERM.
pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    cfg.print_config();
    std::fs::create_dir_all(&cfg.data_dir)?;

    let db = Arc::new(MemoryDatabase::new(&cfg.db_path)?);
    info!("Memory database initialized at: {}", cfg.db_path.display());

    let addr = cfg.api_addr()?;
    let worker = Arc::new(WorkerService::new(Arc::new(cfg), db));
    let report = worker.start()?;
    info!(
        reset_items = report.reset_items,
        rehydrated_sessions = report.rehydrated_sessions,
        "Worker started"
    );

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = build_router(Arc::clone(&worker));

    // cancelling the token first lets open event streams end
    let stopping = worker.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            stopping.cancel();
        })
        .await?;

    worker.shutdown().await;
    info!("Server stopped");
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    let api = Router::new()
        .route("/api/sessions/init", post(session_api::init_session))
        .route("/api/sessions/observations", post(session_api::enqueue_observation))
        .route("/api/sessions/summarize", post(session_api::enqueue_summarize))
        .route("/api/sessions/active", get(session_api::active_sessions))
        .route("/api/sessions/close-stale", post(session_api::close_stale_sessions))
        .route("/api/sessions/:id/close", post(session_api::close_session))
        .route("/api/queue", get(queue_api::queue_overview))
        .route("/api/queue/clear-failed", post(queue_api::clear_failed))
        .route("/api/queue/:id/retry", post(queue_api::retry_item))
        .route("/api/raw-responses/:id/reprocess", post(queue_api::reprocess_raw_response))
        .route("/api/readiness", get(admin_api::readiness))
        .route("/api/health", get(admin_api::health))
        .route("/api/queries", get(admin_api::active_queries))
        .route("/metrics", get(admin_api::prometheus_metrics))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES));

    // the event stream is long-lived and stays outside the timeout
    Router::new()
        .route("/stream", get(stream_api::event_stream))
        .merge(api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
