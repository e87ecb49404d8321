//! HTTP handlers. Every handler receives the shared [`WorkerService`].

pub mod admin_api;
pub mod queue_api;
pub mod session_api;
pub mod stream_api;

use std::sync::Arc;

use crate::worker::WorkerService;

pub type AppState = Arc<WorkerService>;
