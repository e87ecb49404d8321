//! Local memory worker: queues agent tool-use events, compresses them into
//! observations through a supervised model subprocess and serves them back.

pub mod config;
pub mod events;
pub mod memory_db;
pub mod metrics;
pub mod pipeline;
pub mod query;
pub mod session;
pub mod spawn_lock;
pub mod telemetry;
pub mod vector_sync;
pub mod worker;

#[cfg(feature = "cli")]
pub mod api;
#[cfg(feature = "cli")]
pub mod server;

pub use config::Config;
pub use events::{EventBus, EventEnvelope, WorkerEvent};
pub use memory_db::MemoryDatabase;
pub use pipeline::{Pipeline, PipelineError};
pub use worker::{EnqueueOutcome, ObservationInput, WorkerService};

#[cfg(feature = "cli")]
pub use server::run_server;
