//! Session lifecycle: registry, resume decision and per-session consumers.

pub mod consumer;
pub mod registry;
pub mod resume;

pub use consumer::{claim_stream, ConsumerContext, SessionConsumer, Settled};
pub use registry::{ActiveSession, ActiveSessionInfo, HistoryEntry, HistoryRole, Registered, SessionRegistry};
pub use resume::should_resume;
