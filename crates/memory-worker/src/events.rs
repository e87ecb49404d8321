//! Worker event bus.
//!
//! Every envelope carries a server timestamp in epoch milliseconds that is
//! strictly greater than the previous one, even when the wall clock stalls or
//! steps backwards. Timestamp assignment and send happen under one lock so a
//! subscriber always sees envelopes in timestamp order.

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::memory_db::{now_epoch_ms, StoredObservation, StoredSummary};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    NewObservation {
        observation: StoredObservation,
    },
    NewSummary {
        summary: StoredSummary,
    },
    ProcessingStatus {
        is_processing: bool,
        queue_depth: i64,
        stuck_count: i64,
        active_sessions: usize,
    },
    SessionCompleted {
        session_db_id: i64,
        content_session_id: String,
    },
    CloudStorageWarning {
        provider: String,
        path: String,
        message: String,
    },
}

impl WorkerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerEvent::NewObservation { .. } => "new_observation",
            WorkerEvent::NewSummary { .. } => "new_summary",
            WorkerEvent::ProcessingStatus { .. } => "processing_status",
            WorkerEvent::SessionCompleted { .. } => "session_completed",
            WorkerEvent::CloudStorageWarning { .. } => "cloud_storage_warning",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub timestamp: i64,
    #[serde(flatten)]
    pub event: WorkerEvent,
}

struct BusState {
    last_timestamp: i64,
    /// Replayed to every new subscriber.
    sticky: Vec<EventEnvelope>,
}

pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            state: Mutex::new(BusState {
                last_timestamp: 0,
                sticky: Vec::new(),
            }),
        }
    }

    pub fn publish(&self, event: WorkerEvent) -> EventEnvelope {
        let mut state = self.state.lock();
        let envelope = Self::stamp(&mut state, event);
        // no subscribers is fine
        let _ = self.sender.send(envelope.clone());
        envelope
    }

    /// Publish and keep the envelope for replay to later subscribers.
    pub fn publish_sticky(&self, event: WorkerEvent) -> EventEnvelope {
        let mut state = self.state.lock();
        let envelope = Self::stamp(&mut state, event);
        state.sticky.push(envelope.clone());
        let _ = self.sender.send(envelope.clone());
        envelope
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Sticky envelopes published so far plus a receiver for everything after.
    pub fn subscribe_with_replay(&self) -> (Vec<EventEnvelope>, broadcast::Receiver<EventEnvelope>) {
        let state = self.state.lock();
        (state.sticky.clone(), self.sender.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn stamp(state: &mut BusState, event: WorkerEvent) -> EventEnvelope {
        let timestamp = now_epoch_ms().max(state.last_timestamp + 1);
        state.last_timestamp = timestamp;
        EventEnvelope { timestamp, event }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
