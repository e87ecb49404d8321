//! Server-sent event stream of worker events.
//!
//! A new subscriber first receives the sticky envelopes (startup warnings),
//! then live events (starting with a fresh `processing_status`) in timestamp order.

use async_stream::stream;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::Stream;
use std::convert::Infallible;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use super::AppState;
use crate::events::EventEnvelope;

fn to_sse(envelope: &EventEnvelope) -> Option<Event> {
    match serde_json::to_string(envelope) {
        Ok(json) => Some(Event::default().event(envelope.event.name()).data(json)),
        Err(e) => {
            error!("Failed to serialize worker event: {}", e);
            None
        }
    }
}

/// GET /stream
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (replay, mut rx) = state.subscribe_with_replay();
    let stopping = state.shutdown_token();
    // goes through the bus so it is stamped and ordered like everything else
    state.publish_processing_status();
    debug!("SSE subscriber connected");

    let stream = stream! {
        for envelope in &replay {
            if let Some(event) = to_sse(envelope) {
                yield Ok(event);
            }
        }
        loop {
            let received = tokio::select! {
                received = rx.recv() => received,
                _ = stopping.cancelled() => break,
            };
            match received {
                Ok(envelope) => {
                    if let Some(event) = to_sse(&envelope) {
                        yield Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("SSE subscriber lagged (skipped {} events)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
