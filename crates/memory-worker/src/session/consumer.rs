//! Per-session queue consumer.
//!
//! [`claim_stream`] turns the durable queue into a stream of claimed items
//! for one session. [`SessionConsumer`] drives that stream through the
//! pipeline and settles each item.

use async_stream::stream;
use futures_util::{pin_mut, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::{ActiveSession, HistoryRole, SessionRegistry};
use crate::events::{EventBus, WorkerEvent};
use crate::memory_db::queue_store::FailureOutcome;
use crate::memory_db::{MemoryDatabase, QueueItem, QueuePayload};
use crate::pipeline::{Pipeline, PipelineError};
use crate::query::QueryError;

/// Yields claimed items for `session` until its token is cancelled.
///
/// An empty queue parks the stream on the session's wake signal. A store
/// error is logged and retried after `backoff`.
pub fn claim_stream(
    db: Arc<MemoryDatabase>,
    session: Arc<ActiveSession>,
    backoff: Duration,
) -> impl Stream<Item = QueueItem> {
    stream! {
        let cancel = session.cancel_token().clone();
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match db.queue.claim_next(session.session_db_id) {
                Ok(Some(item)) => {
                    session.mark_claimed(item.id);
                    yield item;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = session.notified() => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                Err(e) => {
                    warn!(
                        session_db_id = session.session_db_id,
                        "Claim failed, retrying in {:?}: {:#}", backoff, e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }
        debug!(session_db_id = session.session_db_id, "Claim stream ended");
    }
}

/// Everything a consumer needs besides its session.
pub struct ConsumerContext {
    pub db: Arc<MemoryDatabase>,
    pub registry: Arc<SessionRegistry>,
    pub pipeline: Arc<Pipeline>,
    pub events: Arc<EventBus>,
    pub max_retries: i32,
    pub error_backoff: Duration,
    pub stuck_threshold_ms: i64,
}

impl ConsumerContext {
    /// Current queue state as a `processing_status` event.
    pub fn processing_status(&self) -> anyhow::Result<WorkerEvent> {
        let queue_depth = self.db.queue.count()?;
        let stuck_count = self.db.queue.stuck_count(self.stuck_threshold_ms)?;
        Ok(WorkerEvent::ProcessingStatus {
            is_processing: queue_depth > 0,
            queue_depth,
            stuck_count,
            active_sessions: self.registry.active_count(),
        })
    }

    pub fn publish_status(&self) {
        match self.processing_status() {
            Ok(event) => {
                self.events.publish(event);
            }
            Err(e) => warn!("Failed to read queue status: {:#}", e),
        }
    }
}

pub struct SessionConsumer {
    ctx: Arc<ConsumerContext>,
    session: Arc<ActiveSession>,
}

/// How a single claimed item was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Completed,
    Dropped,
    Requeued,
    Failed,
    /// The session closed under the item; it was abandoned with the rest.
    Interrupted,
}

impl SessionConsumer {
    pub fn new(ctx: Arc<ConsumerContext>, session: Arc<ActiveSession>) -> Self {
        Self { ctx, session }
    }

    pub async fn run(self) {
        let id = self.session.session_db_id;
        info!(session_db_id = id, "Consumer started");
        let items = claim_stream(
            Arc::clone(&self.ctx.db),
            Arc::clone(&self.session),
            self.ctx.error_backoff,
        );
        pin_mut!(items);

        while let Some(item) = items.next().await {
            let settled = self.handle(&item).await;
            self.session.clear_claimed(item.id);
            self.ctx.publish_status();

            if matches!(settled, Settled::Requeued | Settled::Failed) {
                // let a flaky model or network settle before the next claim
                if !sleep_or_cancel(self.ctx.error_backoff, self.session.cancel_token()).await {
                    break;
                }
            }
        }
        info!(session_db_id = id, "Consumer stopped");
    }

    async fn handle(&self, item: &QueueItem) -> Settled {
        if let QueuePayload::Summarize {
            last_assistant_message,
        } = &item.payload
        {
            if !last_assistant_message.is_empty() {
                self.session
                    .push_history(HistoryRole::Assistant, last_assistant_message);
            }
        }

        let turn = self.session.turn_context();
        let result = self
            .ctx
            .pipeline
            .run(item, &turn, self.session.cancel_token())
            .await;

        match result {
            Ok(outcome) => {
                if let Some(model_id) = &outcome.model_session_id {
                    if let Err(e) = self
                        .ctx
                        .registry
                        .record_model_session_id(item.session_db_id, model_id)
                    {
                        warn!(item_id = item.id, "Failed to record model session id: {:#}", e);
                    }
                }
                if let Some(reason) = &outcome.skip_reason {
                    debug!(item_id = item.id, "Model skipped output: {}", reason);
                }
                Settled::Completed
            }
            Err(e) if e.is_contract_violation() => {
                error!(item_id = item.id, "Dropping queue item: {}", e);
                if let Err(e) = self.ctx.db.queue.remove(item.id) {
                    warn!(item_id = item.id, "Failed to drop queue item: {:#}", e);
                }
                Settled::Dropped
            }
            Err(PipelineError::Subprocess(QueryError::Killed)) if self.session.is_closed() => {
                info!(item_id = item.id, "Session closed during processing");
                // close already parked the item unless it was claimed in the race
                if let Err(e) = self.ctx.db.queue.abandon_session(item.session_db_id) {
                    warn!(item_id = item.id, "Failed to abandon queue item: {:#}", e);
                }
                Settled::Interrupted
            }
            Err(e) => {
                warn!(item_id = item.id, kind = e.kind(), "Pipeline failed: {}", e);
                match self.ctx.db.queue.mark_failed(item.id, self.ctx.max_retries) {
                    Ok(FailureOutcome::Requeued { retry_count }) => {
                        debug!(item_id = item.id, retry_count, "Queue item requeued");
                        Settled::Requeued
                    }
                    Ok(FailureOutcome::Failed) => {
                        error!(item_id = item.id, "Queue item out of retries");
                        Settled::Failed
                    }
                    Ok(FailureOutcome::Missing) => Settled::Dropped,
                    Err(e) => {
                        warn!(item_id = item.id, "Failed to settle queue item: {:#}", e);
                        Settled::Failed
                    }
                }
            }
        }
    }
}

/// Returns false when cancelled first.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::registry::Registered;

    fn setup() -> (Arc<MemoryDatabase>, Arc<SessionRegistry>, Arc<ActiveSession>) {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&db),
            Arc::new(EventBus::default()),
            10,
            3_600_000,
        ));
        let session = match registry.get_or_create("ext-1", "p", "hi").unwrap() {
            Registered::Active { session, .. } => session,
            Registered::Closed { .. } => unreachable!(),
        };
        (db, registry, session)
    }

    fn summarize(text: &str) -> QueuePayload {
        QueuePayload::Summarize {
            last_assistant_message: text.into(),
        }
    }

    #[tokio::test]
    async fn test_stream_yields_in_fifo_order() {
        let (db, _registry, session) = setup();
        let id = session.session_db_id;
        for text in ["a", "b", "c"] {
            db.queue.enqueue(id, "ext-1", 1, &summarize(text)).unwrap();
        }

        let items = claim_stream(Arc::clone(&db), Arc::clone(&session), Duration::from_millis(10));
        pin_mut!(items);
        let mut seen = Vec::new();
        for _ in 0..3 {
            let item = items.next().await.unwrap();
            if let QueuePayload::Summarize {
                last_assistant_message,
            } = &item.payload
            {
                seen.push(last_assistant_message.clone());
            }
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert_eq!(session.claimed_items().len(), 3);
    }

    #[tokio::test]
    async fn test_stream_waits_for_wake() {
        let (db, _registry, session) = setup();
        let id = session.session_db_id;
        let items = claim_stream(Arc::clone(&db), Arc::clone(&session), Duration::from_millis(10));
        pin_mut!(items);

        let nothing = tokio::time::timeout(Duration::from_millis(50), items.next()).await;
        assert!(nothing.is_err());

        db.queue.enqueue(id, "ext-1", 1, &summarize("late")).unwrap();
        session.wake();
        let item = tokio::time::timeout(Duration::from_secs(2), items.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.session_db_id, id);
    }

    #[tokio::test]
    async fn test_wake_before_wait_is_not_lost() {
        let (db, _registry, session) = setup();
        let items = claim_stream(Arc::clone(&db), Arc::clone(&session), Duration::from_millis(10));
        pin_mut!(items);

        // the permit is stored until the stream starts waiting
        db.queue
            .enqueue(session.session_db_id, "ext-1", 1, &summarize("x"))
            .unwrap();
        session.wake();
        let item = tokio::time::timeout(Duration::from_secs(2), items.next()).await;
        assert!(matches!(item, Ok(Some(_))));
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let (db, registry, session) = setup();
        let items = claim_stream(Arc::clone(&db), Arc::clone(&session), Duration::from_millis(10));
        pin_mut!(items);

        let closer = {
            let registry = Arc::clone(&registry);
            let id = session.session_db_id;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                registry.close(id).unwrap();
            })
        };
        let end = tokio::time::timeout(Duration::from_secs(2), items.next())
            .await
            .unwrap();
        assert!(end.is_none());
        closer.await.unwrap();
    }
}
