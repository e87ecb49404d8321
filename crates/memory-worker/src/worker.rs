//! Worker service: the one object the transport layer talks to.
//!
//! Owns the database, the event bus, the session registry, the pipeline and
//! the query controller. Enqueue calls return as soon as the item is durable;
//! the per-session consumers do the rest in the background.

use anyhow::Context;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::events::{EventBus, EventEnvelope, WorkerEvent};
use crate::memory_db::{DatabaseStats, MemoryDatabase, QueueItem, QueuePayload};
use crate::metrics;
use crate::pipeline::{
    ModelProcessor, ParseMetrics, Pipeline, PipelineError, PipelineOptions, PipelineOutcome,
    SubprocessProcessor,
};
use crate::query::{ActiveQueryInfo, QueryController};
use crate::session::{
    ActiveSession, ActiveSessionInfo, ConsumerContext, Registered, SessionConsumer, SessionRegistry,
};
use crate::vector_sync::VectorSyncService;

/// Raw tool-use event as reported by the host.
#[derive(Debug, Clone, Default)]
pub struct ObservationInput {
    pub tool_name: String,
    pub tool_input: String,
    pub tool_response: String,
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Accepted { item_id: i64 },
    Ignored { reason: String },
}

impl EnqueueOutcome {
    fn ignored(reason: impl Into<String>) -> Self {
        EnqueueOutcome::Ignored {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInit {
    pub session_db_id: i64,
    pub prompt_number: i64,
    /// The external id belongs to a closed session; nothing was started.
    pub skipped: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueOverview {
    pub items: Vec<QueueItem>,
    pub stats: DatabaseStats,
    pub stuck_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub database_ok: bool,
    pub active_sessions: usize,
    pub active_queries: usize,
    pub queue_depth: i64,
    pub vector_breaker: Option<String>,
    pub parse: ParseMetrics,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StartupReport {
    pub reset_items: usize,
    pub rehydrated_sessions: usize,
}

pub struct WorkerService {
    config: Arc<Config>,
    db: Arc<MemoryDatabase>,
    events: Arc<EventBus>,
    registry: Arc<SessionRegistry>,
    pipeline: Arc<Pipeline>,
    controller: Option<Arc<QueryController>>,
    vector: Option<Arc<VectorSyncService>>,
    consumer_ctx: Arc<ConsumerContext>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    started_at: Instant,
}

impl WorkerService {
    /// Production wiring: subprocess queries and Chroma sync per `config`.
    pub fn new(config: Arc<Config>, db: Arc<MemoryDatabase>) -> Self {
        let controller = Arc::new(QueryController::from_config(&config));
        let processor: Arc<dyn ModelProcessor> =
            Arc::new(SubprocessProcessor::new(Arc::clone(&controller)));
        let vector = VectorSyncService::from_config(&config).map(Arc::new);
        Self::assemble(config, db, processor, Some(controller), vector)
    }

    /// Wiring with a caller-supplied model processor and no subprocesses.
    pub fn with_processor(
        config: Arc<Config>,
        db: Arc<MemoryDatabase>,
        processor: Arc<dyn ModelProcessor>,
        vector: Option<Arc<VectorSyncService>>,
    ) -> Self {
        Self::assemble(config, db, processor, None, vector)
    }

    fn assemble(
        config: Arc<Config>,
        db: Arc<MemoryDatabase>,
        processor: Arc<dyn ModelProcessor>,
        controller: Option<Arc<QueryController>>,
        vector: Option<Arc<VectorSyncService>>,
    ) -> Self {
        let events = Arc::new(EventBus::default());
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&db),
            Arc::clone(&events),
            config.history_limit,
            config.stale_session_threshold_ms,
        ));
        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&db),
            processor,
            vector.clone(),
            Arc::clone(&events),
            PipelineOptions::from_config(&config),
        ));
        let consumer_ctx = Arc::new(ConsumerContext {
            db: Arc::clone(&db),
            registry: Arc::clone(&registry),
            pipeline: Arc::clone(&pipeline),
            events: Arc::clone(&events),
            max_retries: config.max_retries,
            error_backoff: config.consumer_error_backoff(),
            stuck_threshold_ms: config.stuck_item_threshold_ms,
        });

        Self {
            config,
            db,
            events,
            registry,
            pipeline,
            controller,
            vector,
            consumer_ctx,
            consumers: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Cancelled when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Recover from the previous run and start background tasks: items left
    /// in `processing` go back to pending, sessions with pending work get
    /// their consumers back, and the watchdog starts reporting.
    pub fn start(&self) -> anyhow::Result<StartupReport> {
        let reset_items = self
            .db
            .queue
            .reset_stale_processing(0)
            .context("Failed to reset in-flight queue items")?;
        if reset_items > 0 {
            info!("Reset {} queue item(s) left in processing", reset_items);
        }

        let rehydrated = self.registry.rehydrate()?;
        for session in &rehydrated {
            self.spawn_consumer(Arc::clone(session));
            session.wake();
        }

        if let Some(provider) = self.config.cloud_sync_provider() {
            warn!(
                "Data directory {} looks synced by {}",
                self.config.data_dir.display(),
                provider
            );
            self.events.publish_sticky(WorkerEvent::CloudStorageWarning {
                provider: provider.to_string(),
                path: self.config.data_dir.display().to_string(),
                message: format!(
                    "The data directory is inside a {} folder. Sync clients can corrupt SQLite files; move it to a local path.",
                    provider
                ),
            });
        }

        self.spawn_watchdog();

        Ok(StartupReport {
            reset_items,
            rehydrated_sessions: rehydrated.len(),
        })
    }

    /// A user prompt: create or continue the session and advance its turn.
    pub fn init_session(
        &self,
        content_session_id: &str,
        project: &str,
        prompt: &str,
    ) -> anyhow::Result<SessionInit> {
        let session = match self.open_session(content_session_id, project, prompt)? {
            Ok(session) => session,
            Err(session_db_id) => {
                debug!(session_db_id, "Prompt for a closed session ignored");
                return Ok(SessionInit {
                    session_db_id,
                    prompt_number: 0,
                    skipped: true,
                });
            }
        };
        let prompt_number = self.registry.begin_turn(session.session_db_id, prompt)?;
        Ok(SessionInit {
            session_db_id: session.session_db_id,
            prompt_number,
            skipped: false,
        })
    }

    pub fn enqueue_observation(
        &self,
        content_session_id: &str,
        input: ObservationInput,
    ) -> anyhow::Result<EnqueueOutcome> {
        if self.config.should_skip_tool(&input.tool_name) {
            debug!(tool = %input.tool_name, "Skipping tool");
            return Ok(EnqueueOutcome::ignored(format!(
                "tool {} is on the skip list",
                input.tool_name
            )));
        }
        let payload = QueuePayload::Observation {
            tool_name: input.tool_name,
            tool_input: input.tool_input,
            tool_response: input.tool_response,
            cwd: input.cwd,
        };
        self.enqueue(content_session_id, payload)
    }

    pub fn enqueue_summarize(
        &self,
        content_session_id: &str,
        last_assistant_message: &str,
    ) -> anyhow::Result<EnqueueOutcome> {
        let payload = QueuePayload::Summarize {
            last_assistant_message: last_assistant_message.to_string(),
        };
        self.enqueue(content_session_id, payload)
    }

    fn enqueue(&self, content_session_id: &str, payload: QueuePayload) -> anyhow::Result<EnqueueOutcome> {
        let session = match self.open_session(content_session_id, "", "")? {
            Ok(session) => session,
            Err(_) => return Ok(EnqueueOutcome::ignored("session is closed")),
        };
        let kind = payload.kind();
        let item_id = self.db.queue.enqueue(
            session.session_db_id,
            content_session_id,
            session.prompt_counter(),
            &payload,
        )?;
        metrics::inc_enqueued(kind.as_str());
        session.wake();
        Ok(EnqueueOutcome::Accepted { item_id })
    }

    /// `Err(session_db_id)` when the session exists but is closed.
    fn open_session(
        &self,
        content_session_id: &str,
        project: &str,
        prompt: &str,
    ) -> anyhow::Result<Result<Arc<ActiveSession>, i64>> {
        match self.registry.get_or_create(content_session_id, project, prompt)? {
            Registered::Active { session, started } => {
                if started {
                    self.spawn_consumer(Arc::clone(&session));
                }
                Ok(Ok(session))
            }
            Registered::Closed { session_db_id } => Ok(Err(session_db_id)),
        }
    }

    fn spawn_consumer(&self, session: Arc<ActiveSession>) {
        let consumer = SessionConsumer::new(Arc::clone(&self.consumer_ctx), session);
        let handle = tokio::spawn(consumer.run());
        let mut consumers = self.consumers.lock();
        consumers.retain(|h| !h.is_finished());
        consumers.push(handle);
    }

    fn spawn_watchdog(&self) {
        let ctx = Arc::clone(&self.consumer_ctx);
        let shutdown = self.shutdown.clone();
        let period = Duration::from_secs(self.config.watchdog_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => break,
                }
                match ctx.processing_status() {
                    Ok(event) => {
                        if let WorkerEvent::ProcessingStatus {
                            queue_depth,
                            stuck_count,
                            active_sessions,
                            ..
                        } = &event
                        {
                            metrics::set_queue_depth(*queue_depth);
                            metrics::set_active_sessions(*active_sessions as i64);
                            if *stuck_count > 0 {
                                warn!("{} queue item(s) stuck in processing", stuck_count);
                            }
                        }
                        ctx.events.publish(event);
                    }
                    Err(e) => warn!("Watchdog could not read queue state: {:#}", e),
                }
            }
            debug!("Watchdog stopped");
        });
    }

    pub fn get_active_sessions(&self) -> anyhow::Result<Vec<ActiveSessionInfo>> {
        self.registry.list_active()
    }

    pub fn close_session(&self, session_db_id: i64) -> anyhow::Result<bool> {
        self.registry.close(session_db_id)
    }

    /// Defaults to the configured stale threshold.
    pub fn close_stale_sessions(&self, threshold_ms: Option<i64>) -> anyhow::Result<Vec<i64>> {
        self.registry
            .close_stale(threshold_ms.unwrap_or(self.config.stale_session_threshold_ms))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    pub fn subscribe_with_replay(&self) -> (Vec<EventEnvelope>, broadcast::Receiver<EventEnvelope>) {
        self.events.subscribe_with_replay()
    }

    pub fn processing_status(&self) -> anyhow::Result<WorkerEvent> {
        self.consumer_ctx.processing_status()
    }

    pub fn publish_processing_status(&self) {
        self.consumer_ctx.publish_status()
    }

    pub fn queue_overview(&self, limit: usize) -> anyhow::Result<QueueOverview> {
        Ok(QueueOverview {
            items: self.db.queue.list(limit)?,
            stats: self.db.get_stats()?,
            stuck_count: self.db.queue.stuck_count(self.config.stuck_item_threshold_ms)?,
        })
    }

    /// Put a failed item back to pending and wake its consumer.
    pub fn retry_queue_item(&self, item_id: i64) -> anyhow::Result<bool> {
        if !self.db.queue.retry(item_id)? {
            return Ok(false);
        }
        if let Some(item) = self.db.queue.get(item_id)? {
            if let Some(session) = self.registry.get(item.session_db_id) {
                session.wake();
            }
        }
        Ok(true)
    }

    pub fn clear_failed_items(&self) -> anyhow::Result<usize> {
        self.db.queue.clear_failed()
    }

    /// Run Parse and Render again from a stored model response.
    pub async fn reprocess_raw_response(
        &self,
        raw_response_id: i64,
    ) -> Result<PipelineOutcome, PipelineError> {
        self.pipeline.run_from_raw(raw_response_id).await
    }

    pub fn active_queries(&self) -> Vec<ActiveQueryInfo> {
        self.controller
            .as_ref()
            .map(|c| c.active_details())
            .unwrap_or_default()
    }

    pub fn health(&self) -> HealthReport {
        let database_ok = self.db.ping().is_ok();
        let queue_depth = self.db.queue.count().unwrap_or(-1);
        HealthReport {
            status: if database_ok { "healthy" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            database_ok,
            active_sessions: self.registry.active_count(),
            active_queries: self
                .controller
                .as_ref()
                .map(|c| c.active_count())
                .unwrap_or(0),
            queue_depth,
            vector_breaker: self.vector.as_ref().map(|v| v.breaker_state().to_string()),
            parse: self.pipeline.parse_metrics(),
        }
    }

    /// Stop consumers and kill in-flight queries. Items being processed go
    /// back to pending so the next start picks them up.
    pub async fn shutdown(&self) {
        info!("Shutting down worker");
        self.shutdown.cancel();
        self.registry.cancel_all();
        if let Some(controller) = &self.controller {
            let killed = controller.kill_all().await;
            if killed > 0 {
                info!("Killed {} in-flight quer(ies)", killed);
            }
        }
        let handles: Vec<_> = std::mem::take(&mut *self.consumers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Consumer task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ProcessOutput, ProcessRequest};
    use crate::query::QueryUsage;
    use async_trait::async_trait;

    struct EchoProcessor;

    #[async_trait]
    impl ModelProcessor for EchoProcessor {
        async fn process(
            &self,
            request: ProcessRequest,
            _cancel: &CancellationToken,
        ) -> Result<ProcessOutput, PipelineError> {
            Ok(ProcessOutput {
                response_text: "<observation><type>change</type><title>Edited file</title></observation>"
                    .into(),
                usage: QueryUsage::default(),
                model_session_id: Some("model-1".into()),
                model: request.model,
                latency: Duration::from_millis(1),
            })
        }
    }

    fn service() -> WorkerService {
        let mut config = Config::for_data_dir("/tmp/memory-worker-service-test");
        config.consumer_error_backoff_ms = 10;
        WorkerService::with_processor(
            Arc::new(config),
            Arc::new(MemoryDatabase::new_in_memory().unwrap()),
            Arc::new(EchoProcessor),
            None,
        )
    }

    fn edit() -> ObservationInput {
        ObservationInput {
            tool_name: "Edit".into(),
            tool_input: "{}".into(),
            tool_response: "ok".into(),
            cwd: None,
        }
    }

    #[tokio::test]
    async fn test_skip_listed_tool_is_ignored() {
        let service = service();
        let outcome = service
            .enqueue_observation(
                "ext-1",
                ObservationInput {
                    tool_name: "TodoWrite".into(),
                    ..edit()
                },
            )
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Ignored { .. }));
        assert_eq!(service.db.queue.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_is_processed_in_background() {
        let service = service();
        let mut events = service.subscribe();
        let init = service.init_session("ext-1", "proj", "fix it").unwrap();
        assert_eq!(init.prompt_number, 1);

        let outcome = service.enqueue_observation("ext-1", edit()).unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Accepted { .. }));

        let observation = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let envelope = events.recv().await.unwrap();
                if let WorkerEvent::NewObservation { observation } = envelope.event {
                    return observation;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(observation.body.title.as_deref(), Some("Edited file"));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_session_ignores_new_work() {
        let service = service();
        let init = service.init_session("ext-1", "proj", "hi").unwrap();
        assert!(service.close_session(init.session_db_id).unwrap());
        assert!(!service.close_session(init.session_db_id).unwrap());

        let outcome = service.enqueue_summarize("ext-1", "bye").unwrap();
        assert_eq!(outcome, EnqueueOutcome::ignored("session is closed"));
        assert!(service.init_session("ext-1", "proj", "again").unwrap().skipped);
    }

    #[tokio::test]
    async fn test_health_report() {
        let service = service();
        let health = service.health();
        assert!(health.database_ok);
        assert_eq!(health.status, "healthy");
        assert!(health.vector_breaker.is_none());
        assert!(service.active_queries().is_empty());
    }
}
