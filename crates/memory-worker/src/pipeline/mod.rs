//! Five-stage observation pipeline: Acquire → Prepare → Process → Parse → Render.
//!
//! Only Process calls the model. Every other stage is a deterministic
//! transformation, so a saved model response can be pushed through Parse and
//! Render again without paying for another call.

pub mod acquire;
pub mod execution;
pub mod parse;
pub mod prepare;
pub mod process;
pub mod render;

pub use execution::{ExecutionStatus, PipelineExecution, Stage, StageRecord};
pub use parse::{ParseMetrics, ParseOutput, ResponseParser};
pub use process::{ModelProcessor, ProcessOutput, ProcessRequest, SubprocessProcessor};
pub use render::{RenderOutput, Renderer};

use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Config;
use crate::events::EventBus;
use crate::memory_db::{MemoryDatabase, OutputContext, QueueItem, StoredOutputs};
use crate::query::QueryError;
use crate::vector_sync::VectorSyncService;
use prepare::PrepareContext;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The input breaks the queue contract. Retrying cannot help.
    #[error("contract violation in {stage}: {message}")]
    Contract { stage: Stage, message: String },
    #[error("transient failure in {stage}: {message}")]
    Transient { stage: Stage, message: String },
    #[error("model call failed: {0}")]
    Subprocess(#[from] QueryError),
    #[error("malformed model output: {0}")]
    MalformedOutput(String),
}

impl PipelineError {
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, PipelineError::Contract { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Contract { .. } => "contract",
            PipelineError::Transient { .. } => "transient",
            PipelineError::Subprocess(_) => "subprocess",
            PipelineError::MalformedOutput(_) => "malformed_output",
        }
    }

    fn transient(stage: Stage) -> impl FnOnce(anyhow::Error) -> PipelineError {
        move |e| PipelineError::Transient {
            stage,
            message: format!("{:#}", e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub model: String,
    pub context_observation_limit: usize,
    pub store_intermediates: bool,
    pub strict_parse: bool,
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.model.clone(),
            context_observation_limit: config.context_observation_limit,
            store_intermediates: config.store_intermediates,
            strict_parse: config.strict_parse,
        }
    }
}

/// Session state the pipeline needs for one item.
#[derive(Debug, Clone, Default)]
pub struct TurnContext {
    pub project: String,
    pub user_prompt: String,
    pub memory_session_id: Option<String>,
    /// Model session to continue; `None` starts fresh
    pub resume: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub execution: PipelineExecution,
    pub stored: StoredOutputs,
    /// Model session id announced during Process, if any
    pub model_session_id: Option<String>,
    pub raw_response_id: Option<i64>,
    pub skip_reason: Option<String>,
    pub vector_error: Option<String>,
}

struct StagesDone {
    render: RenderOutput,
    parsed: ParseOutput,
    model_session_id: Option<String>,
    raw_response_id: Option<i64>,
}

pub struct Pipeline {
    db: Arc<MemoryDatabase>,
    processor: Arc<dyn ModelProcessor>,
    parser: ResponseParser,
    renderer: Renderer,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        db: Arc<MemoryDatabase>,
        processor: Arc<dyn ModelProcessor>,
        vector: Option<Arc<VectorSyncService>>,
        events: Arc<EventBus>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            renderer: Renderer::new(Arc::clone(&db), vector, events),
            parser: ResponseParser::new(options.strict_parse),
            db,
            processor,
            options,
        }
    }

    pub fn parse_metrics(&self) -> ParseMetrics {
        self.parser.metrics()
    }

    /// Full run for a claimed item. On success the item is gone from the
    /// queue; on error it is left as claimed for the caller to settle.
    pub async fn run(
        &self,
        item: &QueueItem,
        turn: &TurnContext,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        let mut execution = PipelineExecution::new(item.session_db_id, Some(item.id));
        let result = self.run_stages(&mut execution, item, turn, cancel).await;
        Self::settle(execution, result)
    }

    async fn run_stages(
        &self,
        execution: &mut PipelineExecution,
        item: &QueueItem,
        turn: &TurnContext,
        cancel: &CancellationToken,
    ) -> Result<StagesDone, PipelineError> {
        let acquired = execution.stage_sync(Stage::Acquire, || acquire::acquire(item))?;
        execution.record_acquire(&acquired.metadata);

        let request = execution.stage_sync(Stage::Prepare, || {
            let recent_titles = self
                .db
                .outputs
                .recent_titles(item.session_db_id, self.options.context_observation_limit)
                .map_err(PipelineError::transient(Stage::Prepare))?;
            let ctx = PrepareContext {
                project: turn.project.clone(),
                user_prompt: turn.user_prompt.clone(),
                resuming: turn.resume.is_some(),
                recent_titles,
            };
            Ok(prepare::prepare(&acquired, &ctx))
        })?;
        execution.record_prepare(&request);

        let processed = execution
            .stage(
                Stage::Process,
                self.processor.process(
                    ProcessRequest {
                        prompt: request.prompt,
                        system_prompt: request.system_prompt,
                        model: self.options.model.clone(),
                        resume: turn.resume.clone(),
                        session_db_id: item.session_db_id,
                    },
                    cancel,
                ),
            )
            .await?;
        execution.record_process(&processed);

        let raw_response_id = if self.options.store_intermediates {
            match self
                .db
                .outputs
                .store_raw_response(item, &processed.response_text, processed.total_tokens())
            {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(item_id = item.id, "Failed to keep raw response: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        let parsed = execution.stage_sync(Stage::Parse, || {
            self.parser.parse(&processed.response_text, item.payload.kind())
        })?;

        let ctx = OutputContext {
            session_db_id: item.session_db_id,
            memory_session_id: processed
                .model_session_id
                .clone()
                .or_else(|| turn.memory_session_id.clone()),
            project: turn.project.clone(),
            prompt_number: item.prompt_number,
            discovery_tokens: processed.total_tokens(),
        };
        let render = execution
            .stage(Stage::Render, self.renderer.render(&ctx, &parsed, Some(item.id)))
            .await?;

        Ok(StagesDone {
            render,
            parsed,
            model_session_id: processed.model_session_id,
            raw_response_id,
        })
    }

    /// Parse and Render again from a saved model response.
    pub async fn run_from_raw(&self, raw_response_id: i64) -> Result<PipelineOutcome, PipelineError> {
        let raw = self
            .db
            .outputs
            .get_raw_response(raw_response_id)
            .map_err(PipelineError::transient(Stage::Parse))?
            .ok_or_else(|| PipelineError::Contract {
                stage: Stage::Parse,
                message: format!("raw response {} not found", raw_response_id),
            })?;
        let session = self
            .db
            .sessions
            .get(raw.session_db_id)
            .map_err(PipelineError::transient(Stage::Render))?
            .ok_or_else(|| PipelineError::Contract {
                stage: Stage::Render,
                message: format!("session {} not found", raw.session_db_id),
            })?;

        let mut execution = PipelineExecution::new(raw.session_db_id, Some(raw.queue_item_id));
        execution.resumed_from_raw = Some(raw_response_id);

        let result = async {
            let parsed = execution
                .stage_sync(Stage::Parse, || self.parser.parse(&raw.response_text, raw.kind))?;
            let ctx = OutputContext {
                session_db_id: raw.session_db_id,
                memory_session_id: session.memory_session_id.clone(),
                project: session.project.clone(),
                prompt_number: raw.prompt_number,
                discovery_tokens: raw.discovery_tokens,
            };
            let render = execution
                .stage(
                    Stage::Render,
                    self.renderer.render(&ctx, &parsed, Some(raw.queue_item_id)),
                )
                .await?;
            Ok::<_, PipelineError>(StagesDone {
                render,
                parsed,
                model_session_id: None,
                raw_response_id: Some(raw_response_id),
            })
        }
        .await;
        Self::settle(execution, result)
    }

    fn settle(
        mut execution: PipelineExecution,
        result: Result<StagesDone, PipelineError>,
    ) -> Result<PipelineOutcome, PipelineError> {
        match result {
            Ok(done) => {
                execution.finish(ExecutionStatus::Completed);
                Ok(PipelineOutcome {
                    execution,
                    stored: done.render.stored,
                    model_session_id: done.model_session_id,
                    raw_response_id: done.raw_response_id,
                    skip_reason: done.parsed.skip_reason,
                    vector_error: done.render.vector_error,
                })
            }
            Err(e) => {
                execution.finish(ExecutionStatus::Failed);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::WorkerEvent;
    use crate::memory_db::QueuePayload;
    use crate::query::QueryUsage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const RESPONSE: &str = r#"
<observation>
  <type>feature</type>
  <title>Added retry budget</title>
  <facts><fact>queue items carry retry_count</fact></facts>
  <narrative>Failed items go back to pending until the budget is spent.</narrative>
</observation>
<observation>
  <type>discovery</type>
  <title>Claim is a single statement</title>
</observation>
"#;

    struct ScriptedProcessor {
        response: String,
        calls: AtomicUsize,
    }

    impl ScriptedProcessor {
        fn new(response: &str) -> Arc<Self> {
            Arc::new(Self {
                response: response.to_string(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ModelProcessor for ScriptedProcessor {
        async fn process(
            &self,
            request: ProcessRequest,
            _cancel: &CancellationToken,
        ) -> Result<ProcessOutput, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ProcessOutput {
                response_text: self.response.clone(),
                usage: QueryUsage {
                    input_tokens: 100,
                    output_tokens: 20,
                    cost_usd: 0.0,
                },
                model_session_id: if request.resume.is_none() {
                    Some("model-abc".into())
                } else {
                    None
                },
                model: request.model,
                latency: Duration::from_millis(1),
            })
        }
    }

    struct Fixture {
        db: Arc<MemoryDatabase>,
        events: Arc<EventBus>,
        session_db_id: i64,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        let session_db_id = db.sessions.upsert("ext-1", "proj-a", "build it").unwrap();
        Fixture {
            db,
            events: Arc::new(EventBus::default()),
            session_db_id,
        }
    }

    fn pipeline(f: &Fixture, processor: Arc<dyn ModelProcessor>, store_intermediates: bool) -> Pipeline {
        Pipeline::new(
            Arc::clone(&f.db),
            processor,
            None,
            Arc::clone(&f.events),
            PipelineOptions {
                model: "test-model".into(),
                context_observation_limit: 5,
                store_intermediates,
                strict_parse: false,
            },
        )
    }

    fn claim(f: &Fixture, payload: QueuePayload) -> QueueItem {
        f.db.queue.enqueue(f.session_db_id, "ext-1", 1, &payload).unwrap();
        f.db.queue.claim_next(f.session_db_id).unwrap().unwrap()
    }

    fn observation_payload(tool_name: &str) -> QueuePayload {
        QueuePayload::Observation {
            tool_name: tool_name.into(),
            tool_input: r#"{"command":"cargo test"}"#.into(),
            tool_response: "ok".into(),
            cwd: None,
        }
    }

    fn turn() -> TurnContext {
        TurnContext {
            project: "proj-a".into(),
            user_prompt: "build it".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_full_run_stores_and_consumes_item() {
        let f = fixture();
        let processor = ScriptedProcessor::new(RESPONSE);
        let pipeline = pipeline(&f, processor.clone(), false);
        let mut events = f.events.subscribe();
        let item = claim(&f, observation_payload("Bash"));

        let outcome = pipeline
            .run(&item, &turn(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.stored.observations.len(), 2);
        assert_eq!(outcome.model_session_id.as_deref(), Some("model-abc"));
        assert_eq!(outcome.execution.stages.len(), 5);
        assert_eq!(outcome.execution.status, ExecutionStatus::Completed);
        let details = &outcome.execution.details;
        assert_eq!(details.tool_category, Some(acquire::ToolCategory::Bash));
        assert!(details.event_input_tokens > 0);
        assert!(details.prompt_tokens > details.event_input_tokens);
        assert_eq!(details.prompt_version, Some(prepare::PROMPT_VERSION));
        assert_eq!(details.model.as_deref(), Some("test-model"));
        assert_eq!((details.input_tokens, details.output_tokens), (100, 20));
        assert!(f.db.queue.get(item.id).unwrap().is_none());

        let stored = &outcome.stored.observations[0];
        assert_eq!(stored.memory_session_id.as_deref(), Some("model-abc"));
        assert_eq!(stored.discovery_tokens, 120);

        let first = events.recv().await.unwrap();
        assert!(matches!(first.event, WorkerEvent::NewObservation { .. }));
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rerun_from_raw_matches_full_run() {
        let f = fixture();
        let processor = ScriptedProcessor::new(RESPONSE);
        let pipeline = pipeline(&f, processor.clone(), true);
        let item = claim(&f, observation_payload("Edit"));

        let full = pipeline
            .run(&item, &turn(), &CancellationToken::new())
            .await
            .unwrap();
        let raw_id = full.raw_response_id.unwrap();
        let after_full = f.db.outputs.count_for_session(f.session_db_id).unwrap();

        let rerun = pipeline.run_from_raw(raw_id).await.unwrap();
        let after_rerun = f.db.outputs.count_for_session(f.session_db_id).unwrap();

        assert_eq!(rerun.stored.len(), full.stored.len());
        assert_eq!(after_rerun - after_full, after_full);
        assert_eq!(rerun.execution.resumed_from_raw, Some(raw_id));
        assert_eq!(rerun.execution.stages.len(), 2);
        // the model was not asked again
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_contract_violation_never_reaches_model() {
        let f = fixture();
        let processor = ScriptedProcessor::new(RESPONSE);
        let pipeline = pipeline(&f, processor.clone(), false);
        let item = claim(&f, observation_payload(""));

        let err = pipeline
            .run(&item, &turn(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_contract_violation());
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.db.outputs.count_for_session(f.session_db_id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_summary_run() {
        let f = fixture();
        let processor = ScriptedProcessor::new(
            "<summary><request>Ship queue</request><completed>claim + retry</completed></summary>",
        );
        let pipeline = pipeline(&f, processor, false);
        let item = claim(
            &f,
            QueuePayload::Summarize {
                last_assistant_message: "All done".into(),
            },
        );

        let outcome = pipeline
            .run(&item, &turn(), &CancellationToken::new())
            .await
            .unwrap();
        let summary = outcome.stored.summary.unwrap();
        assert_eq!(summary.body.request.as_deref(), Some("Ship queue"));
        assert_eq!(f.db.outputs.get_session_summaries(f.session_db_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_raw_response_is_contract_error() {
        let f = fixture();
        let pipeline = pipeline(&f, ScriptedProcessor::new(RESPONSE), true);
        let err = pipeline.run_from_raw(999).await.unwrap_err();
        assert!(err.is_contract_violation());
    }
}
