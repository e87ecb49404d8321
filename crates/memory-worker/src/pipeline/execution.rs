use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::acquire::{AcquireMetadata, ToolCategory};
use super::prepare::PreparedRequest;
use super::process::ProcessOutput;
use super::PipelineError;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Acquire,
    Prepare,
    Process,
    Parse,
    Render,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Acquire => "acquire",
            Stage::Prepare => "prepare",
            Stage::Process => "process",
            Stage::Parse => "parse",
            Stage::Render => "render",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    InProgress,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::InProgress => "in_progress",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub succeeded: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// What the stages measured along the way.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionDetails {
    pub tool_category: Option<ToolCategory>,
    /// Acquire's estimate of the raw tool input and output
    pub event_input_tokens: usize,
    pub event_output_tokens: usize,
    /// Prepare's estimate of the rendered request
    pub prompt_tokens: usize,
    pub expected_output_tokens: usize,
    pub context_included: bool,
    pub prompt_version: Option<&'static str>,
    pub model: Option<String>,
    pub latency_ms: Option<u64>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// One item's trip through the stages. Lives only as long as the run and
/// ends up in logs and prometheus.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineExecution {
    pub id: String,
    pub session_db_id: i64,
    pub queue_item_id: Option<i64>,
    pub status: ExecutionStatus,
    pub stages: Vec<StageRecord>,
    /// Set when the run started from a saved response instead of a model call
    pub resumed_from_raw: Option<i64>,
    pub details: ExecutionDetails,
    #[serde(skip)]
    started_at: Instant,
}

impl PipelineExecution {
    pub fn new(session_db_id: i64, queue_item_id: Option<i64>) -> Self {
        Self {
            id: format!("pipe_{}", Uuid::new_v4().simple()),
            session_db_id,
            queue_item_id,
            status: ExecutionStatus::InProgress,
            stages: Vec::with_capacity(5),
            resumed_from_raw: None,
            details: ExecutionDetails::default(),
            started_at: Instant::now(),
        }
    }

    /// Run one stage, recording its timing and outcome.
    pub async fn stage<T, F>(&mut self, stage: Stage, fut: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, PipelineError>>,
    {
        let started = Instant::now();
        let result = fut.await;
        let elapsed = started.elapsed();
        metrics::observe_stage(stage.as_str(), elapsed.as_secs_f64());

        match &result {
            Ok(_) => debug!(
                execution = %self.id,
                "Stage {} completed in {}ms",
                stage,
                elapsed.as_millis()
            ),
            Err(e) => warn!(execution = %self.id, "Stage {} failed: {}", stage, e),
        }
        self.stages.push(StageRecord {
            stage,
            succeeded: result.is_ok(),
            duration_ms: elapsed.as_millis() as u64,
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }

    /// Synchronous variant for the deterministic stages.
    pub fn stage_sync<T>(
        &mut self,
        stage: Stage,
        f: impl FnOnce() -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        let started = Instant::now();
        let result = f();
        let elapsed = started.elapsed();
        metrics::observe_stage(stage.as_str(), elapsed.as_secs_f64());
        if let Err(e) = &result {
            warn!(execution = %self.id, "Stage {} failed: {}", stage, e);
        }
        self.stages.push(StageRecord {
            stage,
            succeeded: result.is_ok(),
            duration_ms: elapsed.as_millis() as u64,
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }

    pub fn record_acquire(&mut self, metadata: &AcquireMetadata) {
        self.details.tool_category = metadata.tool_category;
        self.details.event_input_tokens = metadata.input_token_estimate;
        self.details.event_output_tokens = metadata.output_token_estimate;
    }

    pub fn record_prepare(&mut self, request: &PreparedRequest) {
        self.details.prompt_tokens = request.token_estimate.input;
        self.details.expected_output_tokens = request.token_estimate.expected_output;
        self.details.context_included = request.context_included;
        self.details.prompt_version = Some(request.prompt_version);
    }

    /// Usage and cost of the model call, also exported to prometheus.
    pub fn record_process(&mut self, output: &ProcessOutput) {
        self.details.model = Some(output.model.clone());
        self.details.latency_ms = Some(output.latency.as_millis() as u64);
        self.details.input_tokens = output.usage.input_tokens;
        self.details.output_tokens = output.usage.output_tokens;
        self.details.cost_usd = output.usage.cost_usd;
        metrics::observe_model_call(
            &output.model,
            output.usage.input_tokens,
            output.usage.output_tokens,
            output.usage.cost_usd,
            output.latency.as_secs_f64(),
        );
        debug!(
            execution = %self.id,
            model = %output.model,
            input_tokens = output.usage.input_tokens,
            output_tokens = output.usage.output_tokens,
            cost_usd = output.usage.cost_usd,
            estimated_prompt_tokens = self.details.prompt_tokens,
            "Model call took {}ms",
            output.latency.as_millis()
        );
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn failed_stage(&self) -> Option<Stage> {
        self.stages.iter().find(|s| !s.succeeded).map(|s| s.stage)
    }

    pub fn finish(&mut self, status: ExecutionStatus) {
        self.status = status;
        metrics::inc_pipeline_run(status.as_str());
        info!(
            execution = %self.id,
            session_db_id = self.session_db_id,
            item_id = ?self.queue_item_id,
            tool_category = ?self.details.tool_category,
            tokens = self.details.input_tokens + self.details.output_tokens,
            cost_usd = self.details.cost_usd,
            "Pipeline {} in {}ms ({} stages)",
            status.as_str(),
            self.elapsed().as_millis(),
            self.stages.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_stage_outcomes() {
        let mut execution = PipelineExecution::new(1, Some(2));
        let value = execution
            .stage(Stage::Process, async { Ok::<_, PipelineError>(5) })
            .await
            .unwrap();
        assert_eq!(value, 5);

        let failed = execution.stage_sync(Stage::Parse, || {
            Err::<(), _>(PipelineError::MalformedOutput("nothing".into()))
        });
        assert!(failed.is_err());

        assert_eq!(execution.stages.len(), 2);
        assert!(execution.stages[0].succeeded);
        assert_eq!(execution.failed_stage(), Some(Stage::Parse));
        assert!(execution.stages[1].error.as_deref().unwrap().contains("nothing"));

        execution.finish(ExecutionStatus::Failed);
        assert_eq!(execution.status, ExecutionStatus::Failed);
    }

    #[test]
    fn test_records_usage_from_each_stage() {
        use crate::query::QueryUsage;

        metrics::init_metrics();
        let mut execution = PipelineExecution::new(1, Some(2));
        execution.record_acquire(&AcquireMetadata {
            input_token_estimate: 12,
            output_token_estimate: 3,
            tool_category: Some(ToolCategory::Bash),
        });
        execution.record_process(&ProcessOutput {
            response_text: String::new(),
            usage: QueryUsage {
                input_tokens: 90,
                output_tokens: 10,
                cost_usd: 0.25,
            },
            model_session_id: None,
            model: "usage-test-model".into(),
            latency: Duration::from_millis(1500),
        });

        assert_eq!(execution.details.tool_category, Some(ToolCategory::Bash));
        assert_eq!(execution.details.event_input_tokens, 12);
        assert_eq!(execution.details.latency_ms, Some(1500));
        assert_eq!(execution.details.input_tokens, 90);
        assert_eq!(execution.details.cost_usd, 0.25);

        let text = String::from_utf8(metrics::gather_text().unwrap()).unwrap();
        assert!(text.contains("worker_model_tokens_total"));
        assert!(text.contains("usage-test-model"));
        assert!(text.contains("worker_model_cost_usd_total"));
    }
}
