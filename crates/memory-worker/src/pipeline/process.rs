//! Process: the one stage that talks to the model.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::PipelineError;
use crate::query::{QueryController, QueryError, QueryRequest, QueryUsage};

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model: String,
    pub resume: Option<String>,
    pub session_db_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutput {
    pub response_text: String,
    pub usage: QueryUsage,
    pub model_session_id: Option<String>,
    pub model: String,
    pub latency: Duration,
}

impl ProcessOutput {
    pub fn total_tokens(&self) -> i64 {
        (self.usage.input_tokens + self.usage.output_tokens) as i64
    }
}

/// Anything that can turn a prepared request into model output. Not assumed
/// to be idempotent: every call may cost money.
#[async_trait]
pub trait ModelProcessor: Send + Sync {
    async fn process(
        &self,
        request: ProcessRequest,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, PipelineError>;
}

/// Runs each request as a supervised subprocess query.
pub struct SubprocessProcessor {
    controller: Arc<QueryController>,
}

impl SubprocessProcessor {
    pub fn new(controller: Arc<QueryController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl ModelProcessor for SubprocessProcessor {
    async fn process(
        &self,
        request: ProcessRequest,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, PipelineError> {
        let started = Instant::now();
        let query = QueryRequest {
            prompt: request.prompt,
            system_prompt: request.system_prompt,
            model: request.model.clone(),
            resume: request.resume,
            session_db_id: request.session_db_id,
        };

        let handle = self.controller.start(&query, cancel).await?;
        debug!(
            pid = handle.pid(),
            session_db_id = query.session_db_id,
            "Query started"
        );

        let abort = handle.abort_handle();
        let output = tokio::select! {
            output = handle.collect() => output?,
            _ = cancel.cancelled() => {
                abort.abort().await;
                return Err(QueryError::Killed.into());
            }
        };

        Ok(ProcessOutput {
            response_text: output.text,
            usage: output.usage,
            model_session_id: output.model_session_id,
            model: request.model,
            latency: started.elapsed(),
        })
    }
}
