//! Render: primary store first, vector index second, observers last.

use std::sync::Arc;
use tracing::{debug, warn};

use super::execution::Stage;
use super::parse::ParseOutput;
use super::PipelineError;
use crate::events::{EventBus, WorkerEvent};
use crate::memory_db::{MemoryDatabase, OutputContext, StoredOutputs};
use crate::metrics;
use crate::vector_sync::{VectorSyncError, VectorSyncService};

#[derive(Debug, Clone, Default)]
pub struct RenderOutput {
    pub stored: StoredOutputs,
    pub vector_documents: usize,
    pub vector_error: Option<String>,
}

pub struct Renderer {
    db: Arc<MemoryDatabase>,
    vector: Option<Arc<VectorSyncService>>,
    events: Arc<EventBus>,
}

impl Renderer {
    pub fn new(
        db: Arc<MemoryDatabase>,
        vector: Option<Arc<VectorSyncService>>,
        events: Arc<EventBus>,
    ) -> Self {
        Self { db, vector, events }
    }

    /// Persist the parsed structures. When `consumed_item` is set the queue
    /// item is removed in the same transaction.
    pub async fn render(
        &self,
        ctx: &OutputContext,
        parsed: &ParseOutput,
        consumed_item: Option<i64>,
    ) -> Result<RenderOutput, PipelineError> {
        let stored = self
            .db
            .outputs
            .store_outputs(ctx, &parsed.observations, parsed.summary.as_ref(), consumed_item)
            .map_err(|e| PipelineError::Transient {
                stage: Stage::Render,
                message: format!("{:#}", e),
            })?;
        debug!(
            session_db_id = ctx.session_db_id,
            "Stored {} observation(s), summary: {}",
            stored.observations.len(),
            stored.summary.is_some()
        );

        let mut output = RenderOutput {
            stored,
            ..Default::default()
        };
        self.sync_vectors(&mut output).await;

        for observation in &output.stored.observations {
            self.events.publish(WorkerEvent::NewObservation {
                observation: observation.clone(),
            });
        }
        if let Some(summary) = &output.stored.summary {
            self.events.publish(WorkerEvent::NewSummary {
                summary: summary.clone(),
            });
        }
        Ok(output)
    }

    /// Never fails the render; the SQLite rows are already committed.
    async fn sync_vectors(&self, output: &mut RenderOutput) {
        let Some(vector) = &self.vector else {
            return;
        };
        if output.stored.is_empty() {
            return;
        }

        let mut result = vector.sync_observations(&output.stored.observations).await;
        if let (Ok(written), Some(summary)) = (&result, &output.stored.summary) {
            let written = *written;
            result = vector.sync_summary(summary).await.map(|n| n + written);
        }

        match result {
            Ok(written) => {
                metrics::inc_vector_sync("ok");
                output.vector_documents = written;
            }
            Err(e) => {
                let outcome = match e {
                    VectorSyncError::CircuitOpen { .. } => "circuit_open",
                    _ => "error",
                };
                metrics::inc_vector_sync(outcome);
                warn!("Vector sync skipped: {}", e);
                output.vector_error = Some(e.to_string());
            }
        }
    }
}
