//! Best-effort mirror of stored observations and summaries into a vector index.
//!
//! The primary SQLite write never depends on anything here. Connection setup
//! is coalesced: concurrent callers of `ensure_connected` share one in-flight
//! attempt, and only the attempt that occupies the slot may clear it. Every
//! backend call goes through a circuit breaker, so a dead backend costs no
//! network attempts while the circuit is open.

pub mod chroma;
pub mod circuit_breaker;

pub use chroma::{ChromaBackend, EmbeddingClient};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitOpen, CircuitState};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::memory_db::{StoredObservation, StoredSummary};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum VectorSyncError {
    #[error("vector backend unreachable: {0}")]
    Connection(String),
    #[error("vector backend rejected request: {0}")]
    Request(String),
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("circuit open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },
}

impl From<CircuitOpen> for VectorSyncError {
    fn from(open: CircuitOpen) -> Self {
        VectorSyncError::CircuitOpen {
            retry_in: open.retry_in,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorDocument {
    pub id: String,
    pub document: String,
    pub metadata: Map<String, Value>,
}

#[async_trait]
pub trait VectorBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), VectorSyncError>;

    async fn add_documents(
        &self,
        collection: &str,
        documents: &[VectorDocument],
    ) -> Result<(), VectorSyncError>;
}

type ConnectFuture = Shared<BoxFuture<'static, Result<(), VectorSyncError>>>;

struct InFlight {
    attempt: u64,
    future: ConnectFuture,
}

pub struct VectorSyncService {
    backend: Arc<dyn VectorBackend>,
    breaker: Arc<CircuitBreaker>,
    collection_prefix: String,
    connected: AtomicBool,
    in_flight: Mutex<Option<InFlight>>,
    next_attempt: AtomicU64,
}

impl VectorSyncService {
    pub fn new(
        backend: Arc<dyn VectorBackend>,
        breaker: CircuitBreakerConfig,
        collection_prefix: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            breaker: Arc::new(CircuitBreaker::new(breaker)),
            collection_prefix: collection_prefix.into(),
            connected: AtomicBool::new(false),
            in_flight: Mutex::new(None),
            next_attempt: AtomicU64::new(1),
        }
    }

    /// Chroma-backed service, or `None` when vector sync is disabled.
    pub fn from_config(config: &Config) -> Option<Self> {
        if !config.chroma_enabled {
            return None;
        }
        let timeout = Duration::from_secs(config.vector_request_timeout_seconds);
        let embedder = config
            .embeddings_url
            .as_ref()
            .map(|url| EmbeddingClient::new(url.clone(), config.embeddings_model.clone(), timeout));
        let backend = Arc::new(ChromaBackend::new(config.chroma_url.clone(), timeout, embedder));
        Some(Self::new(
            backend,
            CircuitBreakerConfig {
                failure_threshold: config.breaker_failure_threshold,
                open_duration: config.breaker_cooldown(),
            },
            config.chroma_collection_prefix.clone(),
        ))
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Connect once; concurrent callers wait on the same attempt.
    pub async fn ensure_connected(&self) -> Result<(), VectorSyncError> {
        if self.is_connected() {
            return Ok(());
        }

        let (attempt, future) = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(in_flight) => (in_flight.attempt, in_flight.future.clone()),
                None => {
                    let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
                    let future = self.connect_attempt(attempt);
                    *slot = Some(InFlight {
                        attempt,
                        future: future.clone(),
                    });
                    (attempt, future)
                }
            }
        };

        let result = future.await;
        self.clear_attempt(attempt);
        if result.is_ok() {
            self.connected.store(true, Ordering::Release);
        }
        result
    }

    fn connect_attempt(&self, attempt: u64) -> ConnectFuture {
        let backend = Arc::clone(&self.backend);
        let breaker = Arc::clone(&self.breaker);
        async move {
            debug!(attempt, backend = backend.name(), "Connecting to vector backend");
            breaker.call(|| backend.connect()).await?
        }
        .boxed()
        .shared()
    }

    /// Empty the slot only if it still holds `attempt`.
    fn clear_attempt(&self, attempt: u64) {
        let mut slot = self.in_flight.lock();
        if slot.as_ref().map(|f| f.attempt) == Some(attempt) {
            *slot = None;
        }
    }

    #[cfg(test)]
    fn current_attempt(&self) -> Option<u64> {
        self.in_flight.lock().as_ref().map(|f| f.attempt)
    }

    /// Mirror observations, one collection per project. Returns the number
    /// of documents written.
    pub async fn sync_observations(
        &self,
        observations: &[StoredObservation],
    ) -> Result<usize, VectorSyncError> {
        let mut by_project: BTreeMap<&str, Vec<VectorDocument>> = BTreeMap::new();
        for obs in observations {
            by_project
                .entry(obs.project.as_str())
                .or_default()
                .extend(observation_documents(obs));
        }

        let mut written = 0;
        for (project, documents) in by_project {
            written += self.write(project, documents).await?;
        }
        Ok(written)
    }

    pub async fn sync_summary(&self, summary: &StoredSummary) -> Result<usize, VectorSyncError> {
        self.write(&summary.project, summary_documents(summary)).await
    }

    async fn write(&self, project: &str, documents: Vec<VectorDocument>) -> Result<usize, VectorSyncError> {
        if documents.is_empty() {
            return Ok(0);
        }
        self.ensure_connected().await?;

        let collection = collection_name(&self.collection_prefix, project);
        let backend = Arc::clone(&self.backend);
        match self
            .breaker
            .call(|| backend.add_documents(&collection, &documents))
            .await?
        {
            Ok(()) => Ok(documents.len()),
            Err(e) => {
                if matches!(e, VectorSyncError::Connection(_)) {
                    self.connected.store(false, Ordering::Release);
                }
                warn!("Vector sync to {} failed: {}", collection, e);
                Err(e)
            }
        }
    }
}

/// Collection names allow `[a-zA-Z0-9._-]` and must end alphanumeric.
pub fn collection_name(prefix: &str, project: &str) -> String {
    let sanitized: String = project
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    let trimmed = sanitized.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    let project = if trimmed.is_empty() { "unknown" } else { trimmed };
    format!("{}__{}", prefix, project)
}

fn base_metadata(
    sqlite_id: i64,
    doc_type: &str,
    memory_session_id: Option<&str>,
    project: &str,
    created_at_epoch: i64,
) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("sqlite_id".into(), sqlite_id.into());
    metadata.insert("doc_type".into(), doc_type.into());
    if let Some(id) = memory_session_id {
        metadata.insert("memory_session_id".into(), id.into());
    }
    metadata.insert("project".into(), project.into());
    metadata.insert("created_at_epoch".into(), created_at_epoch.into());
    metadata
}

/// One document for the narrative and one per fact.
pub fn observation_documents(obs: &StoredObservation) -> Vec<VectorDocument> {
    let mut metadata = base_metadata(
        obs.id,
        "observation",
        obs.memory_session_id.as_deref(),
        &obs.project,
        obs.created_at_epoch,
    );
    metadata.insert("type".into(), obs.body.obs_type.as_str().into());
    metadata.insert(
        "title".into(),
        obs.body.title.clone().unwrap_or_else(|| "Untitled".to_string()).into(),
    );
    if let Some(subtitle) = &obs.body.subtitle {
        metadata.insert("subtitle".into(), subtitle.clone().into());
    }
    for (key, values) in [
        ("concepts", &obs.body.concepts),
        ("files_read", &obs.body.files_read),
        ("files_modified", &obs.body.files_modified),
    ] {
        if !values.is_empty() {
            metadata.insert(key.into(), values.join(",").into());
        }
    }

    let mut documents = Vec::new();
    if let Some(narrative) = &obs.body.narrative {
        let mut meta = metadata.clone();
        meta.insert("field_type".into(), "narrative".into());
        documents.push(VectorDocument {
            id: format!("obs_{}_narrative", obs.id),
            document: narrative.clone(),
            metadata: meta,
        });
    }
    for (index, fact) in obs.body.facts.iter().enumerate() {
        let mut meta = metadata.clone();
        meta.insert("field_type".into(), "fact".into());
        meta.insert("fact_index".into(), index.into());
        documents.push(VectorDocument {
            id: format!("obs_{}_fact_{}", obs.id, index),
            document: fact.clone(),
            metadata: meta,
        });
    }
    documents
}

/// One document per populated summary field.
pub fn summary_documents(summary: &StoredSummary) -> Vec<VectorDocument> {
    let metadata = base_metadata(
        summary.id,
        "session_summary",
        summary.memory_session_id.as_deref(),
        &summary.project,
        summary.created_at_epoch,
    );
    summary
        .body
        .fields()
        .into_iter()
        .map(|(field, text)| {
            let mut meta = metadata.clone();
            meta.insert("field_type".into(), field.into());
            VectorDocument {
                id: format!("summary_{}_{}", summary.id, field),
                document: text.to_string(),
                metadata: meta,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::{ObservationType, ParsedObservation, ParsedSummary};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Backend whose connect outcome and latency are scripted.
    #[derive(Default)]
    struct MockBackend {
        connect_calls: AtomicUsize,
        add_calls: AtomicUsize,
        fail_connect: AtomicBool,
        gate: Option<Arc<Notify>>,
        added: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl VectorBackend for MockBackend {
        fn name(&self) -> &str {
            "mock"
        }

        async fn connect(&self) -> Result<(), VectorSyncError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_connect.load(Ordering::SeqCst) {
                Err(VectorSyncError::Connection("refused".into()))
            } else {
                Ok(())
            }
        }

        async fn add_documents(
            &self,
            collection: &str,
            documents: &[VectorDocument],
        ) -> Result<(), VectorSyncError> {
            self.add_calls.fetch_add(1, Ordering::SeqCst);
            self.added.lock().push((
                collection.to_string(),
                documents.iter().map(|d| d.id.clone()).collect(),
            ));
            Ok(())
        }
    }

    fn service(backend: Arc<MockBackend>) -> Arc<VectorSyncService> {
        Arc::new(VectorSyncService::new(
            backend,
            CircuitBreakerConfig {
                failure_threshold: 3,
                open_duration: Duration::from_secs(60),
            },
            "cm",
        ))
    }

    fn stored_observation(id: i64, project: &str) -> StoredObservation {
        StoredObservation {
            id,
            session_db_id: 1,
            memory_session_id: Some("model-1".into()),
            project: project.into(),
            prompt_number: 1,
            discovery_tokens: 0,
            created_at_epoch: 1_700_000_000_000,
            body: ParsedObservation {
                obs_type: ObservationType::Bugfix,
                title: Some("Fixed race".into()),
                subtitle: None,
                narrative: Some("The race is fixed".into()),
                facts: vec!["a".into(), "b".into()],
                concepts: vec!["gotcha".into()],
                files_read: vec![],
                files_modified: vec!["src/x.rs".into()],
            },
        }
    }

    // ===== Coalescing Tests =====

    #[tokio::test]
    async fn test_concurrent_callers_share_one_attempt() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(MockBackend {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        let sync = service(Arc::clone(&backend));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let sync = Arc::clone(&sync);
                tokio::spawn(async move { sync.ensure_connected().await })
            })
            .collect();
        while sync.current_attempt().is_none() || backend.connect_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(backend.connect_calls.load(Ordering::SeqCst), 1);
        assert!(sync.is_connected());
        assert!(sync.current_attempt().is_none());

        // Connected state short-circuits later calls
        sync.ensure_connected().await.unwrap();
        assert_eq!(backend.connect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_attempt_does_not_clear_newer_slot() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(MockBackend {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        let sync = service(backend);

        let pending = {
            let sync = Arc::clone(&sync);
            tokio::spawn(async move { sync.ensure_connected().await })
        };
        while sync.current_attempt().is_none() {
            tokio::task::yield_now().await;
        }
        let current = sync.current_attempt().unwrap();

        sync.clear_attempt(current + 100);
        assert_eq!(sync.current_attempt(), Some(current));

        gate.notify_one();
        pending.await.unwrap().unwrap();
        assert!(sync.current_attempt().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connects_trip_breaker() {
        let backend = Arc::new(MockBackend::default());
        backend.fail_connect.store(true, Ordering::SeqCst);
        let sync = service(Arc::clone(&backend));

        for _ in 0..3 {
            assert!(matches!(
                sync.ensure_connected().await,
                Err(VectorSyncError::Connection(_))
            ));
        }
        assert_eq!(sync.breaker_state(), CircuitState::Open);

        let result = sync.sync_observations(&[stored_observation(1, "p")]).await;
        assert!(matches!(result, Err(VectorSyncError::CircuitOpen { .. })));
        assert_eq!(backend.connect_calls.load(Ordering::SeqCst), 3);
        assert_eq!(backend.add_calls.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        backend.fail_connect.store(false, Ordering::SeqCst);
        assert_eq!(sync.sync_observations(&[stored_observation(1, "p")]).await, Ok(3));
        assert_eq!(backend.connect_calls.load(Ordering::SeqCst), 4);
        assert_eq!(sync.breaker_state(), CircuitState::Closed);
    }

    // ===== Document Tests =====

    #[tokio::test]
    async fn test_sync_groups_documents_by_project() {
        let backend = Arc::new(MockBackend::default());
        let sync = service(Arc::clone(&backend));

        let written = sync
            .sync_observations(&[stored_observation(1, "alpha"), stored_observation(2, "my proj/")])
            .await
            .unwrap();
        assert_eq!(written, 6);

        let added = backend.added.lock();
        assert_eq!(added.len(), 2);
        assert_eq!(added[0].0, "cm__alpha");
        assert_eq!(added[1].0, "cm__my_proj");
        assert_eq!(
            added[0].1,
            vec!["obs_1_narrative", "obs_1_fact_0", "obs_1_fact_1"]
        );
    }

    #[test]
    fn test_summary_documents_skip_empty_fields() {
        let summary = StoredSummary {
            id: 9,
            session_db_id: 1,
            memory_session_id: None,
            project: "p".into(),
            prompt_number: 1,
            discovery_tokens: 0,
            created_at_epoch: 0,
            body: ParsedSummary {
                request: Some("r".into()),
                next_steps: Some("n".into()),
                ..Default::default()
            },
        };
        let docs = summary_documents(&summary);
        let ids: Vec<_> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["summary_9_request", "summary_9_next_steps"]);
        assert_eq!(docs[0].metadata["doc_type"], "session_summary");
        assert!(docs[0].metadata.get("memory_session_id").is_none());
    }

    #[test]
    fn test_collection_name_sanitizes() {
        assert_eq!(collection_name("cm", "web-app"), "cm__web-app");
        assert_eq!(collection_name("cm", "a b.c!!"), "cm__a_b.c");
        assert_eq!(collection_name("cm", "///"), "cm__unknown");
    }
}
