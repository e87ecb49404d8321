//! In-memory view of the open sessions, backed by the sessions table.
//!
//! The table is the source of truth for identity and status. The map holds
//! what only matters while the worker runs: the consumer's wake signal and
//! cancellation token, a bounded conversation history, the claimed item ids
//! and the rehydrated flag.

use anyhow::Context;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::resume::should_resume;
use crate::events::{EventBus, WorkerEvent};
use crate::memory_db::{now_epoch_ms, MemoryDatabase, SessionRecord, SessionStatus};
use crate::metrics;
use crate::pipeline::TurnContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub content: String,
    pub at_epoch: i64,
}

#[derive(Debug)]
struct SessionState {
    project: String,
    user_prompt: String,
    memory_session_id: Option<String>,
    prompt_counter: i64,
    rehydrated: bool,
    history: VecDeque<HistoryEntry>,
    claimed: BTreeSet<i64>,
}

/// One open session as seen by its consumer.
#[derive(Debug)]
pub struct ActiveSession {
    pub session_db_id: i64,
    pub content_session_id: String,
    wake: Notify,
    cancel: CancellationToken,
    history_limit: usize,
    state: Mutex<SessionState>,
}

impl ActiveSession {
    fn from_record(record: &SessionRecord, history_limit: usize, rehydrated: bool) -> Self {
        Self {
            session_db_id: record.id,
            content_session_id: record.content_session_id.clone(),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            history_limit,
            state: Mutex::new(SessionState {
                project: record.project.clone(),
                user_prompt: record.user_prompt.clone(),
                memory_session_id: record.memory_session_id.clone(),
                prompt_counter: record.prompt_counter,
                rehydrated,
                history: VecDeque::new(),
                claimed: BTreeSet::new(),
            }),
        }
    }

    /// Signal the consumer that new work may be claimable. The permit is
    /// stored when nobody is waiting yet.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub async fn notified(&self) {
        self.wake.notified().await
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_rehydrated(&self) -> bool {
        self.state.lock().rehydrated
    }

    pub fn prompt_counter(&self) -> i64 {
        self.state.lock().prompt_counter
    }

    pub fn memory_session_id(&self) -> Option<String> {
        self.state.lock().memory_session_id.clone()
    }

    pub fn mark_claimed(&self, item_id: i64) {
        self.state.lock().claimed.insert(item_id);
    }

    pub fn clear_claimed(&self, item_id: i64) {
        self.state.lock().claimed.remove(&item_id);
    }

    pub fn claimed_items(&self) -> Vec<i64> {
        self.state.lock().claimed.iter().copied().collect()
    }

    pub fn push_history(&self, role: HistoryRole, content: &str) {
        let mut state = self.state.lock();
        state.history.push_back(HistoryEntry {
            role,
            content: content.to_string(),
            at_epoch: now_epoch_ms(),
        });
        while state.history.len() > self.history_limit {
            state.history.pop_front();
        }
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// What the pipeline needs for the next item of this session.
    pub fn turn_context(&self) -> TurnContext {
        let state = self.state.lock();
        let resume = if should_resume(
            state.memory_session_id.as_deref(),
            state.prompt_counter,
            state.rehydrated,
        ) {
            state.memory_session_id.clone()
        } else {
            None
        };
        TurnContext {
            project: state.project.clone(),
            user_prompt: state.user_prompt.clone(),
            memory_session_id: state.memory_session_id.clone(),
            resume,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveSessionInfo {
    pub session_db_id: i64,
    pub content_session_id: String,
    pub project: String,
    pub memory_session_id: Option<String>,
    pub prompt_counter: i64,
    pub started_at_epoch: i64,
    pub age_ms: i64,
    pub is_stale: bool,
    pub pending_items: i64,
    pub has_consumer: bool,
}

/// Result of [`SessionRegistry::get_or_create`].
#[derive(Debug, Clone)]
pub enum Registered {
    Active {
        session: Arc<ActiveSession>,
        /// True when this call created the in-memory entry, i.e. no consumer
        /// runs for it yet.
        started: bool,
    },
    /// The external id belongs to a session that was already closed.
    Closed { session_db_id: i64 },
}

impl Registered {
    pub fn session_db_id(&self) -> i64 {
        match self {
            Registered::Active { session, .. } => session.session_db_id,
            Registered::Closed { session_db_id } => *session_db_id,
        }
    }
}

pub struct SessionRegistry {
    db: Arc<MemoryDatabase>,
    events: Arc<EventBus>,
    sessions: DashMap<i64, Arc<ActiveSession>>,
    history_limit: usize,
    stale_threshold_ms: i64,
}

impl SessionRegistry {
    pub fn new(
        db: Arc<MemoryDatabase>,
        events: Arc<EventBus>,
        history_limit: usize,
        stale_threshold_ms: i64,
    ) -> Self {
        Self {
            db,
            events,
            sessions: DashMap::new(),
            history_limit,
            stale_threshold_ms,
        }
    }

    pub fn get(&self, session_db_id: i64) -> Option<Arc<ActiveSession>> {
        self.sessions.get(&session_db_id).map(|s| Arc::clone(s.value()))
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Idempotent create keyed by the external id.
    pub fn get_or_create(
        &self,
        content_session_id: &str,
        project: &str,
        user_prompt: &str,
    ) -> anyhow::Result<Registered> {
        let id = self
            .db
            .sessions
            .upsert(content_session_id, project, user_prompt)
            .context("Failed to upsert session")?;
        let record = self
            .db
            .sessions
            .get(id)?
            .with_context(|| format!("Session {} vanished after upsert", id))?;
        if record.status == SessionStatus::Completed {
            return Ok(Registered::Closed { session_db_id: id });
        }

        let registered = match self.sessions.entry(id) {
            Entry::Occupied(entry) => {
                let session = Arc::clone(entry.get());
                {
                    let mut state = session.state.lock();
                    state.project = record.project.clone();
                    state.user_prompt = record.user_prompt.clone();
                }
                Registered::Active {
                    session,
                    started: false,
                }
            }
            Entry::Vacant(entry) => {
                // a stored model id predates this entry, so it may come from
                // before a restart and must not be resumed blindly
                let rehydrated = record.memory_session_id.is_some();
                let session = Arc::new(ActiveSession::from_record(&record, self.history_limit, rehydrated));
                entry.insert(Arc::clone(&session));
                debug!(session_db_id = id, "Session entered registry");
                Registered::Active {
                    session,
                    started: true,
                }
            }
        };
        metrics::set_active_sessions(self.sessions.len() as i64);
        Ok(registered)
    }

    /// A new user prompt on an open session. Returns the new turn number.
    pub fn begin_turn(&self, session_db_id: i64, prompt: &str) -> anyhow::Result<i64> {
        let counter = self.db.sessions.increment_prompt_counter(session_db_id)?;
        if let Some(session) = self.get(session_db_id) {
            session.state.lock().prompt_counter = counter;
            if !prompt.is_empty() {
                session.push_history(HistoryRole::User, prompt);
            }
        }
        Ok(counter)
    }

    /// Remember the provider's session id. The provider id must never be the
    /// host's external id, since resuming with it would address the wrong
    /// conversation; such values are refused and `false` is returned.
    pub fn record_model_session_id(&self, session_db_id: i64, model_id: &str) -> anyhow::Result<bool> {
        if model_id.is_empty() {
            return Ok(false);
        }
        let session = self.get(session_db_id);
        let content_id = match &session {
            Some(s) => s.content_session_id.clone(),
            None => match self.db.sessions.get(session_db_id)? {
                Some(record) => record.content_session_id,
                None => anyhow::bail!("Session {} not found", session_db_id),
            },
        };
        if model_id == content_id {
            warn!(
                session_db_id,
                "Refusing model session id equal to the external session id"
            );
            return Ok(false);
        }

        self.db.sessions.set_memory_session_id(session_db_id, model_id)?;
        if let Some(session) = session {
            let mut state = session.state.lock();
            if state.memory_session_id.as_deref() != Some(model_id) {
                debug!(session_db_id, "Captured model session id");
            }
            state.memory_session_id = Some(model_id.to_string());
            state.rehydrated = false;
        }
        Ok(true)
    }

    /// Terminal. Cancels the consumer (which aborts an in-flight query),
    /// abandons the session's unfinished queue items and publishes
    /// `session_completed` once. Closing again is a no-op that returns
    /// `false`.
    pub fn close(&self, session_db_id: i64) -> anyhow::Result<bool> {
        let changed = self.db.sessions.mark_completed(session_db_id)?;
        let removed = self.sessions.remove(&session_db_id).map(|(_, s)| s);
        if let Some(session) = &removed {
            session.cancel.cancel();
        }
        metrics::set_active_sessions(self.sessions.len() as i64);

        // nothing claims work for a closed session
        let abandoned = self.db.queue.abandon_session(session_db_id)?;
        if abandoned > 0 {
            info!(session_db_id, abandoned, "Abandoned unfinished queue items");
        }

        if changed {
            let content_session_id = match removed {
                Some(session) => session.content_session_id.clone(),
                None => self
                    .db
                    .sessions
                    .get(session_db_id)?
                    .map(|r| r.content_session_id)
                    .unwrap_or_default(),
            };
            info!(session_db_id, "Session closed");
            self.events.publish(WorkerEvent::SessionCompleted {
                session_db_id,
                content_session_id,
            });
        }
        Ok(changed)
    }

    pub fn list_active(&self) -> anyhow::Result<Vec<ActiveSessionInfo>> {
        let now = now_epoch_ms();
        let records = self.db.sessions.list_active()?;
        let mut infos = Vec::with_capacity(records.len());
        for record in records {
            let age_ms = (now - record.started_at_epoch).max(0);
            infos.push(ActiveSessionInfo {
                pending_items: self.db.queue.pending_count(record.id)?,
                has_consumer: self.sessions.contains_key(&record.id),
                is_stale: age_ms > self.stale_threshold_ms,
                session_db_id: record.id,
                content_session_id: record.content_session_id,
                project: record.project,
                memory_session_id: record.memory_session_id,
                prompt_counter: record.prompt_counter,
                started_at_epoch: record.started_at_epoch,
                age_ms,
            });
        }
        Ok(infos)
    }

    /// Close every open session older than `threshold_ms`. Returns the ids
    /// this call closed.
    pub fn close_stale(&self, threshold_ms: i64) -> anyhow::Result<Vec<i64>> {
        let mut closed = Vec::new();
        for id in self.db.sessions.list_started_before(threshold_ms)? {
            if self.close(id)? {
                closed.push(id);
            }
        }
        if !closed.is_empty() {
            info!("Closed {} stale session(s)", closed.len());
        }
        Ok(closed)
    }

    /// Load every open session that still has queued work. Entries created
    /// here are flagged as rehydrated so the first call after a restart does
    /// not resume a provider conversation it cannot vouch for.
    pub fn rehydrate(&self) -> anyhow::Result<Vec<Arc<ActiveSession>>> {
        let mut loaded = Vec::new();
        for id in self.db.queue.sessions_with_pending()? {
            let Some(record) = self.db.sessions.get(id)? else {
                warn!(session_db_id = id, "Queued work for unknown session");
                continue;
            };
            if record.status != SessionStatus::Active {
                continue;
            }
            if let Entry::Vacant(entry) = self.sessions.entry(id) {
                let session = Arc::new(ActiveSession::from_record(&record, self.history_limit, true));
                entry.insert(Arc::clone(&session));
                loaded.push(session);
            }
        }
        if !loaded.is_empty() {
            info!("Rehydrated {} session(s) with pending work", loaded.len());
        }
        metrics::set_active_sessions(self.sessions.len() as i64);
        Ok(loaded)
    }

    /// Cancel every consumer without touching the stored status.
    pub fn cancel_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::QueuePayload;

    fn registry() -> (SessionRegistry, Arc<MemoryDatabase>, Arc<EventBus>) {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        let events = Arc::new(EventBus::default());
        let registry = SessionRegistry::new(Arc::clone(&db), Arc::clone(&events), 3, 3_600_000);
        (registry, db, events)
    }

    fn active(registered: Registered) -> (Arc<ActiveSession>, bool) {
        match registered {
            Registered::Active { session, started } => (session, started),
            Registered::Closed { .. } => panic!("expected an active session"),
        }
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let (registry, db, _) = registry();
        let (first, started) = active(registry.get_or_create("ext-1", "proj-a", "hi").unwrap());
        assert!(started);
        let (second, started) = active(registry.get_or_create("ext-1", "proj-a", "hi").unwrap());
        assert!(!started);
        assert_eq!(first.session_db_id, second.session_db_id);

        registry.get_or_create("ext-1", "", "another prompt").unwrap();
        let record = db.sessions.get(first.session_db_id).unwrap().unwrap();
        assert_eq!(record.project, "proj-a");
        assert_eq!(record.user_prompt, "hi");

        registry.get_or_create("ext-1", "proj-b", "").unwrap();
        assert_eq!(first.turn_context().project, "proj-b");
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_model_id_equal_to_external_id_is_refused() {
        let (registry, db, _) = registry();
        let (session, _) = active(registry.get_or_create("ext-1", "p", "hi").unwrap());

        assert!(!registry.record_model_session_id(session.session_db_id, "ext-1").unwrap());
        assert!(session.memory_session_id().is_none());

        assert!(registry.record_model_session_id(session.session_db_id, "model-1").unwrap());
        let record = db.sessions.get(session.session_db_id).unwrap().unwrap();
        assert_eq!(record.memory_session_id.as_deref(), Some("model-1"));
    }

    #[test]
    fn test_resume_follows_turns_and_rehydration() {
        let (registry, db, _) = registry();
        let (session, _) = active(registry.get_or_create("ext-1", "p", "hi").unwrap());
        let id = session.session_db_id;
        registry.begin_turn(id, "hi").unwrap();
        registry.record_model_session_id(id, "model-1").unwrap();
        assert_eq!(session.turn_context().resume, None);

        registry.begin_turn(id, "next").unwrap();
        assert_eq!(session.turn_context().resume.as_deref(), Some("model-1"));

        // a restart rebuilds the entry from the table
        db.queue
            .enqueue(
                id,
                "ext-1",
                2,
                &QueuePayload::Summarize {
                    last_assistant_message: "done".into(),
                },
            )
            .unwrap();
        let restarted = SessionRegistry::new(Arc::clone(&db), Arc::new(EventBus::default()), 3, 3_600_000);
        let loaded = restarted.rehydrate().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].is_rehydrated());
        assert_eq!(loaded[0].turn_context().resume, None);

        restarted.record_model_session_id(id, "model-2").unwrap();
        assert!(!loaded[0].is_rehydrated());
        assert_eq!(loaded[0].turn_context().resume.as_deref(), Some("model-2"));
    }

    #[test]
    fn test_restart_without_pending_work_does_not_resume() {
        let (registry, db, _) = registry();
        let (session, _) = active(registry.get_or_create("ext-1", "p", "hi").unwrap());
        let id = session.session_db_id;
        for _ in 0..5 {
            registry.begin_turn(id, "turn").unwrap();
        }
        registry.record_model_session_id(id, "model-old").unwrap();

        // no queued work, so the entry is created on the next prompt instead
        let restarted = SessionRegistry::new(Arc::clone(&db), Arc::new(EventBus::default()), 3, 3_600_000);
        assert!(restarted.rehydrate().unwrap().is_empty());
        let (session, started) = active(restarted.get_or_create("ext-1", "p", "").unwrap());
        assert!(started);
        assert_eq!(restarted.begin_turn(id, "turn").unwrap(), 6);
        assert!(session.is_rehydrated());
        assert_eq!(session.turn_context().resume, None);

        restarted.record_model_session_id(id, "model-new").unwrap();
        restarted.begin_turn(id, "turn").unwrap();
        assert_eq!(session.turn_context().resume.as_deref(), Some("model-new"));
    }

    #[test]
    fn test_close_abandons_unfinished_items() {
        let (registry, db, _) = registry();
        let (session, _) = active(registry.get_or_create("ext-1", "p", "hi").unwrap());
        let id = session.session_db_id;
        let payload = QueuePayload::Summarize {
            last_assistant_message: "done".into(),
        };
        db.queue.enqueue(id, "ext-1", 1, &payload).unwrap();
        db.queue.enqueue(id, "ext-1", 1, &payload).unwrap();
        db.queue.claim_next(id).unwrap().unwrap();

        let (other, _) = active(registry.get_or_create("ext-2", "p", "hi").unwrap());
        db.queue.enqueue(other.session_db_id, "ext-2", 1, &payload).unwrap();

        registry.close(id).unwrap();
        assert_eq!(db.queue.count().unwrap(), 1);
        assert_eq!(db.queue.pending_count(id).unwrap(), 0);
        assert_eq!(db.queue.pending_count(other.session_db_id).unwrap(), 1);
    }

    #[test]
    fn test_close_is_terminal_and_idempotent() {
        let (registry, _, events) = registry();
        let mut rx = events.subscribe();
        let (session, _) = active(registry.get_or_create("ext-1", "p", "hi").unwrap());
        let id = session.session_db_id;

        assert!(registry.close(id).unwrap());
        assert!(session.is_closed());
        assert!(!registry.close(id).unwrap());
        assert_eq!(registry.active_count(), 0);

        let envelope = rx.try_recv().unwrap();
        assert!(matches!(
            envelope.event,
            WorkerEvent::SessionCompleted { session_db_id, .. } if session_db_id == id
        ));
        assert!(rx.try_recv().is_err());

        assert!(matches!(
            registry.get_or_create("ext-1", "p", "again").unwrap(),
            Registered::Closed { session_db_id } if session_db_id == id
        ));
    }

    #[test]
    fn test_list_active_and_close_stale() {
        let (registry, _, _) = registry();
        let (a, _) = active(registry.get_or_create("ext-a", "p", "hi").unwrap());
        registry.get_or_create("ext-b", "p", "hi").unwrap();

        let infos = registry.list_active().unwrap();
        assert_eq!(infos.len(), 2);
        assert!(infos.iter().all(|i| !i.is_stale && i.has_consumer));

        // with a negative threshold every open session counts as stale
        let closed = registry.close_stale(-1).unwrap();
        assert_eq!(closed.len(), 2);
        assert!(closed.contains(&a.session_db_id));
        assert!(registry.list_active().unwrap().is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let (registry, _, _) = registry();
        let (session, _) = active(registry.get_or_create("ext-1", "p", "").unwrap());
        for i in 0..5 {
            registry.begin_turn(session.session_db_id, &format!("prompt {}", i)).unwrap();
        }
        let history = session.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, "prompt 2");
        assert_eq!(session.prompt_counter(), 5);
    }
}
