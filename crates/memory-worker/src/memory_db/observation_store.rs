//! Observation, summary and raw response storage
use crate::memory_db::schema::*;
use crate::memory_db::{now_epoch_ms, DbPool};
use chrono::Utc;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Everything written for one processed item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredOutputs {
    pub observations: Vec<StoredObservation>,
    pub summary: Option<StoredSummary>,
}

impl StoredOutputs {
    pub fn len(&self) -> usize {
        self.observations.len() + usize::from(self.summary.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ObservationStore {
    pool: DbPool,
}

impl ObservationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Write parsed outputs in one transaction. When `consumed_item` is set
    /// the queue item is deleted in the same transaction, so an item is gone
    /// exactly when its outputs exist.
    pub fn store_outputs(
        &self,
        ctx: &OutputContext,
        observations: &[ParsedObservation],
        summary: Option<&ParsedSummary>,
        consumed_item: Option<i64>,
    ) -> anyhow::Result<StoredOutputs> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now();
        let created_at = now.to_rfc3339();
        let created_at_epoch = now.timestamp_millis();

        let mut stored = StoredOutputs::default();
        for obs in observations {
            tx.execute(
                "INSERT INTO observations
                 (session_db_id, memory_session_id, project, type, title, subtitle, narrative,
                  facts, concepts, files_read, files_modified, prompt_number, discovery_tokens,
                  created_at, created_at_epoch)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    ctx.session_db_id,
                    ctx.memory_session_id,
                    ctx.project,
                    obs.obs_type.as_str(),
                    obs.title,
                    obs.subtitle,
                    obs.narrative,
                    serde_json::to_string(&obs.facts)?,
                    serde_json::to_string(&obs.concepts)?,
                    serde_json::to_string(&obs.files_read)?,
                    serde_json::to_string(&obs.files_modified)?,
                    ctx.prompt_number,
                    ctx.discovery_tokens,
                    created_at,
                    created_at_epoch,
                ],
            )?;
            stored.observations.push(StoredObservation {
                id: tx.last_insert_rowid(),
                session_db_id: ctx.session_db_id,
                memory_session_id: ctx.memory_session_id.clone(),
                project: ctx.project.clone(),
                prompt_number: ctx.prompt_number,
                discovery_tokens: ctx.discovery_tokens,
                created_at_epoch,
                body: obs.clone(),
            });
        }

        if let Some(summary) = summary {
            tx.execute(
                "INSERT INTO summaries
                 (session_db_id, memory_session_id, project, request, investigated, learned,
                  completed, next_steps, notes, prompt_number, discovery_tokens,
                  created_at, created_at_epoch)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    ctx.session_db_id,
                    ctx.memory_session_id,
                    ctx.project,
                    summary.request,
                    summary.investigated,
                    summary.learned,
                    summary.completed,
                    summary.next_steps,
                    summary.notes,
                    ctx.prompt_number,
                    ctx.discovery_tokens,
                    created_at,
                    created_at_epoch,
                ],
            )?;
            stored.summary = Some(StoredSummary {
                id: tx.last_insert_rowid(),
                session_db_id: ctx.session_db_id,
                memory_session_id: ctx.memory_session_id.clone(),
                project: ctx.project.clone(),
                prompt_number: ctx.prompt_number,
                discovery_tokens: ctx.discovery_tokens,
                created_at_epoch,
                body: summary.clone(),
            });
        }

        if let Some(item_id) = consumed_item {
            tx.execute("DELETE FROM queue_items WHERE id = ?1", [item_id])?;
        }

        tx.commit()?;
        debug!(
            session_db_id = ctx.session_db_id,
            observations = stored.observations.len(),
            summary = stored.summary.is_some(),
            "Stored outputs"
        );
        Ok(stored)
    }

    /// Titles of the most recent observations of a session, newest first.
    pub fn recent_titles(&self, session_db_id: i64, limit: usize) -> anyhow::Result<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT title FROM observations
             WHERE session_db_id = ?1 AND title IS NOT NULL AND title != ''
             ORDER BY created_at_epoch DESC, id DESC LIMIT ?2",
        )?;
        let titles = stmt
            .query_map(params![session_db_id, limit as i64], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(titles)
    }

    pub fn get_session_observations(&self, session_db_id: i64) -> anyhow::Result<Vec<StoredObservation>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_db_id, memory_session_id, project, type, title, subtitle, narrative,
                    facts, concepts, files_read, files_modified, prompt_number, discovery_tokens,
                    created_at_epoch
             FROM observations WHERE session_db_id = ?1 ORDER BY created_at_epoch ASC, id ASC",
        )?;
        let mut rows = stmt.query([session_db_id])?;
        let mut observations = Vec::new();
        while let Some(row) = rows.next()? {
            observations.push(row_to_observation(row)?);
        }
        Ok(observations)
    }

    pub fn get_session_summaries(&self, session_db_id: i64) -> anyhow::Result<Vec<StoredSummary>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_db_id, memory_session_id, project, request, investigated, learned,
                    completed, next_steps, notes, prompt_number, discovery_tokens, created_at_epoch
             FROM summaries WHERE session_db_id = ?1 ORDER BY created_at_epoch ASC, id ASC",
        )?;
        let summaries = stmt
            .query_map([session_db_id], |row| {
                Ok(StoredSummary {
                    id: row.get(0)?,
                    session_db_id: row.get(1)?,
                    memory_session_id: row.get(2)?,
                    project: row.get(3)?,
                    body: ParsedSummary {
                        request: row.get(4)?,
                        investigated: row.get(5)?,
                        learned: row.get(6)?,
                        completed: row.get(7)?,
                        next_steps: row.get(8)?,
                        notes: row.get(9)?,
                    },
                    prompt_number: row.get(10)?,
                    discovery_tokens: row.get(11)?,
                    created_at_epoch: row.get(12)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(summaries)
    }

    /// Observation and summary rows of a session.
    pub fn count_for_session(&self, session_db_id: i64) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        let count = conn.query_row(
            "SELECT (SELECT COUNT(*) FROM observations WHERE session_db_id = ?1)
                  + (SELECT COUNT(*) FROM summaries WHERE session_db_id = ?1)",
            [session_db_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn store_raw_response(
        &self,
        item: &QueueItem,
        response_text: &str,
        discovery_tokens: i64,
    ) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO raw_responses
             (queue_item_id, session_db_id, kind, prompt_number, response_text,
              discovery_tokens, created_at_epoch)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                item.id,
                item.session_db_id,
                item.payload.kind().as_str(),
                item.prompt_number,
                response_text,
                discovery_tokens,
                now_epoch_ms(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_raw_response(&self, id: i64) -> anyhow::Result<Option<RawResponse>> {
        let conn = self.get_conn()?;
        let raw = conn
            .query_row(
                "SELECT id, queue_item_id, session_db_id, kind, prompt_number, response_text,
                        discovery_tokens, created_at_epoch
                 FROM raw_responses WHERE id = ?1",
                [id],
                |row| {
                    let kind: String = row.get(3)?;
                    Ok((kind, RawResponse {
                        id: row.get(0)?,
                        queue_item_id: row.get(1)?,
                        session_db_id: row.get(2)?,
                        kind: QueueItemKind::Observation,
                        prompt_number: row.get(4)?,
                        response_text: row.get(5)?,
                        discovery_tokens: row.get(6)?,
                        created_at_epoch: row.get(7)?,
                    }))
                },
            )
            .optional()?;

        match raw {
            Some((kind, mut raw)) => {
                raw.kind = QueueItemKind::parse(&kind)?;
                Ok(Some(raw))
            }
            None => Ok(None),
        }
    }
}

fn parse_list(value: String) -> Vec<String> {
    serde_json::from_str(&value).unwrap_or_default()
}

fn row_to_observation(row: &Row) -> anyhow::Result<StoredObservation> {
    let obs_type: String = row.get(4)?;
    Ok(StoredObservation {
        id: row.get(0)?,
        session_db_id: row.get(1)?,
        memory_session_id: row.get(2)?,
        project: row.get(3)?,
        body: ParsedObservation {
            obs_type: ObservationType::parse(&obs_type).unwrap_or(ObservationType::Discovery),
            title: row.get(5)?,
            subtitle: row.get(6)?,
            narrative: row.get(7)?,
            facts: parse_list(row.get(8)?),
            concepts: parse_list(row.get(9)?),
            files_read: parse_list(row.get(10)?),
            files_modified: parse_list(row.get(11)?),
        },
        prompt_number: row.get(12)?,
        discovery_tokens: row.get(13)?,
        created_at_epoch: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::MemoryDatabase;

    fn sample_observation(title: &str) -> ParsedObservation {
        ParsedObservation {
            obs_type: ObservationType::Feature,
            title: Some(title.to_string()),
            subtitle: None,
            narrative: Some("Added a thing".to_string()),
            facts: vec!["fact one".to_string(), "fact two".to_string()],
            concepts: vec!["how-it-works".to_string()],
            files_read: vec![],
            files_modified: vec!["src/lib.rs".to_string()],
        }
    }

    fn context(session_db_id: i64) -> OutputContext {
        OutputContext {
            session_db_id,
            memory_session_id: Some("model-1".to_string()),
            project: "proj".to_string(),
            prompt_number: 2,
            discovery_tokens: 120,
        }
    }

    #[test]
    fn test_store_outputs_consumes_queue_item() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let session = db.sessions.upsert("ext-1", "proj", "").unwrap();
        let item = db
            .queue
            .enqueue(
                session,
                "ext-1",
                2,
                &QueuePayload::Summarize {
                    last_assistant_message: "bye".to_string(),
                },
            )
            .unwrap();

        let summary = ParsedSummary {
            request: Some("Fix login".to_string()),
            ..Default::default()
        };
        let stored = db
            .outputs
            .store_outputs(
                &context(session),
                &[sample_observation("First"), sample_observation("Second")],
                Some(&summary),
                Some(item),
            )
            .unwrap();

        assert_eq!(stored.len(), 3);
        assert!(db.queue.get(item).unwrap().is_none());
        assert_eq!(db.outputs.count_for_session(session).unwrap(), 3);

        let observations = db.outputs.get_session_observations(session).unwrap();
        assert_eq!(observations[0].body, sample_observation("First"));
        assert_eq!(observations[1].memory_session_id.as_deref(), Some("model-1"));
        assert_eq!(db.outputs.recent_titles(session, 1).unwrap(), vec!["Second".to_string()]);

        let summaries = db.outputs.get_session_summaries(session).unwrap();
        assert_eq!(summaries[0].body.request.as_deref(), Some("Fix login"));
    }

    #[test]
    fn test_raw_response_roundtrip() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let session = db.sessions.upsert("ext-1", "proj", "").unwrap();
        db.queue
            .enqueue(
                session,
                "ext-1",
                1,
                &QueuePayload::Summarize {
                    last_assistant_message: "x".to_string(),
                },
            )
            .unwrap();
        let item = db.queue.claim_next(session).unwrap().unwrap();

        let id = db.outputs.store_raw_response(&item, "<summary/>", 42).unwrap();
        let raw = db.outputs.get_raw_response(id).unwrap().unwrap();
        assert_eq!(raw.kind, QueueItemKind::Summarize);
        assert_eq!(raw.queue_item_id, item.id);
        assert_eq!(raw.discovery_tokens, 42);
        assert!(db.outputs.get_raw_response(id + 1).unwrap().is_none());
    }
}
