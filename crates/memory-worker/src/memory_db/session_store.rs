//! Session persistence
use crate::memory_db::schema::*;
use crate::memory_db::{now_epoch_ms, DbPool};
use chrono::{DateTime, TimeZone, Utc};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

const SESSION_COLUMNS: &str = "id, content_session_id, memory_session_id, project, user_prompt,
     prompt_counter, status, started_at, started_at_epoch, completed_at, completed_at_epoch";

pub struct SessionStore {
    pool: DbPool,
}

impl SessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Idempotent create keyed by the external id. A non-empty project
    /// replaces the stored one; the prompt is only filled while still empty.
    pub fn upsert(
        &self,
        content_session_id: &str,
        project: &str,
        user_prompt: &str,
    ) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        let now = Utc::now();
        let id: i64 = conn.query_row(
            "INSERT INTO sessions
             (content_session_id, project, user_prompt, status, started_at, started_at_epoch)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5)
             ON CONFLICT(content_session_id) DO UPDATE SET
                project = CASE WHEN excluded.project != '' THEN excluded.project ELSE sessions.project END,
                user_prompt = CASE WHEN sessions.user_prompt = '' THEN excluded.user_prompt ELSE sessions.user_prompt END
             RETURNING id",
            params![
                content_session_id,
                project,
                user_prompt,
                now.to_rfc3339(),
                now.timestamp_millis(),
            ],
            |row| row.get(0),
        )?;
        debug!("Upserted session {} -> {}", content_session_id, id);
        Ok(id)
    }

    pub fn get(&self, id: i64) -> anyhow::Result<Option<SessionRecord>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS);
        let record = conn
            .query_row(&sql, [id], |row| Ok(row_to_session(row)))
            .optional()?;
        record.transpose()
    }

    pub fn get_by_content_id(&self, content_session_id: &str) -> anyhow::Result<Option<SessionRecord>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM sessions WHERE content_session_id = ?1",
            SESSION_COLUMNS
        );
        let record = conn
            .query_row(&sql, [content_session_id], |row| Ok(row_to_session(row)))
            .optional()?;
        record.transpose()
    }

    pub fn set_memory_session_id(&self, id: i64, memory_session_id: &str) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE sessions SET memory_session_id = ?2 WHERE id = ?1",
            params![id, memory_session_id],
        )?;
        Ok(())
    }

    /// Advance the turn counter and return the new value.
    pub fn increment_prompt_counter(&self, id: i64) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        let counter = conn.query_row(
            "UPDATE sessions SET prompt_counter = prompt_counter + 1 WHERE id = ?1 RETURNING prompt_counter",
            [id],
            |row| row.get(0),
        )?;
        Ok(counter)
    }

    /// Move an active session to `completed`. Returns false when it was
    /// already completed (or does not exist).
    pub fn mark_completed(&self, id: i64) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let now = Utc::now();
        let changed = conn.execute(
            "UPDATE sessions SET status = 'completed', completed_at = ?2, completed_at_epoch = ?3
             WHERE id = ?1 AND status = 'active'",
            params![id, now.to_rfc3339(), now.timestamp_millis()],
        )?;
        Ok(changed > 0)
    }

    pub fn list_active(&self) -> anyhow::Result<Vec<SessionRecord>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM sessions WHERE status = 'active' ORDER BY started_at_epoch ASC",
            SESSION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next()? {
            sessions.push(row_to_session(row)?);
        }
        Ok(sessions)
    }

    /// Active sessions started before `now - threshold_ms`.
    pub fn list_started_before(&self, threshold_ms: i64) -> anyhow::Result<Vec<i64>> {
        let conn = self.get_conn()?;
        let cutoff = now_epoch_ms() - threshold_ms;
        let mut stmt = conn.prepare(
            "SELECT id FROM sessions WHERE status = 'active' AND started_at_epoch < ?1 ORDER BY id",
        )?;
        let ids = stmt
            .query_map([cutoff], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }
}

fn parse_timestamp(value: Option<String>, epoch: Option<i64>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|t| t.with_timezone(&Utc)))
        .or_else(|| epoch.and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
}

fn row_to_session(row: &Row) -> anyhow::Result<SessionRecord> {
    let status: String = row.get(6)?;
    let started_at_epoch: i64 = row.get(8)?;
    let completed_at_epoch: Option<i64> = row.get(10)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        content_session_id: row.get(1)?,
        memory_session_id: row.get(2)?,
        project: row.get(3)?,
        user_prompt: row.get(4)?,
        prompt_counter: row.get(5)?,
        status: SessionStatus::parse(&status),
        started_at: parse_timestamp(row.get(7)?, Some(started_at_epoch))
            .ok_or_else(|| anyhow::anyhow!("Invalid start timestamp for session"))?,
        started_at_epoch,
        completed_at: parse_timestamp(row.get(9)?, completed_at_epoch),
        completed_at_epoch,
    })
}

#[cfg(test)]
mod tests {
    use crate::memory_db::MemoryDatabase;

    // ===== Upsert Tests =====

    #[test]
    fn test_upsert_is_idempotent() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let first = db.sessions.upsert("ext-1", "proj-a", "hi").unwrap();
        let second = db.sessions.upsert("ext-1", "proj-a", "hi").unwrap();
        assert_eq!(first, second);
        assert_eq!(db.get_stats().unwrap().total_sessions, 1);
    }

    #[test]
    fn test_empty_project_does_not_erase_existing() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let id = db.sessions.upsert("ext-1", "proj-a", "hi").unwrap();
        db.sessions.upsert("ext-1", "", "").unwrap();

        let session = db.sessions.get(id).unwrap().unwrap();
        assert_eq!(session.project, "proj-a");
        assert_eq!(session.user_prompt, "hi");
    }

    #[test]
    fn test_project_last_write_wins_prompt_first_write_wins() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let id = db.sessions.upsert("ext-1", "proj-a", "").unwrap();
        db.sessions.upsert("ext-1", "proj-b", "first prompt").unwrap();
        db.sessions.upsert("ext-1", "proj-c", "second prompt").unwrap();

        let session = db.sessions.get(id).unwrap().unwrap();
        assert_eq!(session.project, "proj-c");
        assert_eq!(session.user_prompt, "first prompt");
    }

    // ===== Lifecycle Tests =====

    #[test]
    fn test_mark_completed_is_terminal() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let id = db.sessions.upsert("ext-1", "proj", "").unwrap();

        assert!(db.sessions.mark_completed(id).unwrap());
        assert!(!db.sessions.mark_completed(id).unwrap());

        let session = db.sessions.get(id).unwrap().unwrap();
        assert_eq!(session.status, super::SessionStatus::Completed);
        assert!(session.completed_at_epoch.is_some());
        assert!(db.sessions.list_active().unwrap().is_empty());
    }

    #[test]
    fn test_prompt_counter_and_memory_id() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let id = db.sessions.upsert("ext-1", "proj", "").unwrap();
        assert_eq!(db.sessions.increment_prompt_counter(id).unwrap(), 1);
        assert_eq!(db.sessions.increment_prompt_counter(id).unwrap(), 2);

        db.sessions.set_memory_session_id(id, "model-abc").unwrap();
        let session = db.sessions.get_by_content_id("ext-1").unwrap().unwrap();
        assert_eq!(session.memory_session_id.as_deref(), Some("model-abc"));
        assert_eq!(session.prompt_counter, 2);
    }

    #[test]
    fn test_missing_session_is_none() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        assert!(db.sessions.get(42).unwrap().is_none());
        assert!(db.sessions.get_by_content_id("nope").unwrap().is_none());
    }
}
