//! Durable per-session work queue
//!
//! Items move `pending -> processing` through a single conditional UPDATE so
//! that two consumers can never claim the same row. A claimed item leaves the
//! table when its outputs are written (see `ObservationStore::store_outputs`),
//! or goes back to `pending` through an explicit reset.
use crate::memory_db::schema::*;
use crate::memory_db::{now_epoch_ms, DbPool};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info, warn};

const ITEM_COLUMNS: &str = "id, session_db_id, content_session_id, kind, tool_name, tool_input,
     tool_response, cwd, last_assistant_message, prompt_number, status, retry_count,
     created_at_epoch, started_processing_at_epoch";

/// Outcome of recording a failed processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Returned to `pending`, will be claimed again.
    Requeued { retry_count: i32 },
    /// Retry budget spent, parked in `failed`.
    Failed,
    /// The item no longer exists.
    Missing,
}

pub struct QueueStore {
    pool: DbPool,
}

impl QueueStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn enqueue(
        &self,
        session_db_id: i64,
        content_session_id: &str,
        prompt_number: i64,
        payload: &QueuePayload,
    ) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        let (tool_name, tool_input, tool_response, cwd, last_assistant_message) = match payload {
            QueuePayload::Observation {
                tool_name,
                tool_input,
                tool_response,
                cwd,
            } => (
                Some(tool_name.as_str()),
                Some(tool_input.as_str()),
                Some(tool_response.as_str()),
                cwd.as_deref(),
                None,
            ),
            QueuePayload::Summarize {
                last_assistant_message,
            } => (None, None, None, None, Some(last_assistant_message.as_str())),
        };

        conn.execute(
            "INSERT INTO queue_items
             (session_db_id, content_session_id, kind, tool_name, tool_input, tool_response,
              cwd, last_assistant_message, prompt_number, status, retry_count, created_at_epoch)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', 0, ?10)",
            params![
                session_db_id,
                content_session_id,
                payload.kind().as_str(),
                tool_name,
                tool_input,
                tool_response,
                cwd,
                last_assistant_message,
                prompt_number,
                now_epoch_ms(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(session_db_id, item_id = id, kind = payload.kind().as_str(), "Enqueued item");
        Ok(id)
    }

    /// Atomically claim the oldest pending item of a session.
    /// `None` means there is nothing to do.
    pub fn claim_next(&self, session_db_id: i64) -> anyhow::Result<Option<QueueItem>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "UPDATE queue_items
             SET status = 'processing', started_processing_at_epoch = ?2
             WHERE id = (
                 SELECT id FROM queue_items
                 WHERE session_db_id = ?1 AND status = 'pending'
                 ORDER BY created_at_epoch ASC, id ASC
                 LIMIT 1
             ) AND status = 'pending'
             RETURNING {}",
            ITEM_COLUMNS
        );
        let item = conn
            .query_row(&sql, params![session_db_id, now_epoch_ms()], |row| {
                Ok(row_to_item(row))
            })
            .optional()?;
        item.transpose()
    }

    /// Delete an item. Returns false when it was already gone.
    pub fn remove(&self, item_id: i64) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM queue_items WHERE id = ?1", [item_id])?;
        Ok(deleted > 0)
    }

    /// Items that are not parked as failed.
    pub fn count(&self) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM queue_items WHERE status IN ('pending', 'processing')",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn pending_count(&self, session_db_id: i64) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM queue_items WHERE session_db_id = ?1 AND status = 'pending'",
            [session_db_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn get(&self, item_id: i64) -> anyhow::Result<Option<QueueItem>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM queue_items WHERE id = ?1", ITEM_COLUMNS);
        let item = conn
            .query_row(&sql, [item_id], |row| Ok(row_to_item(row)))
            .optional()?;
        item.transpose()
    }

    /// Park every pending or processing item of a closed session in
    /// `failed`, where operators can still inspect or clear it.
    pub fn abandon_session(&self, session_db_id: i64) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let abandoned = conn.execute(
            "UPDATE queue_items SET status = 'failed', started_processing_at_epoch = NULL,
                    failed_at_epoch = ?2
             WHERE session_db_id = ?1 AND status IN ('pending', 'processing')",
            params![session_db_id, now_epoch_ms()],
        )?;
        Ok(abandoned)
    }

    /// Record a failed attempt: back to `pending` while `retry_count` is below
    /// `max_retries`, otherwise park the item in `failed`.
    pub fn mark_failed(&self, item_id: i64, max_retries: i32) -> anyhow::Result<FailureOutcome> {
        let conn = self.get_conn()?;
        let retry_count: Option<i32> = conn
            .query_row(
                "UPDATE queue_items SET
                    retry_count = retry_count + 1,
                    status = CASE WHEN retry_count + 1 < ?2 THEN 'pending' ELSE 'failed' END,
                    started_processing_at_epoch = NULL,
                    failed_at_epoch = CASE WHEN retry_count + 1 < ?2 THEN NULL ELSE ?3 END
                 WHERE id = ?1
                 RETURNING retry_count",
                params![item_id, max_retries, now_epoch_ms()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(match retry_count {
            None => FailureOutcome::Missing,
            Some(count) if count < max_retries => FailureOutcome::Requeued { retry_count: count },
            Some(count) => {
                warn!(item_id, retry_count = count, "Queue item exhausted retries");
                FailureOutcome::Failed
            }
        })
    }

    /// Reset items stuck in `processing` for longer than `threshold_ms`.
    /// Used at startup, when no consumer can legitimately hold a claim.
    pub fn reset_stale_processing(&self, threshold_ms: i64) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let cutoff = now_epoch_ms() - threshold_ms;
        let reset = conn.execute(
            "UPDATE queue_items SET status = 'pending', started_processing_at_epoch = NULL
             WHERE status = 'processing' AND started_processing_at_epoch <= ?1",
            [cutoff],
        )?;
        if reset > 0 {
            info!("Reset {} stale processing items to pending", reset);
        }
        Ok(reset)
    }

    /// Items that have been `processing` for longer than `threshold_ms`.
    pub fn stuck_count(&self, threshold_ms: i64) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        let cutoff = now_epoch_ms() - threshold_ms;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM queue_items
             WHERE status = 'processing' AND started_processing_at_epoch < ?1",
            [cutoff],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Sessions that own at least one pending item.
    pub fn sessions_with_pending(&self) -> anyhow::Result<Vec<i64>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT session_db_id FROM queue_items WHERE status = 'pending' ORDER BY session_db_id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    pub fn list(&self, limit: usize) -> anyhow::Result<Vec<QueueItem>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM queue_items ORDER BY created_at_epoch ASC, id ASC LIMIT ?1",
            ITEM_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([limit as i64])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(row_to_item(row)?);
        }
        Ok(items)
    }

    /// Operator retry: put a `failed` item back in line with a fresh budget.
    pub fn retry(&self, item_id: i64) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let changed = conn.execute(
            "UPDATE queue_items SET status = 'pending', retry_count = 0, failed_at_epoch = NULL
             WHERE id = ?1 AND status = 'failed'",
            [item_id],
        )?;
        Ok(changed > 0)
    }

    pub fn clear_failed(&self) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM queue_items WHERE status = 'failed'", [])?;
        if deleted > 0 {
            info!("Cleared {} failed queue items", deleted);
        }
        Ok(deleted)
    }
}

fn row_to_item(row: &Row) -> anyhow::Result<QueueItem> {
    let kind: String = row.get(3)?;
    let payload = match QueueItemKind::parse(&kind)? {
        QueueItemKind::Observation => QueuePayload::Observation {
            tool_name: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            tool_input: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            tool_response: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
            cwd: row.get(7)?,
        },
        QueueItemKind::Summarize => QueuePayload::Summarize {
            last_assistant_message: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        },
    };
    let status: String = row.get(10)?;
    Ok(QueueItem {
        id: row.get(0)?,
        session_db_id: row.get(1)?,
        content_session_id: row.get(2)?,
        payload,
        prompt_number: row.get(9)?,
        status: QueueItemStatus::parse(&status)?,
        retry_count: row.get(11)?,
        created_at_epoch: row.get(12)?,
        started_processing_at_epoch: row.get(13)?,
    })
}
