//! Worker database module - SQLite storage for sessions, the durable work queue and compressed outputs
pub mod migration;
pub mod observation_store;
pub mod queue_store;
pub mod schema;
pub mod session_store;

pub use migration::MigrationManager;
pub use observation_store::{ObservationStore, StoredOutputs};
pub use queue_store::QueueStore;
pub use schema::*;
pub use session_store::SessionStore;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::{info, warn};

pub type DbPool = Arc<Pool<SqliteConnectionManager>>;

/// Current wall clock in epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct MemoryDatabase {
    pub sessions: SessionStore,
    pub queue: QueueStore,
    pub outputs: ObservationStore,
    pool: DbPool,
}

impl MemoryDatabase {
    /// Open (or create) the database file, apply migrations and build the pool.
    /// Every pooled connection gets the same pragmas so concurrent writers
    /// wait on the busy timeout instead of failing.
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening worker database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA synchronous = NORMAL;
                     PRAGMA busy_timeout = 5000;",
                )
            });
        let pool = Pool::builder()
            .max_size(10)
            .connection_timeout(Duration::from_secs(10))
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            // journal_mode is persistent for the file, once is enough
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }

        info!("Worker database initialized successfully");
        Ok(Self::from_pool(Arc::new(pool)))
    }

    /// Private in-memory database. A single pooled connection keeps every
    /// caller on the same database.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;
        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        Ok(Self::from_pool(Arc::new(pool)))
    }

    fn from_pool(pool: DbPool) -> Self {
        Self {
            sessions: SessionStore::new(Arc::clone(&pool)),
            queue: QueueStore::new(Arc::clone(&pool)),
            outputs: ObservationStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    pub fn get_stats(&self) -> anyhow::Result<DatabaseStats> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }

    /// Cheap liveness probe used by the readiness endpoint.
    pub fn ping(&self) -> anyhow::Result<()> {
        let conn = self.pool.get()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
                warn!("WAL checkpoint on shutdown failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_database_initializes() {
        let dir = tempfile::tempdir().unwrap();
        let db = MemoryDatabase::new(&dir.path().join("nested").join("memory.db")).unwrap();
        db.ping().unwrap();
        assert_eq!(db.get_stats().unwrap().total_sessions, 0);
    }

    #[test]
    fn test_in_memory_database_shares_one_connection() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let id = db.sessions.upsert("ext-1", "proj", "hello").unwrap();
        assert!(db.sessions.get(id).unwrap().is_some());
        assert_eq!(db.get_stats().unwrap().total_sessions, 1);
    }
}
