//! Cross-process single-instance guard for worker startup.
//!
//! The lock is the file `<dir>/spawn-<key>.lock` holding JSON metadata about
//! its owner. Acquisition never waits: if a live, fresh owner exists the
//! caller gets `None` and should poll the running instance's readiness
//! endpoint instead of starting a second one. An owner whose metadata has
//! not been refreshed within the stale window, or whose pid is gone, is
//! reclaimed.
//!
//! Reads and writes of the metadata file happen under an advisory `fs2` lock
//! on a sibling `.guard` file, held only for the duration of one check.

use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::memory_db::now_epoch_ms;
use crate::query::process_group::pid_alive;

#[derive(Debug, Error)]
pub enum SpawnLockError {
    #[error("lock io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockMetadata {
    pub pid: u32,
    pub nonce: String,
    pub acquired_at_ms: i64,
    pub refreshed_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct SpawnMutex {
    dir: PathBuf,
    stale_after: Duration,
}

/// Held lock. Dropping it releases the lock if it is still ours.
#[derive(Debug)]
pub struct SpawnLockGuard {
    lock_path: PathBuf,
    guard_path: PathBuf,
    nonce: String,
    refresher: CancellationToken,
    released: bool,
}

impl SpawnMutex {
    pub fn new(dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale_after,
        }
    }

    pub fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("spawn-{}.lock", sanitize_key(key)))
    }

    /// Run `f` while holding the lock for `key`. Returns `Ok(None)` without
    /// running `f` when another live owner holds it.
    pub async fn with_lock<F, Fut, T>(&self, key: &str, f: F) -> Result<Option<T>, SpawnLockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(mut guard) = self.try_acquire(key)? else {
            return Ok(None);
        };
        let result = f().await;
        guard.release()?;
        Ok(Some(result))
    }

    /// Fail-fast acquisition. While the guard lives a background task keeps
    /// the metadata fresh so the lock is not reclaimed from a slow holder.
    pub fn try_acquire(&self, key: &str) -> Result<Option<SpawnLockGuard>, SpawnLockError> {
        fs::create_dir_all(&self.dir)?;
        let lock_path = self.lock_path(key);
        let guard_path = guard_path_for(&lock_path);

        let guard_file = open_guard(&guard_path)?;
        if guard_file.try_lock_exclusive().is_err() {
            debug!("Spawn lock {} busy (guard held)", lock_path.display());
            return Ok(None);
        }

        let outcome = self.acquire_locked(&lock_path);
        let _ = guard_file.unlock();
        let Some(nonce) = outcome? else {
            return Ok(None);
        };

        let refresher = CancellationToken::new();
        if tokio::runtime::Handle::try_current().is_ok() {
            spawn_refresher(
                lock_path.clone(),
                guard_path.clone(),
                nonce.clone(),
                self.stale_after,
                refresher.clone(),
            );
        }

        info!("Acquired spawn lock {}", lock_path.display());
        Ok(Some(SpawnLockGuard {
            lock_path,
            guard_path,
            nonce,
            refresher,
            released: false,
        }))
    }

    /// Current owner, if any.
    pub fn holder(&self, key: &str) -> Result<Option<LockMetadata>, SpawnLockError> {
        read_metadata(&self.lock_path(key))
    }

    fn acquire_locked(&self, lock_path: &Path) -> Result<Option<String>, SpawnLockError> {
        match read_metadata(lock_path) {
            Ok(Some(existing)) => {
                if !self.is_stale(&existing) {
                    return Ok(None);
                }
                warn!(
                    pid = existing.pid,
                    "Reclaiming stale spawn lock {}",
                    lock_path.display()
                );
            }
            Ok(None) => {}
            Err(e) => warn!("Replacing unreadable spawn lock {}: {}", lock_path.display(), e),
        }

        let now = now_epoch_ms();
        let metadata = LockMetadata {
            pid: std::process::id(),
            nonce: uuid::Uuid::new_v4().to_string(),
            acquired_at_ms: now,
            refreshed_at_ms: now,
        };
        write_metadata(lock_path, &metadata)?;
        Ok(Some(metadata.nonce))
    }

    fn is_stale(&self, metadata: &LockMetadata) -> bool {
        let age_ms = now_epoch_ms() - metadata.refreshed_at_ms;
        age_ms > self.stale_after.as_millis() as i64 || !pid_alive(metadata.pid)
    }
}

impl SpawnLockGuard {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Remove the lock file if it still carries our nonce.
    pub fn release(&mut self) -> Result<(), SpawnLockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.refresher.cancel();

        let guard_file = open_guard(&self.guard_path)?;
        guard_file.lock_exclusive()?;
        let result = match read_metadata(&self.lock_path) {
            Ok(Some(current)) if current.nonce == self.nonce => {
                fs::remove_file(&self.lock_path).map_err(SpawnLockError::from)
            }
            Ok(_) => {
                warn!(
                    "Spawn lock {} was taken over, leaving it in place",
                    self.lock_path.display()
                );
                Ok(())
            }
            Err(e) => Err(e),
        };
        let _ = guard_file.unlock();
        if result.is_ok() {
            info!("Released spawn lock {}", self.lock_path.display());
        }
        result
    }
}

impl Drop for SpawnLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to release spawn lock {}: {}", self.lock_path.display(), e);
        }
    }
}

fn spawn_refresher(
    lock_path: PathBuf,
    guard_path: PathBuf,
    nonce: String,
    stale_after: Duration,
    cancel: CancellationToken,
) {
    let period = (stale_after / 3).max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match refresh(&lock_path, &guard_path, &nonce) {
                        Ok(Refresh::Refreshed) => {}
                        Ok(Refresh::Busy) => debug!("Spawn lock guard busy, skipping refresh"),
                        Ok(Refresh::Lost) => {
                            warn!("Spawn lock {} lost, stopping refresh", lock_path.display());
                            break;
                        }
                        Err(e) => warn!("Spawn lock refresh failed: {}", e),
                    }
                }
            }
        }
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refresh {
    Refreshed,
    /// Someone else holds the guard right now; try again next tick.
    Busy,
    Lost,
}

/// Never blocks: runs on the async runtime, so a contended guard skips
/// this tick instead of waiting for it.
fn refresh(lock_path: &Path, guard_path: &Path, nonce: &str) -> Result<Refresh, SpawnLockError> {
    let guard_file = open_guard(guard_path)?;
    if let Err(e) = guard_file.try_lock_exclusive() {
        if e.kind() == fs2::lock_contended_error().kind() {
            return Ok(Refresh::Busy);
        }
        return Err(e.into());
    }
    let result = match read_metadata(lock_path) {
        Ok(Some(mut current)) if current.nonce == nonce => {
            current.refreshed_at_ms = now_epoch_ms();
            write_metadata(lock_path, &current).map(|_| Refresh::Refreshed)
        }
        Ok(_) => Ok(Refresh::Lost),
        Err(e) => Err(e),
    };
    let _ = guard_file.unlock();
    result
}

fn guard_path_for(lock_path: &Path) -> PathBuf {
    let mut name = lock_path.as_os_str().to_owned();
    name.push(".guard");
    PathBuf::from(name)
}

fn open_guard(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn read_metadata(path: &Path) -> Result<Option<LockMetadata>, SpawnLockError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_metadata(path: &Path, metadata: &LockMetadata) -> Result<(), SpawnLockError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(serde_json::to_string(metadata)?.as_bytes())?;
    file.flush()?;
    Ok(())
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
