//! Cross-process ownership of the sync stream.
//!
//! Several processes may open the same database file. Only the one
//! holding the exclusive lock on `<database>.sync-lock` opens the network
//! stream and runs the upload loop. The operating system releases the lock
//! when the owner exits, so a waiting process takes over without cleanup.

use crate::error::{SyncError, SyncResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Exclusive advisory lock held by the process that owns the sync stream.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    _file: File,
}

impl ProcessLock {
    /// Returns the lock file path for a database file.
    pub fn lock_path(database: &Path) -> PathBuf {
        let mut name = database.as_os_str().to_owned();
        name.push(".sync-lock");
        PathBuf::from(name)
    }

    /// Takes the lock if no other process holds it.
    pub fn try_acquire(path: &Path) -> SyncResult<Option<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }
        debug!(path = %path.display(), "acquired sync lock");
        Ok(Some(Self {
            path: path.to_path_buf(),
            _file: file,
        }))
    }

    /// Polls for the lock until `timeout` elapses.
    ///
    /// Returns `None` if another process kept the lock for the whole
    /// timeout and [`SyncError::Cancelled`] if `cancel` fired first.
    pub async fn acquire(
        path: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> SyncResult<Option<Self>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(Some(lock));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = POLL_INTERVAL.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Returns the lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "released sync lock");
    }
}
