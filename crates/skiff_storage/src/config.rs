//! Storage configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for opening bucket storage.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Database file. `None` opens a private in-memory database.
    pub path: Option<PathBuf>,

    /// How long a writer waits for the write lock before failing.
    ///
    /// Also used as the SQLite busy timeout for writers in other processes.
    pub lock_timeout: Duration,

    /// Whether PATCH and DELETE entries capture the previous column values.
    pub track_previous_values: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            lock_timeout: Duration::from_secs(30),
            track_previous_values: false,
        }
    }
}

impl StorageConfig {
    /// Creates an in-memory configuration.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Creates a configuration for a database file.
    #[must_use]
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// Sets the write lock timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets whether previous values are tracked.
    #[must_use]
    pub const fn track_previous_values(mut self, value: bool) -> Self {
        self.track_previous_values = value;
        self
    }
}
