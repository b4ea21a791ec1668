//! Storage fixtures and test setup helpers.

use skiff_storage::{BucketStorage, StorageConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Bucket storage with automatic cleanup.
pub struct TestStorage {
    /// The storage instance.
    pub storage: Arc<BucketStorage>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestStorage {
    /// Creates in-memory storage.
    pub fn memory() -> Self {
        Self {
            storage: Arc::new(
                BucketStorage::in_memory().expect("Failed to open in-memory storage"),
            ),
            _temp_dir: None,
        }
    }

    /// Creates file-backed storage in a fresh temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("test.db");
        let storage =
            BucketStorage::open(StorageConfig::file(&path)).expect("Failed to open file storage");
        Self {
            storage: Arc::new(storage),
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the database path if file-backed.
    pub fn path(&self) -> Option<PathBuf> {
        self.storage.path().map(Path::to_path_buf)
    }

    /// Opens a second handle on the same file.
    ///
    /// Panics for in-memory storage.
    pub fn reopen(&self) -> Arc<BucketStorage> {
        let path = self.path().expect("in-memory storage can not be reopened");
        Arc::new(BucketStorage::open(StorageConfig::file(path)).expect("Failed to reopen storage"))
    }

    /// Returns a shared handle.
    pub fn shared(&self) -> Arc<BucketStorage> {
        Arc::clone(&self.storage)
    }
}

impl std::ops::Deref for TestStorage {
    type Target = Arc<BucketStorage>;

    fn deref(&self) -> &Self::Target {
        &self.storage
    }
}

/// Runs a test with temporary in-memory storage.
pub fn with_temp_storage<F, R>(f: F) -> R
where
    F: FnOnce(&Arc<BucketStorage>) -> R,
{
    let storage = TestStorage::memory();
    f(&storage.storage)
}

/// Runs a test with temporary file-backed storage.
pub fn with_file_storage<F, R>(f: F) -> R
where
    F: FnOnce(&Arc<BucketStorage>, &Path) -> R,
{
    let storage = TestStorage::file();
    let path = storage.path().expect("File storage should have a path");
    f(&storage.storage, &path)
}

/// Installs a test subscriber honoring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Prepared storage states.
pub mod scenarios {
    use super::*;
    use crate::generators::payload_checksum;
    use skiff_sync_protocol::{
        BucketChecksum, Checkpoint, Checksum, OplogEntry, SyncDataBatch, SyncDataBucket,
    };

    /// Storage with `rows` rows of table `items` synced through bucket `global`.
    pub fn synced_storage(rows: usize) -> TestStorage {
        let storage = TestStorage::memory();
        let entries: Vec<OplogEntry> = (0..rows)
            .map(|i| {
                let data = format!(r#"{{"n":{i}}}"#);
                let checksum = payload_checksum(&data);
                OplogEntry::put(i as i64 + 1, "items", format!("row_{i}"), data, checksum)
            })
            .collect();
        let total: Checksum = entries.iter().map(|e| e.checksum).sum();
        let last_op_id = rows as i64;

        storage
            .save_sync_data(&SyncDataBatch::new(vec![SyncDataBucket::new("global", entries)]))
            .expect("Failed to save sync data");
        let checkpoint = Checkpoint::new(
            last_op_id,
            vec![BucketChecksum::new("global", total).with_count(rows as i64)],
        );
        let result = storage
            .sync_local_database(&checkpoint, None)
            .expect("Failed to apply checkpoint");
        assert!(result.ready, "prepared checkpoint did not apply");
        storage
    }
}
