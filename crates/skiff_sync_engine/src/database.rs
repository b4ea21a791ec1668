//! The application-facing database handle.

use crate::config::SyncOptions;
use crate::connector::{Connector, CredentialsCache};
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::remote::SyncRemote;
use crate::status::{StatusPublisher, SyncStatus};
use crate::streaming::run_sync;
use crate::subscriptions::{SubscriptionManager, SyncStream};
use parking_lot::Mutex;
use serde_json::Value;
use skiff_storage::{
    BucketStorage, CrudBatch, CrudTransaction, LocalWriteTransaction, StorageConfig, StorageResult,
    TableUpdate,
};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct ActiveSync {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A local database that syncs with a remote service.
///
/// Local reads and writes work without a connection. [`SyncDatabase::connect`]
/// starts downloading remote changes and uploading queued local writes in
/// the background until [`SyncDatabase::disconnect`] is called or the
/// handle is dropped.
///
/// # Example
///
/// ```rust,no_run
/// use skiff_storage::StorageConfig;
/// use skiff_sync_engine::{MockConnector, MockRemote, SyncDatabase, SyncOptions};
/// use std::sync::Arc;
///
/// # async fn run() -> skiff_sync_engine::SyncResult<()> {
/// let db = SyncDatabase::open(StorageConfig::file("app.db"))?;
/// let (remote, _connections) = MockRemote::new();
/// let connector = Arc::new(MockConnector::signed_in("https://sync.example.com"));
///
/// db.connect(connector, Arc::new(remote), SyncOptions::default()).await?;
/// db.wait_for_first_sync(None).await;
/// db.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub struct SyncDatabase {
    storage: Arc<BucketStorage>,
    status: StatusPublisher,
    subscriptions: Arc<SubscriptionManager>,
    crud_changed: Arc<Notify>,
    active: Mutex<Option<ActiveSync>>,
}

impl SyncDatabase {
    /// Opens or creates a database.
    pub fn open(config: StorageConfig) -> SyncResult<Self> {
        let storage = Arc::new(BucketStorage::open(config)?);
        Self::with_storage(storage)
    }

    /// Opens an in-memory database.
    pub fn in_memory() -> SyncResult<Self> {
        Self::open(StorageConfig::in_memory())
    }

    /// Wraps already opened storage.
    pub fn with_storage(storage: Arc<BucketStorage>) -> SyncResult<Self> {
        let status = StatusPublisher::new(SyncStatus::from_storage(&storage)?);
        let subscriptions = Arc::new(SubscriptionManager::new(
            Arc::clone(&storage),
            status.clone(),
        ));

        let crud_changed = Arc::new(Notify::new());
        let notify = Arc::clone(&crud_changed);
        storage.change_feed().add_listener(move |update| {
            if update.touches_crud() {
                notify.notify_one();
            }
        });

        Ok(Self {
            storage,
            status,
            subscriptions,
            crud_changed,
            active: Mutex::new(None),
        })
    }

    /// Starts syncing.
    ///
    /// Resolves once the first stream is open, the first attempt failed
    /// with a transient error (reported in [`SyncDatabase::status`]), or
    /// another process turned out to own the sync stream. Fails only for
    /// errors that retrying can not fix, such as missing credentials.
    ///
    /// An existing connection is closed first.
    pub async fn connect(
        &self,
        connector: Arc<dyn Connector>,
        remote: Arc<dyn SyncRemote>,
        options: SyncOptions,
    ) -> SyncResult<()> {
        self.disconnect().await;

        let cancel = CancellationToken::new();
        let credentials =
            CredentialsCache::new(Arc::clone(&connector), options.credentials_refresh_margin);
        let ctx = Arc::new(SyncContext {
            storage: Arc::clone(&self.storage),
            connector,
            remote,
            options,
            status: self.status.clone(),
            credentials,
            subscriptions: Arc::clone(&self.subscriptions),
            upload_completed: Notify::new(),
            crud_changed: Arc::clone(&self.crud_changed),
            cancel: cancel.clone(),
        });

        let (first_tx, first_rx) = oneshot::channel();
        let task = tokio::spawn(run_sync(ctx, first_tx));
        *self.active.lock() = Some(ActiveSync { cancel, task });
        info!("sync connecting");

        match first_rx.await {
            Ok(Err(SyncError::Cancelled)) => Ok(()),
            Ok(result) => result,
            Err(_) => Err(SyncError::Task("sync task ended before connecting".into())),
        }
    }

    /// Stops syncing. Does nothing if not connected.
    pub async fn disconnect(&self) {
        let active = self.active.lock().take();
        let Some(active) = active else {
            return;
        };
        active.cancel.cancel();
        if let Err(err) = active.task.await {
            warn!(error = %err, "sync task failed");
        }
        debug!("sync disconnected");
    }

    /// Stops syncing and deletes all synced and local data.
    ///
    /// The client id is kept.
    pub async fn disconnect_and_clear(&self) -> SyncResult<()> {
        self.disconnect().await;
        let storage = Arc::clone(&self.storage);
        let status = tokio::task::spawn_blocking(move || {
            storage.clear()?;
            SyncStatus::from_storage(&storage)
        })
        .await??;
        self.status.replace(status);
        Ok(())
    }

    /// Returns true while a connection is active or retrying.
    pub fn is_syncing(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|a| !a.task.is_finished())
    }

    /// Returns the current status.
    pub fn status(&self) -> SyncStatus {
        self.status.current()
    }

    /// Returns a receiver notified on every status change.
    pub fn status_receiver(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Waits until buckets up to `priority`, or everything, have synced.
    pub async fn wait_for_first_sync(&self, priority: Option<i32>) {
        let mut rx = self.status.subscribe();
        // The sender lives in `self`, so waiting can not fail.
        let _ = rx.wait_for(|s| s.has_synced_priority(priority)).await;
    }

    /// Returns a handle for a stream with the given parameters.
    pub fn sync_stream(&self, name: impl Into<String>, parameters: Option<Value>) -> SyncStream {
        SyncStream::new(name, parameters, Arc::clone(&self.subscriptions))
    }

    /// Runs local writes in one transaction and queues them for upload.
    pub fn write_transaction<T>(
        &self,
        f: impl FnOnce(&mut LocalWriteTransaction<'_>) -> StorageResult<T>,
    ) -> SyncResult<T> {
        Ok(self.storage.write_transaction(f)?)
    }

    /// Returns up to `limit` queued writes.
    pub fn get_crud_batch(&self, limit: usize) -> SyncResult<Option<CrudBatch>> {
        Ok(self.storage.get_crud_batch(limit)?)
    }

    /// Returns the writes of the oldest queued transaction.
    pub fn get_next_crud_transaction(&self) -> SyncResult<Option<CrudTransaction>> {
        Ok(self.storage.next_crud_transaction()?)
    }

    /// Subscribes to table change notifications.
    pub fn subscribe_changes(&self) -> Receiver<TableUpdate> {
        self.storage.subscribe_changes()
    }

    /// Returns the persistent client id.
    pub fn client_id(&self) -> SyncResult<String> {
        Ok(self.storage.client_id()?)
    }

    /// Returns the underlying storage.
    pub fn storage(&self) -> &Arc<BucketStorage> {
        &self.storage
    }
}

impl Drop for SyncDatabase {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for SyncDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncDatabase")
            .field("path", &self.storage.path())
            .field("syncing", &self.is_syncing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn local_writes_without_connection() {
        let db = SyncDatabase::in_memory().unwrap();
        db.write_transaction(|tx| tx.put("todos", "t1", Map::new()))
            .unwrap();

        let batch = db.get_crud_batch(10).unwrap().unwrap();
        assert_eq!(batch.crud.len(), 1);
        assert!(!batch.has_more);
        assert!(!db.is_syncing());
        assert_eq!(db.status().has_synced, Some(false));
    }

    #[test]
    fn client_id_is_stable() {
        let db = SyncDatabase::in_memory().unwrap();
        assert_eq!(db.client_id().unwrap(), db.client_id().unwrap());
    }

    #[tokio::test]
    async fn disconnect_without_connect_is_noop() {
        let db = SyncDatabase::in_memory().unwrap();
        db.disconnect().await;
        db.disconnect().await;
        assert!(!db.status().connected);
    }

    #[tokio::test]
    async fn crud_writes_wake_uploads() {
        let db = SyncDatabase::in_memory().unwrap();
        db.write_transaction(|tx| tx.put("todos", "t1", Map::new()))
            .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), db.crud_changed.notified())
            .await
            .unwrap();
    }
}
