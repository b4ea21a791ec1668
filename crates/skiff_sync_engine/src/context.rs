//! State shared by the streaming and upload tasks of one connection.

use crate::config::SyncOptions;
use crate::connector::{Connector, CredentialsCache};
use crate::error::SyncResult;
use crate::remote::SyncRemote;
use crate::status::{StatusPublisher, SyncStatus};
use crate::subscriptions::SubscriptionManager;
use skiff_storage::{BucketStorage, StorageResult};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub(crate) struct SyncContext {
    pub(crate) storage: Arc<BucketStorage>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) remote: Arc<dyn SyncRemote>,
    pub(crate) options: SyncOptions,
    pub(crate) status: StatusPublisher,
    pub(crate) credentials: CredentialsCache,
    pub(crate) subscriptions: Arc<SubscriptionManager>,
    /// Signalled by the upload loop once the queue is drained.
    pub(crate) upload_completed: Notify,
    /// Signalled by the change feed whenever `ps_crud` changes.
    pub(crate) crud_changed: Arc<Notify>,
    pub(crate) cancel: CancellationToken,
}

impl SyncContext {
    /// Runs a storage call on the blocking pool.
    pub(crate) async fn blocking<T, F>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&Arc<BucketStorage>) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = Arc::clone(&self.storage);
        Ok(tokio::task::spawn_blocking(move || f(&storage)).await??)
    }

    pub(crate) fn update_status(&self, f: impl FnOnce(&mut SyncStatus)) {
        self.status.update(f);
    }

    /// Sleeps unless cancelled. Returns false if cancelled.
    pub(crate) async fn sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
