//! Externally visible sync status.
//!
//! The status is published through a [`tokio::sync::watch`] channel. The
//! process that owns the sync stream also stores a JSON snapshot in the
//! database so that other processes sharing the file can mirror it.

use crate::error::SyncResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skiff_storage::{BucketStorage, LocalBucketProgress, StorageResult};
use skiff_sync_protocol::{Checkpoint, FULL_SYNC_PRIORITY};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

/// Key of the shared status snapshot in `ps_kv`.
pub const STATUS_KEY: &str = "sync_status";

/// Sync state of one priority level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPriorityStatus {
    /// Priority level.
    pub priority: i32,
    /// When buckets up to this priority were last applied.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Whether buckets up to this priority were applied at least once.
    pub has_synced: Option<bool>,
}

/// Download counters of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketProgress {
    /// Bucket priority.
    pub priority: i32,
    /// Operations stored when the last checkpoint was applied.
    pub at_last: i64,
    /// Operations downloaded since.
    pub since_last: i64,
    /// Operations the current checkpoint declares.
    pub target_count: i64,
}

/// Downloaded and total operation counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounters {
    /// Operations downloaded towards the current checkpoint.
    pub downloaded: i64,
    /// Operations the current checkpoint requires.
    pub total: i64,
}

impl ProgressCounters {
    /// Returns the downloaded share in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.total <= 0 {
            return 0.0;
        }
        (self.downloaded as f64 / self.total as f64).clamp(0.0, 1.0)
    }
}

/// Download progress towards the current checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Counters per bucket.
    pub buckets: BTreeMap<String, BucketProgress>,
}

impl SyncProgress {
    /// Builds progress from a checkpoint and the stored counters.
    ///
    /// Buckets the checkpoint does not declare a count for are treated as
    /// already complete. When the stored counters are inconsistent with
    /// the checkpoint (for example after the bucket was reset on the
    /// server) the bucket starts over from zero.
    pub fn for_checkpoint(
        checkpoint: &Checkpoint,
        local: &BTreeMap<String, LocalBucketProgress>,
    ) -> Self {
        let buckets = checkpoint
            .buckets
            .iter()
            .map(|bucket| {
                let stored = local.get(&bucket.bucket).copied().unwrap_or_default();
                let mut at_last = stored.at_last;
                let mut since_last = stored.since_last;
                let target_count = bucket.count.unwrap_or(at_last + since_last);
                if at_last + since_last > target_count {
                    at_last = 0;
                    since_last = 0;
                }
                let progress = BucketProgress {
                    priority: bucket.effective_priority(),
                    at_last,
                    since_last,
                    target_count,
                };
                (bucket.bucket.clone(), progress)
            })
            .collect();
        Self { buckets }
    }

    /// Counts newly downloaded operations for a bucket.
    pub fn increment(&mut self, bucket: &str, operations: i64) {
        if let Some(progress) = self.buckets.get_mut(bucket) {
            progress.since_last += operations;
        }
    }

    /// Progress over all buckets with a priority number at or below `priority`.
    pub fn until_priority(&self, priority: i32) -> ProgressCounters {
        self.buckets
            .values()
            .filter(|b| b.priority <= priority)
            .fold(ProgressCounters::default(), |acc, b| ProgressCounters {
                downloaded: acc.downloaded + b.since_last,
                total: acc.total + (b.target_count - b.at_last),
            })
    }

    /// Progress over all buckets.
    pub fn overall(&self) -> ProgressCounters {
        self.until_priority(FULL_SYNC_PRIORITY)
    }
}

/// Upload and download activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataFlowStatus {
    /// An upload is in progress.
    pub uploading: bool,
    /// A checkpoint is being downloaded.
    pub downloading: bool,
    /// Last download error, cleared by the next successful checkpoint.
    pub download_error: Option<String>,
    /// Last upload error, cleared by the next successful upload.
    pub upload_error: Option<String>,
    /// Progress while downloading.
    pub download_progress: Option<SyncProgress>,
}

/// Status of one stream subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStreamStatus {
    /// Stream name.
    pub name: String,
    /// Stream parameters.
    pub parameters: Option<Value>,
    /// Whether the service syncs the stream by default.
    pub is_default: bool,
    /// Whether the application subscribed explicitly.
    pub has_explicit_subscription: bool,
    /// Effective priority, if known.
    pub priority: Option<i32>,
    /// Whether the stream was fully synced at least once.
    pub has_synced: bool,
    /// When the stream was last synced.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// When an unused subscription stops being requested.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Snapshot of the sync state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// A sync stream is open.
    pub connected: bool,
    /// A sync stream is being opened.
    pub connecting: bool,
    /// Upload and download activity.
    pub data_flow: DataFlowStatus,
    /// When a full checkpoint was last applied.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Whether a full checkpoint was applied at least once.
    pub has_synced: Option<bool>,
    /// Partial sync state, sorted by priority number, highest first.
    pub priority_status_entries: Vec<SyncPriorityStatus>,
    /// Stream subscriptions.
    pub streams: Vec<SyncStreamStatus>,
}

impl SyncStatus {
    /// Loads the persisted sync marks and subscriptions.
    pub fn from_storage(storage: &BucketStorage) -> StorageResult<Self> {
        let mut status = SyncStatus {
            has_synced: Some(false),
            ..SyncStatus::default()
        };
        for mark in storage.sync_marks()? {
            if mark.priority == FULL_SYNC_PRIORITY {
                status.has_synced = Some(true);
                status.last_synced_at = Some(mark.synced_at);
            } else {
                status.set_priority_synced(mark.priority, mark.synced_at);
            }
        }
        status.streams = stream_statuses(storage)?;
        Ok(status)
    }

    /// Returns the sync state for buckets up to `priority`.
    ///
    /// A partial sync at a priority number covers every bucket with a
    /// lower or equal number, and a full sync covers everything.
    pub fn status_for_priority(&self, priority: i32) -> SyncPriorityStatus {
        self.priority_status_entries
            .iter()
            .find(|entry| entry.priority >= priority)
            .cloned()
            .unwrap_or(SyncPriorityStatus {
                priority,
                last_synced_at: self.last_synced_at,
                has_synced: self.has_synced,
            })
    }

    /// Returns true once buckets up to `priority` (or everything) were synced.
    pub fn has_synced_priority(&self, priority: Option<i32>) -> bool {
        match priority {
            None => self.has_synced == Some(true),
            Some(p) => self.status_for_priority(p).has_synced == Some(true),
        }
    }

    /// Returns the status of a stream subscription.
    pub fn stream(&self, name: &str, parameters: Option<&Value>) -> Option<&SyncStreamStatus> {
        let wanted = parameters.filter(|p| !p.is_null());
        self.streams
            .iter()
            .find(|s| s.name == name && s.parameters.as_ref().filter(|p| !p.is_null()) == wanted)
    }

    /// Records a full sync and drops the partial entries it supersedes.
    pub(crate) fn set_full_synced(&mut self, at: DateTime<Utc>) {
        self.has_synced = Some(true);
        self.last_synced_at = Some(at);
        self.priority_status_entries.clear();
        self.data_flow.downloading = false;
        self.data_flow.download_progress = None;
        self.data_flow.download_error = None;
    }

    /// Records a partial sync.
    pub(crate) fn set_priority_synced(&mut self, priority: i32, at: DateTime<Utc>) {
        let entries = &mut self.priority_status_entries;
        entries.retain(|e| e.priority != priority);
        entries.push(SyncPriorityStatus {
            priority,
            last_synced_at: Some(at),
            has_synced: Some(true),
        });
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
    }
}

/// Builds stream statuses from stored subscriptions.
pub(crate) fn stream_statuses(storage: &BucketStorage) -> StorageResult<Vec<SyncStreamStatus>> {
    Ok(storage
        .subscriptions()?
        .into_iter()
        .map(|s| SyncStreamStatus {
            name: s.name,
            parameters: s.parameters,
            is_default: s.is_default,
            has_explicit_subscription: s.has_explicit_subscription,
            priority: s.priority,
            has_synced: s.has_synced,
            last_synced_at: s.last_synced_at,
            expires_at: s.expires_at,
        })
        .collect())
}

/// Shared handle that publishes status changes.
#[derive(Debug, Clone)]
pub struct StatusPublisher {
    tx: Arc<watch::Sender<SyncStatus>>,
}

impl StatusPublisher {
    /// Creates a publisher with an initial status.
    pub fn new(initial: SyncStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Returns the current status.
    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    /// Returns a receiver that observes every change.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Applies a change and notifies receivers if anything differs.
    pub fn update(&self, f: impl FnOnce(&mut SyncStatus)) {
        self.tx.send_if_modified(|status| {
            let before = status.clone();
            f(status);
            *status != before
        });
    }

    /// Replaces the status.
    pub fn replace(&self, status: SyncStatus) {
        self.update(|current| *current = status);
    }

    /// Encodes the current status as stored for other processes.
    pub fn snapshot_json(&self) -> SyncResult<String> {
        let json = serde_json::to_string(&*self.tx.borrow())
            .map_err(skiff_sync_protocol::ProtocolError::from)?;
        Ok(json)
    }

    /// Stores the current status for other processes.
    pub fn persist(&self, storage: &BucketStorage) -> SyncResult<()> {
        storage.put_kv(STATUS_KEY, &self.snapshot_json()?)?;
        trace!("persisted sync status");
        Ok(())
    }

    /// Replaces the status with the snapshot stored by the owning process.
    ///
    /// Returns false if no snapshot exists or it can not be decoded.
    pub fn mirror(&self, storage: &BucketStorage) -> StorageResult<bool> {
        let Some(json) = storage.get_kv(STATUS_KEY)? else {
            return Ok(false);
        };
        match serde_json::from_str::<SyncStatus>(&json) {
            Ok(snapshot) => {
                self.replace(snapshot);
                Ok(true)
            }
            Err(err) => {
                trace!(error = %err, "ignoring unreadable status snapshot");
                Ok(false)
            }
        }
    }
}
