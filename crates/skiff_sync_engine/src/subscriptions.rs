//! Stream subscriptions.
//!
//! A [`SyncStream`] names a stream and its parameters. Subscribing returns
//! a [`SyncStreamSubscription`] handle; the stream stays part of sync
//! requests while at least one handle is alive and for its time to live
//! after the last handle is dropped.

use crate::error::SyncResult;
use crate::status::{stream_statuses, StatusPublisher, SyncStatus, SyncStreamStatus};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use skiff_storage::{parameters_key, BucketStorage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Time to live of a subscription without handles, unless overridden.
pub const DEFAULT_SUBSCRIPTION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Options for [`SyncStream::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// How long the stream keeps syncing after the last handle is dropped.
    pub ttl: Duration,
    /// Priority override for the stream's buckets.
    pub priority: Option<i32>,
}

impl SubscriptionOptions {
    /// Sets the time to live.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the priority override.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_SUBSCRIPTION_TTL,
            priority: None,
        }
    }
}

type SubscriptionKey = (String, String);

/// Live handles of one subscription.
///
/// `unsubscribe_all` forgets the entry, so handles from an older epoch no
/// longer count against a later subscription.
struct LiveHandles {
    count: usize,
    epoch: u64,
}

/// Reference counts of live subscription handles.
///
/// Every change to the set of requested streams bumps a generation
/// counter that the streaming client watches to reconnect with the new
/// request.
pub(crate) struct SubscriptionManager {
    storage: Arc<BucketStorage>,
    status: StatusPublisher,
    refs: Mutex<HashMap<SubscriptionKey, LiveHandles>>,
    epochs: AtomicU64,
    generation: watch::Sender<u64>,
}

impl SubscriptionManager {
    pub(crate) fn new(storage: Arc<BucketStorage>, status: StatusPublisher) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            storage,
            status,
            refs: Mutex::new(HashMap::new()),
            epochs: AtomicU64::new(0),
            generation,
        }
    }

    pub(crate) fn watch(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub(crate) fn status(&self) -> &StatusPublisher {
        &self.status
    }

    fn changed(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    pub(crate) fn refresh_status(&self) -> SyncResult<()> {
        let streams = stream_statuses(&self.storage)?;
        self.status.update(|s| s.streams = streams);
        Ok(())
    }

    fn subscribe(
        self: &Arc<Self>,
        name: &str,
        parameters: Option<&Value>,
        options: SubscriptionOptions,
    ) -> SyncResult<u64> {
        let now = Utc::now();
        let before = self.storage.subscription(name, parameters)?;
        let record =
            self.storage
                .upsert_subscription(name, parameters, Some(options.ttl), options.priority)?;

        let epoch = {
            let mut refs = self.refs.lock();
            let live = refs
                .entry((name.to_string(), parameters_key(parameters)))
                .or_insert_with(|| LiveHandles {
                    count: 0,
                    epoch: self.epochs.fetch_add(1, Ordering::Relaxed),
                });
            live.count += 1;
            live.epoch
        };

        let newly_requested = before.as_ref().map_or(true, |b| !b.is_requested(now));
        let priority_changed = before.map_or(false, |b| b.priority != record.priority);
        if newly_requested || priority_changed {
            debug!(stream = name, "stream subscription added");
            self.changed();
        }
        self.refresh_status()?;
        Ok(epoch)
    }

    fn release(&self, name: &str, parameters: Option<&Value>, ttl: Duration, epoch: u64) {
        let key = (name.to_string(), parameters_key(parameters));
        let remaining = {
            let mut refs = self.refs.lock();
            match refs.get_mut(&key) {
                Some(live) if live.epoch != epoch => return,
                Some(live) if live.count > 1 => {
                    live.count -= 1;
                    live.count
                }
                Some(_) => {
                    refs.remove(&key);
                    0
                }
                None => return,
            }
        };
        if remaining > 0 {
            return;
        }

        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);
        if let Err(err) = self.storage.expire_subscription(name, parameters, expires_at) {
            warn!(stream = name, error = %err, "failed to start subscription expiry");
        }
        if let Err(err) = self.refresh_status() {
            warn!(stream = name, error = %err, "failed to refresh stream status");
        }
    }

    fn unsubscribe_all(&self, name: &str, parameters: Option<&Value>) -> SyncResult<()> {
        self.storage.remove_explicit_subscription(name, parameters)?;
        self.refs
            .lock()
            .remove(&(name.to_string(), parameters_key(parameters)));
        debug!(stream = name, "stream subscription removed");
        self.changed();
        self.refresh_status()
    }
}

/// A stream with fixed parameters.
#[derive(Clone)]
pub struct SyncStream {
    name: String,
    parameters: Option<Value>,
    manager: Arc<SubscriptionManager>,
}

impl SyncStream {
    pub(crate) fn new(
        name: impl Into<String>,
        parameters: Option<Value>,
        manager: Arc<SubscriptionManager>,
    ) -> Self {
        Self {
            name: name.into(),
            parameters: parameters.filter(|p| !p.is_null()),
            manager,
        }
    }

    /// Returns the stream name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the stream parameters.
    pub fn parameters(&self) -> Option<&Value> {
        self.parameters.as_ref()
    }

    /// Subscribes to the stream.
    ///
    /// Subscribing again to an active stream only adds a reference and
    /// updates the time to live and priority.
    pub fn subscribe(&self, options: SubscriptionOptions) -> SyncResult<SyncStreamSubscription> {
        let epoch = self
            .manager
            .subscribe(&self.name, self.parameters.as_ref(), options)?;
        Ok(SyncStreamSubscription {
            stream: self.clone(),
            ttl: options.ttl,
            epoch,
            active: true,
        })
    }

    /// Drops the explicit subscription regardless of live handles.
    pub fn unsubscribe_all(&self) -> SyncResult<()> {
        self.manager
            .unsubscribe_all(&self.name, self.parameters.as_ref())
    }

    /// Returns the current status of the stream.
    pub fn status(&self) -> Option<SyncStreamStatus> {
        self.manager
            .status()
            .current()
            .stream(&self.name, self.parameters.as_ref())
            .cloned()
    }
}

impl std::fmt::Debug for SyncStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStream")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .finish()
    }
}

/// Live subscription to a stream. Dropping it unsubscribes.
#[derive(Debug)]
pub struct SyncStreamSubscription {
    stream: SyncStream,
    ttl: Duration,
    epoch: u64,
    active: bool,
}

impl SyncStreamSubscription {
    /// Returns the subscribed stream.
    pub fn stream(&self) -> &SyncStream {
        &self.stream
    }

    /// Waits until a checkpoint covering the stream has been applied.
    pub async fn wait_for_first_sync(&self) {
        let name = self.stream.name.clone();
        let parameters = self.stream.parameters.clone();
        let mut rx = self.stream.manager.status().subscribe();
        let synced = |status: &SyncStatus| {
            status
                .stream(&name, parameters.as_ref())
                .is_some_and(|s| s.has_synced)
        };
        // The publisher lives as long as the manager, so this only fails
        // when the database is gone.
        let _ = rx.wait_for(synced).await;
    }

    /// Unsubscribes now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.active) {
            self.stream.manager.release(
                &self.stream.name,
                self.stream.parameters.as_ref(),
                self.ttl,
                self.epoch,
            );
        }
    }
}

impl Drop for SyncStreamSubscription {
    fn drop(&mut self) {
        self.release();
    }
}
