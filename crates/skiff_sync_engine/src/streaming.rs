//! Streaming sync client.
//!
//! One task per connection drives the state machine
//! `Idle -> Connecting -> Streaming -> (Retrying | Idle)`. Every event the
//! loop reacts to, whether a protocol line, a timer or a signal from the
//! upload loop, is turned into an [`Instruction`] first, so the handling
//! code is a single match.
//!
//! When the database lives in a file, the task first takes the
//! cross-process [`ProcessLock`]. While another process holds it this
//! process only mirrors the owner's status.

use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::lock::ProcessLock;
use crate::status::{stream_statuses, SyncProgress, SyncStatus, SyncStreamStatus, STATUS_KEY};
use crate::upload::run_uploads;
use chrono::Utc;
use futures::StreamExt;
use skiff_storage::{StreamSubscriptionRecord, SyncLocalResult};
use skiff_sync_protocol::{
    BucketRequest, BucketSubscriptionReason, Checkpoint, LogSeverity, ProtocolError,
    RequestedStreams, StreamSubscriptionRequest, StreamingSyncRequest, SyncDataBatch, SyncLine,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Keepalives announcing less remaining token lifetime than this trigger
/// a credentials refresh.
const TOKEN_REFRESH_THRESHOLD_SECS: i64 = 30;

/// Everything the streaming loop reacts to.
#[derive(Debug)]
pub(crate) enum Instruction {
    /// A line from the service.
    Line(SyncLine),
    /// The service closed the stream.
    StreamEnded,
    /// The upload loop drained the queue.
    UploadCompleted,
    /// The set of requested streams changed.
    SubscriptionsChanged,
    /// Credentials are about to expire.
    RefreshCredentials,
    /// No line arrived within the idle timeout.
    IdleTimeout,
    /// The connection is being closed.
    Abort,
}

/// How a streaming iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IterationOutcome {
    /// Open a new stream, after the retry delay if `delay` is set.
    Reconnect { delay: bool },
    /// The connection was closed.
    Stopped,
}

/// Result of applying a checkpoint locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApplyOutcome {
    Applied,
    /// Checksums did not match; the failing buckets were dropped.
    Invalid,
    /// Valid, but held back by pending local writes.
    Pending,
}

/// Resolves the caller of `connect()` exactly once.
struct FirstAttempt(Option<oneshot::Sender<SyncResult<()>>>);

impl FirstAttempt {
    fn resolve(&mut self, result: SyncResult<()>) -> Option<SyncResult<()>> {
        match self.0.take() {
            Some(tx) => {
                // The caller may have stopped waiting.
                let _ = tx.send(result);
                None
            }
            None => Some(result),
        }
    }
}

/// Runs the connection until it is cancelled or fails permanently.
pub(crate) async fn run_sync(ctx: Arc<SyncContext>, first: oneshot::Sender<SyncResult<()>>) {
    let mut client = StreamingClient::new(Arc::clone(&ctx), first);
    client.run().await;
    client.shutdown().await;
}

struct StreamingClient {
    ctx: Arc<SyncContext>,
    first: FirstAttempt,
    lock_path: Option<PathBuf>,
    lock: Option<ProcessLock>,
    uploads: Option<(CancellationToken, JoinHandle<()>)>,
    persister: Option<JoinHandle<()>>,
    /// Set once the current iteration opened its stream.
    stream_opened: bool,
}

/// Per-stream state.
#[derive(Default)]
struct StreamState {
    target: Option<Checkpoint>,
    progress: Option<SyncProgress>,
    /// Explicit subscription ids in request order.
    subscription_ids: Vec<i64>,
    /// A valid full checkpoint waits for uploads to finish.
    pending_full: bool,
}

impl StreamingClient {
    fn new(ctx: Arc<SyncContext>, first: oneshot::Sender<SyncResult<()>>) -> Self {
        let lock_path = ctx.storage.path().map(ProcessLock::lock_path);
        Self {
            ctx,
            first: FirstAttempt(Some(first)),
            lock_path,
            lock: None,
            uploads: None,
            persister: None,
            stream_opened: false,
        }
    }

    async fn run(&mut self) {
        let mut attempt: u32 = 0;
        loop {
            if self.ctx.cancel.is_cancelled() {
                return;
            }
            match self.ensure_owner().await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(SyncError::Cancelled) => return,
                Err(err) => {
                    attempt += 1;
                    if !self.handle_error(err, attempt).await {
                        return;
                    }
                    continue;
                }
            }

            match self.streaming_iteration().await {
                Ok(IterationOutcome::Stopped) => return,
                Ok(IterationOutcome::Reconnect { delay }) => {
                    self.stream_opened = false;
                    attempt = 0;
                    self.ctx.update_status(|s| {
                        s.connected = false;
                        s.connecting = false;
                    });
                    if delay && !self.ctx.sleep(self.ctx.options.retry.delay_for_attempt(1)).await
                    {
                        return;
                    }
                }
                Err(err) => {
                    // A stream that failed after opening starts a new backoff.
                    if std::mem::take(&mut self.stream_opened) {
                        attempt = 0;
                    }
                    attempt += 1;
                    if !self.handle_error(err, attempt).await {
                        return;
                    }
                }
            }
        }
    }

    /// Records a failed attempt and waits before the next one.
    ///
    /// Returns false if the loop must stop.
    async fn handle_error(&mut self, err: SyncError, attempt: u32) -> bool {
        self.ctx.update_status(|s| {
            s.connected = false;
            s.connecting = false;
            s.data_flow.downloading = false;
            s.data_flow.download_error = Some(err.to_string());
        });

        if err.stops_sync() {
            if matches!(err, SyncError::Cancelled) {
                return false;
            }
            error!(error = %err, "sync stopped");
            if let Some(Err(err)) = self.first.resolve(Err(err)) {
                debug!(error = %err, "connect already returned");
            }
            return false;
        }

        if err.is_authorization() {
            self.ctx.credentials.invalidate();
        }
        let delay = self.ctx.options.retry.delay_for_attempt(attempt);
        warn!(error = %err, attempt, ?delay, "sync stream failed, retrying");
        self.first.resolve(Ok(()));
        self.ctx.sleep(delay).await
    }

    /// Makes sure this process owns the sync stream.
    ///
    /// Returns false after one observation period without the lock.
    async fn ensure_owner(&mut self) -> SyncResult<bool> {
        let Some(path) = self.lock_path.clone() else {
            self.start_owner_tasks();
            return Ok(true);
        };
        if self.lock.is_some() {
            return Ok(true);
        }

        let lock = match ProcessLock::try_acquire(&path)? {
            Some(lock) => Some(lock),
            None => {
                self.observe().await?;
                ProcessLock::acquire(&path, self.ctx.options.lock_timeout, &self.ctx.cancel).await?
            }
        };

        match lock {
            Some(lock) => {
                info!(path = %lock.path().display(), "this process now owns the sync stream");
                self.lock = Some(lock);
                let status = self.ctx.blocking(|s| SyncStatus::from_storage(s)).await?;
                self.ctx.status.replace(status);
                self.start_owner_tasks();
                Ok(true)
            }
            None => {
                self.observe().await?;
                Ok(false)
            }
        }
    }

    /// Mirrors the status published by the owning process.
    async fn observe(&mut self) -> SyncResult<()> {
        let status = self.ctx.status.clone();
        let mirrored = self.ctx.blocking(move |s| status.mirror(s)).await?;
        trace!(mirrored, "observing sync owned by another process");
        self.first.resolve(Ok(()));
        Ok(())
    }

    fn start_owner_tasks(&mut self) {
        if self.uploads.is_none() {
            let cancel = self.ctx.cancel.child_token();
            let task = tokio::spawn(run_uploads(Arc::clone(&self.ctx), cancel.clone()));
            self.uploads = Some((cancel, task));
        }
        if self.persister.is_none() && self.lock_path.is_some() {
            let rx = self.ctx.status.subscribe();
            self.persister = Some(tokio::spawn(persist_status(Arc::clone(&self.ctx), rx)));
        }
    }

    async fn shutdown(&mut self) {
        if let Some((cancel, task)) = self.uploads.take() {
            cancel.cancel();
            if let Err(err) = task.await {
                warn!(error = %err, "upload task failed");
            }
        }
        if let Some(task) = self.persister.take() {
            task.abort();
        }
        self.ctx.update_status(|s| {
            s.connected = false;
            s.connecting = false;
            s.data_flow.downloading = false;
            s.data_flow.uploading = false;
        });
        if self.lock.is_some() {
            if let Err(err) = self.store_status().await {
                warn!(error = %err, "failed to store final sync status");
            }
        }
        self.lock = None;
        // Resolves connect() if the loop ended before the first attempt.
        self.first.resolve(Err(SyncError::Cancelled));
        debug!("sync stopped");
    }

    async fn store_status(&self) -> SyncResult<()> {
        let json = self.ctx.status.snapshot_json()?;
        self.ctx
            .blocking(move |s| s.put_kv(STATUS_KEY, &json))
            .await
    }

    async fn build_request(&self, state: &mut StreamState) -> SyncResult<StreamingSyncRequest> {
        let include_defaults = self.ctx.options.include_default_streams;
        let params = self.ctx.options.params.clone();
        let (buckets, subscriptions, client_id) = self
            .ctx
            .blocking(|s| {
                let now = Utc::now();
                s.remove_expired_subscriptions(now)?;
                Ok((
                    s.bucket_states()?,
                    s.requested_subscriptions(now)?,
                    s.client_id()?,
                ))
            })
            .await?;

        let mut request = StreamingSyncRequest::new(
            buckets
                .into_iter()
                .map(|b| BucketRequest {
                    name: b.name,
                    after: b.last_op,
                })
                .collect(),
        );
        request.parameters = params;
        request.client_id = Some(client_id);
        state.subscription_ids = subscriptions.iter().map(|s| s.id).collect();
        request.streams = Some(RequestedStreams {
            include_defaults,
            subscriptions: subscriptions
                .into_iter()
                .map(|s| StreamSubscriptionRequest {
                    stream: s.name,
                    parameters: s.parameters,
                    override_priority: s.priority,
                })
                .collect(),
        });
        Ok(request)
    }

    async fn streaming_iteration(&mut self) -> SyncResult<IterationOutcome> {
        let ctx = Arc::clone(&self.ctx);
        ctx.update_status(|s| s.connecting = true);

        let credentials = tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(IterationOutcome::Stopped),
            credentials = ctx.credentials.get() => credentials?,
        };
        let credentials = credentials.ok_or(SyncError::MissingCredentials)?;

        let mut subscription_changes = ctx.subscriptions.watch();
        subscription_changes.borrow_and_update();

        let mut state = StreamState::default();
        let request = self.build_request(&mut state).await?;
        debug!(
            buckets = request.buckets.len(),
            streams = state.subscription_ids.len(),
            "opening sync stream"
        );

        let mut stream = tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(IterationOutcome::Stopped),
            stream = ctx.remote.open_stream(&credentials, &request) => stream?,
        };

        ctx.update_status(|s| {
            s.connected = true;
            s.connecting = false;
            s.data_flow.download_error = None;
        });
        self.first.resolve(Ok(()));
        self.stream_opened = true;
        info!(endpoint = %credentials.endpoint, "sync stream open");

        let refresh_in = ctx.credentials.refresh_in();
        let refresh = async move {
            match refresh_in {
                Some(delay) if !delay.is_zero() => tokio::time::sleep(delay).await,
                _ => std::future::pending().await,
            }
        };
        tokio::pin!(refresh);
        let idle_timeout = ctx.options.stream_idle_timeout;

        loop {
            let instruction = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Instruction::Abort,
                _ = ctx.upload_completed.notified() => Instruction::UploadCompleted,
                changed = subscription_changes.changed() => match changed {
                    Ok(()) => Instruction::SubscriptionsChanged,
                    Err(_) => Instruction::Abort,
                },
                _ = &mut refresh => Instruction::RefreshCredentials,
                line = tokio::time::timeout(idle_timeout, stream.next()) => match line {
                    Err(_) => Instruction::IdleTimeout,
                    Ok(None) => Instruction::StreamEnded,
                    Ok(Some(line)) => Instruction::Line(line?),
                },
            };

            if let Some(outcome) = self.handle_instruction(instruction, &mut state).await? {
                return Ok(outcome);
            }
        }
    }

    async fn handle_instruction(
        &mut self,
        instruction: Instruction,
        state: &mut StreamState,
    ) -> SyncResult<Option<IterationOutcome>> {
        match instruction {
            Instruction::Line(line) => self.handle_line(line, state).await,
            Instruction::Abort => Ok(Some(IterationOutcome::Stopped)),
            Instruction::StreamEnded => {
                info!("sync stream closed by the service");
                Ok(Some(IterationOutcome::Reconnect { delay: true }))
            }
            Instruction::IdleTimeout => Err(SyncError::Timeout),
            Instruction::SubscriptionsChanged => {
                debug!("requested streams changed, reconnecting");
                Ok(Some(IterationOutcome::Reconnect { delay: false }))
            }
            Instruction::RefreshCredentials => {
                debug!("credentials about to expire, reconnecting");
                self.ctx.credentials.invalidate();
                Ok(Some(IterationOutcome::Reconnect { delay: false }))
            }
            Instruction::UploadCompleted => {
                if state.pending_full {
                    if let Some(target) = state.target.clone() {
                        trace!("uploads finished, retrying held back checkpoint");
                        return self.complete_checkpoint(target, None, state).await;
                    }
                }
                Ok(None)
            }
        }
    }

    async fn handle_line(
        &mut self,
        line: SyncLine,
        state: &mut StreamState,
    ) -> SyncResult<Option<IterationOutcome>> {
        match line {
            SyncLine::Checkpoint(checkpoint) => {
                self.start_checkpoint(checkpoint, state).await?;
                Ok(None)
            }
            SyncLine::CheckpointDiff(diff) => {
                let target = state
                    .target
                    .as_ref()
                    .ok_or(ProtocolError::DiffWithoutCheckpoint)?;
                let checkpoint = target.apply_diff(&diff);
                self.start_checkpoint(checkpoint, state).await?;
                Ok(None)
            }
            SyncLine::Data(bucket) => {
                let name = bucket.bucket.clone();
                let operations = i64::try_from(bucket.data.len()).unwrap_or(i64::MAX);
                let batch = SyncDataBatch::from(bucket);
                self.ctx.blocking(move |s| s.save_sync_data(&batch)).await?;
                if let Some(progress) = state.progress.as_mut() {
                    progress.increment(&name, operations);
                    let progress = progress.clone();
                    self.ctx
                        .update_status(|s| s.data_flow.download_progress = Some(progress));
                }
                Ok(None)
            }
            SyncLine::CheckpointComplete(complete) => {
                let target = self.require_target(state, "checkpoint_complete")?;
                trace!(op_id = %complete.last_op_id, "checkpoint complete");
                self.complete_checkpoint(target, None, state).await
            }
            SyncLine::PartialCheckpointComplete(partial) => {
                let target = self.require_target(state, "partial_checkpoint_complete")?;
                trace!(
                    op_id = %partial.last_op_id,
                    priority = partial.priority,
                    "partial checkpoint complete"
                );
                self.complete_checkpoint(target, Some(partial.priority), state)
                    .await
            }
            SyncLine::KeepAlive(expires_in) => {
                if expires_in == 0 {
                    warn!("token expired, reconnecting with new credentials");
                    self.ctx.credentials.invalidate();
                    return Ok(Some(IterationOutcome::Reconnect { delay: true }));
                }
                if expires_in < TOKEN_REFRESH_THRESHOLD_SECS {
                    debug!(expires_in, "token about to expire, refreshing");
                    self.ctx.credentials.invalidate();
                    return Ok(Some(IterationOutcome::Reconnect { delay: false }));
                }
                Ok(None)
            }
            SyncLine::Log(log) => {
                match log.severity {
                    LogSeverity::Debug => debug!(target: "skiff::service", "{}", log.line),
                    LogSeverity::Info => info!(target: "skiff::service", "{}", log.line),
                    LogSeverity::Warning => warn!(target: "skiff::service", "{}", log.line),
                    LogSeverity::Error => error!(target: "skiff::service", "{}", log.line),
                }
                Ok(None)
            }
            SyncLine::Unknown(raw) => {
                debug!(line = %raw, "ignoring unknown sync line");
                Ok(None)
            }
        }
    }

    fn require_target(&self, state: &StreamState, line: &str) -> SyncResult<Checkpoint> {
        state.target.clone().ok_or_else(|| {
            SyncError::Protocol(ProtocolError::MalformedLine(format!(
                "{line} received without a checkpoint"
            )))
        })
    }

    /// Makes `checkpoint` the new download target.
    ///
    /// Buckets missing from it are dropped locally.
    async fn start_checkpoint(
        &mut self,
        checkpoint: Checkpoint,
        state: &mut StreamState,
    ) -> SyncResult<()> {
        debug!(
            op_id = %checkpoint.last_op_id,
            buckets = checkpoint.buckets.len(),
            "new checkpoint"
        );
        let names: HashSet<String> = checkpoint.buckets.iter().map(|b| b.bucket.clone()).collect();
        let defaults: Vec<String> = checkpoint
            .streams
            .iter()
            .filter(|s| s.is_default)
            .map(|s| s.name.clone())
            .collect();
        let include_defaults = self.ctx.options.include_default_streams;

        let local = self
            .ctx
            .blocking(move |s| {
                let obsolete: Vec<String> = s
                    .bucket_states()?
                    .into_iter()
                    .map(|b| b.name)
                    .filter(|name| !names.contains(name))
                    .collect();
                s.remove_buckets(&obsolete)?;
                if include_defaults {
                    s.set_default_streams(&defaults)?;
                }
                s.local_progress()
            })
            .await?;

        let progress = SyncProgress::for_checkpoint(&checkpoint, &local);
        state.progress = Some(progress.clone());
        state.target = Some(checkpoint);
        state.pending_full = false;

        let streams = self.stream_statuses().await?;
        self.ctx.update_status(|s| {
            s.data_flow.downloading = true;
            s.data_flow.download_progress = Some(progress);
            s.streams = streams;
        });
        Ok(())
    }

    /// Applies the target checkpoint, completely or up to a priority.
    async fn complete_checkpoint(
        &mut self,
        target: Checkpoint,
        priority: Option<i32>,
        state: &mut StreamState,
    ) -> SyncResult<Option<IterationOutcome>> {
        let checkpoint = target.clone();
        let result: SyncLocalResult = self
            .ctx
            .blocking(move |s| s.sync_local_database(&checkpoint, priority))
            .await?;

        let outcome = if !result.checkpoint_valid {
            ApplyOutcome::Invalid
        } else if !result.ready {
            ApplyOutcome::Pending
        } else {
            ApplyOutcome::Applied
        };

        match outcome {
            ApplyOutcome::Invalid => {
                warn!(
                    failures = ?result.failures,
                    ?priority,
                    "checksum mismatch, downloading buckets again"
                );
                Ok(Some(IterationOutcome::Reconnect { delay: false }))
            }
            ApplyOutcome::Pending => {
                if priority.is_none() {
                    debug!("checkpoint held back until local writes are uploaded");
                    state.pending_full = true;
                }
                Ok(None)
            }
            ApplyOutcome::Applied => {
                let now = Utc::now();
                if priority.is_none() {
                    state.pending_full = false;
                }
                let records = self.all_subscriptions().await?;
                let ids =
                    synced_subscriptions(&target, &state.subscription_ids, priority, &records);
                self.ctx
                    .blocking(move |s| s.mark_subscriptions_synced(&ids, now))
                    .await?;
                let streams = self.stream_statuses().await?;

                self.ctx.update_status(|s| {
                    match priority {
                        None => s.set_full_synced(now),
                        Some(p) => s.set_priority_synced(p, now),
                    }
                    s.streams = streams;
                });
                match priority {
                    None => info!(op_id = %target.last_op_id, "checkpoint applied"),
                    Some(p) => {
                        debug!(op_id = %target.last_op_id, priority = p, "partial checkpoint applied")
                    }
                }
                Ok(None)
            }
        }
    }

    async fn all_subscriptions(&self) -> SyncResult<Vec<StreamSubscriptionRecord>> {
        self.ctx.blocking(|s| s.subscriptions()).await
    }

    async fn stream_statuses(&self) -> SyncResult<Vec<SyncStreamStatus>> {
        self.ctx.blocking(|s| stream_statuses(s)).await
    }
}

/// Returns the ids of the subscriptions whose buckets are all applied.
///
/// After a full sync every requested and default stream is complete.
/// After a partial sync a stream is complete if none of its buckets has a
/// priority number above the synced one.
fn synced_subscriptions(
    checkpoint: &Checkpoint,
    requested: &[i64],
    priority: Option<i32>,
    records: &[StreamSubscriptionRecord],
) -> Vec<i64> {
    let default_id = |index: usize| {
        let name = &checkpoint.streams.get(index)?.name;
        records
            .iter()
            .find(|r| r.is_default && &r.name == name && r.parameters.is_none())
            .map(|r| r.id)
    };

    let Some(priority) = priority else {
        let mut ids: Vec<i64> = requested.to_vec();
        ids.extend((0..checkpoint.streams.len()).filter_map(default_id));
        ids.sort_unstable();
        ids.dedup();
        return ids;
    };

    let complete = |reason: BucketSubscriptionReason| {
        checkpoint
            .buckets
            .iter()
            .filter(|b| {
                b.subscriptions
                    .as_ref()
                    .is_some_and(|subs| subs.contains(&reason))
            })
            .all(|b| b.effective_priority() <= priority)
    };

    let mut ids: Vec<i64> = requested
        .iter()
        .enumerate()
        .filter(|(index, _)| complete(BucketSubscriptionReason::ExplicitSubscription(*index)))
        .map(|(_, id)| *id)
        .collect();
    ids.extend(
        (0..checkpoint.streams.len())
            .filter(|index| complete(BucketSubscriptionReason::DefaultStream(*index)))
            .filter_map(default_id),
    );
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Stores every status change for processes observing this one.
async fn persist_status(ctx: Arc<SyncContext>, mut rx: watch::Receiver<SyncStatus>) {
    loop {
        let encoded = serde_json::to_string(&*rx.borrow_and_update());
        match encoded {
            Ok(json) => {
                if let Err(err) = ctx.blocking(move |s| s.put_kv(STATUS_KEY, &json)).await {
                    warn!(error = %err, "failed to store sync status");
                }
            }
            Err(err) => warn!(error = %err, "failed to encode sync status"),
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
}
