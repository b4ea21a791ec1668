//! Upload loop.
//!
//! Runs next to the streaming client while this process owns the sync
//! stream. It wakes on local writes, waits for the throttle period so
//! bursts of writes are uploaded together, and hands the queue to the
//! connector until it is empty.

use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult, UploadError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

pub(crate) async fn run_uploads(ctx: Arc<SyncContext>, cancel: CancellationToken) {
    debug!("upload loop started");
    loop {
        if !upload_all(&ctx, &cancel).await {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ctx.crud_changed.notified() => {}
        }
        let throttle = ctx.options.crud_upload_throttle;
        if !throttle.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(throttle) => {}
            }
        }
    }
    ctx.update_status(|s| s.data_flow.uploading = false);
    debug!("upload loop stopped");
}

/// Uploads until the queue is empty. Returns false if cancelled.
async fn upload_all(ctx: &Arc<SyncContext>, cancel: &CancellationToken) -> bool {
    let mut last_head: Option<i64> = None;
    let mut target_failed = false;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let head = match ctx.blocking(|s| s.next_crud_item()).await {
            Ok(head) => head,
            Err(err) => {
                if !retry_later(ctx, cancel, &UploadError::retryable(err.to_string())).await {
                    return false;
                }
                continue;
            }
        };

        let Some(head) = head else {
            ctx.update_status(|s| s.data_flow.uploading = false);
            match finish_uploads(ctx, cancel).await {
                Ok(()) => {
                    if target_failed {
                        ctx.update_status(|s| s.data_flow.upload_error = None);
                    }
                    return true;
                }
                Err(SyncError::Cancelled) => return false,
                Err(err) => {
                    target_failed = true;
                    let err = UploadError::retryable(format!(
                        "failed to resolve write checkpoint: {err}"
                    ));
                    if !retry_later(ctx, cancel, &err).await {
                        return false;
                    }
                    continue;
                }
            }
        };

        if last_head == Some(head.client_id) {
            let err = UploadError::retryable(format!(
                "entry {} is still queued after upload, was the transaction completed?",
                head.client_id
            ));
            last_head = None;
            if !retry_later(ctx, cancel, &err).await {
                return false;
            }
            continue;
        }
        last_head = Some(head.client_id);

        ctx.update_status(|s| s.data_flow.uploading = true);
        trace!(client_id = head.client_id, "uploading local writes");
        let result = tokio::select! {
            _ = cancel.cancelled() => return false,
            result = ctx.connector.upload_data(&ctx.storage) => result,
        };

        match result {
            Ok(()) => ctx.update_status(|s| s.data_flow.upload_error = None),
            Err(err) if err.is_retryable() => {
                last_head = None;
                if !retry_later(ctx, cancel, &err).await {
                    return false;
                }
            }
            Err(err) => {
                error!(
                    client_id = head.client_id,
                    error = %err,
                    "upload failed permanently, discarding transaction"
                );
                ctx.update_status(|s| s.data_flow.upload_error = Some(err.to_string()));
                if let Err(err) = discard_transaction(ctx).await {
                    warn!(error = %err, "failed to discard transaction");
                }
                last_head = None;
            }
        }
    }
}

async fn retry_later(ctx: &SyncContext, cancel: &CancellationToken, err: &UploadError) -> bool {
    warn!(error = %err, delay = ?ctx.options.upload_retry_delay, "upload failed, retrying later");
    ctx.update_status(|s| {
        s.data_flow.uploading = false;
        s.data_flow.upload_error = Some(err.to_string());
    });
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(ctx.options.upload_retry_delay) => true,
    }
}

async fn discard_transaction(ctx: &SyncContext) -> SyncResult<()> {
    ctx.blocking(|s| match s.next_crud_transaction()? {
        Some(transaction) => transaction.complete(None),
        None => Ok(()),
    })
    .await
}

/// Resolves the write checkpoint once the queue is empty and wakes the
/// streaming client so it can apply a checkpoint held back by the uploads.
///
/// Fails if the write checkpoint could not be fetched. The target stays
/// unresolved until the caller retries.
async fn finish_uploads(ctx: &SyncContext, cancel: &CancellationToken) -> SyncResult<()> {
    if update_local_target(ctx, cancel).await? {
        debug!("write checkpoint reached");
    }
    ctx.upload_completed.notify_one();
    Ok(())
}

async fn update_local_target(ctx: &SyncContext, cancel: &CancellationToken) -> SyncResult<bool> {
    let Some(ticket) = ctx.blocking(|s| s.begin_target_update()).await? else {
        return Ok(false);
    };
    let credentials = tokio::select! {
        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
        credentials = ctx.credentials.get() => credentials?,
    };
    let credentials = credentials.ok_or(SyncError::MissingCredentials)?;
    let client_id = ctx.blocking(|s| s.client_id()).await?;
    let op_id = tokio::select! {
        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
        op_id = ctx.remote.write_checkpoint(&credentials, &client_id) => op_id?,
    };
    ctx.blocking(move |s| s.commit_target_update(ticket, op_id))
        .await
}
