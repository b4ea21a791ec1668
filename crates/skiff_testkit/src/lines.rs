//! Builders for sync stream lines, encoded the way the service sends them.

use crate::generators::expected_checksum;
use serde_json::json;
use skiff_sync_protocol::{
    BucketChecksum, Checkpoint, CheckpointComplete, LogLine, LogSeverity, OpId, OplogEntry,
    PartialCheckpointComplete, SyncDataBucket, SyncLine,
};

fn encode(line: &SyncLine) -> String {
    serde_json::to_string(line).expect("sync lines always serialize")
}

/// Encodes a checkpoint line.
pub fn checkpoint(checkpoint: &Checkpoint) -> String {
    encode(&SyncLine::Checkpoint(checkpoint.clone()))
}

/// Builds the checkpoint matching per-bucket oplogs.
///
/// Each bucket declares the checksum and count of its entries.
pub fn checkpoint_for(
    last_op_id: impl Into<OpId>,
    buckets: &[(&str, &[OplogEntry])],
) -> Checkpoint {
    let declared = buckets
        .iter()
        .map(|(name, entries)| {
            BucketChecksum::new(*name, expected_checksum(entries.iter()))
                .with_count(entries.len() as i64)
        })
        .collect();
    Checkpoint::new(last_op_id, declared)
}

/// Encodes a data line for one bucket.
pub fn data(bucket: &str, entries: Vec<OplogEntry>) -> String {
    encode(&SyncLine::Data(SyncDataBucket::new(bucket, entries)))
}

/// Encodes a checkpoint completion line.
pub fn checkpoint_complete(last_op_id: impl Into<OpId>) -> String {
    encode(&SyncLine::CheckpointComplete(CheckpointComplete {
        last_op_id: last_op_id.into(),
    }))
}

/// Encodes a partial checkpoint completion line.
pub fn partial_checkpoint_complete(last_op_id: impl Into<OpId>, priority: i32) -> String {
    encode(&SyncLine::PartialCheckpointComplete(PartialCheckpointComplete {
        last_op_id: last_op_id.into(),
        priority,
    }))
}

/// Encodes a keepalive with the remaining token lifetime.
pub fn keepalive(expires_in: i64) -> String {
    encode(&SyncLine::KeepAlive(expires_in))
}

/// Encodes a service log line.
pub fn log(severity: LogSeverity, line: &str) -> String {
    encode(&SyncLine::Log(LogLine {
        severity,
        line: line.to_string(),
    }))
}

/// Encodes a checkpoint diff.
pub fn checkpoint_diff(
    last_op_id: impl Into<OpId>,
    updated: &[BucketChecksum],
    removed: &[&str],
) -> String {
    let last_op_id: OpId = last_op_id.into();
    json!({
        "checkpoint_diff": {
            "last_op_id": last_op_id,
            "updated_buckets": updated,
            "removed_buckets": removed,
        }
    })
    .to_string()
}
