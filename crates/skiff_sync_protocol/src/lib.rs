//! # Skiff Sync Protocol
//!
//! Sync protocol types, oplog model and checksum arithmetic for Skiff.
//!
//! This crate provides:
//! - 32-bit wrapping checksum arithmetic shared with the sync service
//! - `OplogEntry` and `SyncDataBucket` for downloaded bucket operations
//! - `CrudEntry` for local writes waiting to be uploaded
//! - Streaming request and response line types (JSON)
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Wire Format
//!
//! The client sends one [`StreamingSyncRequest`] per stream. The service
//! answers with newline-delimited JSON, each line decoding to a
//! [`SyncLine`]. Op ids travel as decimal strings so that 64-bit values
//! survive JSON number handling on every platform.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod checksum;
mod crud;
mod error;
mod messages;
mod op_id;
mod oplog;

pub use checksum::Checksum;
pub use crud::{CrudEntry, UpdateType};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    BucketChecksum, BucketRequest, BucketSubscriptionReason, Checkpoint, CheckpointComplete,
    CheckpointDiff, LogLine, LogSeverity, PartialCheckpointComplete, RequestedStreams,
    StreamDescription, StreamSubscriptionRequest, StreamingSyncRequest, SyncLine,
    WriteCheckpointData, WriteCheckpointResponse,
};
pub use op_id::{OpId, MAX_OP_ID};
pub use oplog::{OpType, OplogEntry, SyncDataBatch, SyncDataBucket};

/// Priority assigned to buckets that do not declare one.
pub const FALLBACK_PRIORITY: i32 = 3;

/// Pseudo-priority of a complete checkpoint, which includes every bucket.
pub const FULL_SYNC_PRIORITY: i32 = 2_147_483_647;

/// Highest priority a bucket or stream can have.
pub const HIGHEST_PRIORITY: i32 = 0;

/// Returns true when `priority` is a valid bucket priority (`0..=3`).
pub fn is_valid_priority(priority: i32) -> bool {
    (HIGHEST_PRIORITY..=FALLBACK_PRIORITY).contains(&priority)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_bounds() {
        assert!(is_valid_priority(0));
        assert!(is_valid_priority(3));
        assert!(!is_valid_priority(-1));
        assert!(!is_valid_priority(4));
        assert!(!is_valid_priority(FULL_SYNC_PRIORITY));
    }
}
