//! Error types for storage operations.

use skiff_sync_protocol::{OpId, ProtocolError};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stored data could not be decoded as a protocol type.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The write lock could not be acquired in time.
    #[error("timed out after {0:?} waiting for the write lock")]
    LockTimeout(Duration),

    /// Operations inside one batch were not in increasing op id order.
    #[error("out of order op id {op_id} after {previous} in bucket {bucket}")]
    OutOfOrder {
        /// Bucket name.
        bucket: String,
        /// Offending op id.
        op_id: OpId,
        /// Op id that preceded it in the batch.
        previous: OpId,
    },

    /// A table name that cannot be used for local data.
    #[error("invalid table name: {0:?}")]
    InvalidTableName(String),

    /// A query expected a row but found none.
    #[error("query returned no rows")]
    NotFound,
}

impl StorageError {
    /// Returns true if retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::LockTimeout(_) => true,
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
