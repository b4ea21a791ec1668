//! Error types for the sync engine.

use skiff_storage::StorageError;
use skiff_sync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The service rejected the credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The connector returned no credentials.
    #[error("not signed in")]
    MissingCredentials,

    /// Credentials returned by the connector are unusable.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Protocol error (invalid line or message).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Local storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Upload failed.
    #[error(transparent)]
    Upload(#[from] UploadError),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// The stream produced no line within the idle timeout.
    #[error("operation timed out")]
    Timeout,

    /// The cross-process sync lock was not acquired in time.
    #[error("timed out waiting for the sync lock")]
    LockTimeout,

    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A background task failed.
    #[error("task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the same request may succeed later without changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout | SyncError::LockTimeout => true,
            SyncError::Storage(err) => err.is_transient(),
            SyncError::Upload(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if cached credentials must be discarded before retrying.
    pub fn is_authorization(&self) -> bool {
        matches!(self, SyncError::Unauthorized(_))
    }

    /// Returns true if the sync loop must stop instead of retrying.
    pub fn stops_sync(&self) -> bool {
        matches!(
            self,
            SyncError::MissingCredentials | SyncError::InvalidCredentials(_) | SyncError::Cancelled
        )
    }
}

/// How the upload loop treats a failed upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadErrorKind {
    /// Retry the same entries after the upload retry delay.
    Retryable,
    /// Discard the failing transaction and continue with the next one.
    Fatal,
}

/// Error returned by [`crate::Connector::upload_data`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("upload failed: {message}")]
pub struct UploadError {
    /// Classification chosen by the connector.
    pub kind: UploadErrorKind,
    /// Error message.
    pub message: String,
}

impl UploadError {
    /// Creates a retryable upload error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: UploadErrorKind::Retryable,
            message: message.into(),
        }
    }

    /// Creates a fatal upload error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: UploadErrorKind::Fatal,
            message: message.into(),
        }
    }

    /// Returns true if the upload should be retried.
    pub fn is_retryable(&self) -> bool {
        self.kind == UploadErrorKind::Retryable
    }
}

impl From<StorageError> for UploadError {
    fn from(err: StorageError) -> Self {
        if err.is_transient() {
            Self::retryable(err.to_string())
        } else {
            Self::fatal(err.to_string())
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        SyncError::Task(err.to_string())
    }
}
