//! # Skiff Sync Engine
//!
//! Streaming sync client for Skiff databases.
//!
//! This crate provides:
//! - [`SyncDatabase`], a local database that syncs in the background
//! - The [`Connector`] boundary to the application backend
//! - [`SyncRemote`] with an HTTP implementation and a test double
//! - The streaming state machine (connect, stream, retry)
//! - An upload loop for queued local writes
//! - Stream subscriptions with reference counting and expiry
//! - Cross-process ownership of the sync stream
//!
//! ## Architecture
//!
//! Each connection runs two tasks. The streaming task opens a long-lived
//! request listing every known bucket and the op id to resume after,
//! stores incoming operations and applies checkpoints once their
//! checksums validate. The upload task hands queued local writes to the
//! connector and then asks the service for a write checkpoint, so remote
//! data is only applied after it includes the local writes.
//!
//! ## Key Invariants
//!
//! - Remote data is never applied over unacknowledged local writes
//!   (priority 0 buckets excepted)
//! - A checksum mismatch drops the affected buckets, which are then
//!   downloaded again from the start
//! - Transient failures are retried and reported in [`SyncStatus`];
//!   only missing or unusable credentials stop syncing
//! - Only one process per database file streams at a time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connector;
mod context;
mod database;
mod error;
mod lock;
mod remote;
mod status;
mod streaming;
mod subscriptions;
mod upload;

pub use config::{RetryConfig, SyncOptions};
pub use connector::{Connector, Credentials, CredentialsCache, MockConnector};
pub use database::SyncDatabase;
pub use error::{SyncError, SyncResult, UploadError, UploadErrorKind};
pub use lock::ProcessLock;
pub use remote::{
    decode_lines, status_error, ByteStream, HttpClient, HttpRemote, HttpResponse, LineDecoder,
    LineStream, MockConnection, MockRemote, SyncRemote, STREAM_PATH, WRITE_CHECKPOINT_PATH,
};
pub use status::{
    BucketProgress, DataFlowStatus, ProgressCounters, StatusPublisher, SyncPriorityStatus,
    SyncProgress, SyncStatus, SyncStreamStatus, STATUS_KEY,
};
pub use subscriptions::{
    SubscriptionOptions, SyncStream, SyncStreamSubscription, DEFAULT_SUBSCRIPTION_TTL,
};
