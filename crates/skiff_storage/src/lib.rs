//! # Skiff Storage
//!
//! Durable local state of the Skiff sync engine, kept in one SQLite
//! database.
//!
//! This crate owns everything that must survive a restart: downloaded
//! bucket operations and their checksums, materialized rows, the queue
//! of local writes waiting for upload, the upload target, and persisted
//! stream subscriptions. It performs no network I/O.
//!
//! ## Guarantees
//!
//! - A downloaded batch is applied entirely or not at all
//! - Per-bucket op ids only increase
//! - Remote data reaches local tables only after its checkpoint validates
//!   and no local writes are pending
//! - CRUD ids are never reused, so the queue has a stable high-water mark
//!
//! ## Example
//!
//! ```rust
//! use skiff_storage::BucketStorage;
//! use skiff_sync_protocol::{BucketChecksum, Checkpoint, OplogEntry, SyncDataBucket};
//!
//! let storage = BucketStorage::in_memory().unwrap();
//! let bucket = SyncDataBucket::new("b1", vec![OplogEntry::put(1i64, "todos", "t1", r#"{"title":"x"}"#, 7u32)]);
//! storage.save_sync_data(&bucket.into()).unwrap();
//!
//! let checkpoint = Checkpoint::new(1i64, vec![BucketChecksum::new("b1", 7u32)]);
//! let result = storage.sync_local_database(&checkpoint, None).unwrap();
//! assert!(result.ready);
//! assert_eq!(storage.row("todos", "t1").unwrap().unwrap()["title"], "x");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod buckets;
mod change_feed;
mod config;
mod crud;
mod error;
pub mod schema;
mod storage;
mod subscriptions;

pub use buckets::{
    BucketState, ChecksumValidation, LocalBucketProgress, SyncLocalResult, SyncMark,
};
pub use change_feed::{ChangeFeed, TableUpdate, CRUD_TABLE};
pub use config::StorageConfig;
pub use crud::{CrudBatch, CrudTransaction, LocalWriteTransaction, TargetUpdateTicket};
pub use error::{StorageError, StorageResult};
pub use storage::{BucketStorage, LocalState};
pub use subscriptions::{parameters_key, StreamSubscriptionRecord};
