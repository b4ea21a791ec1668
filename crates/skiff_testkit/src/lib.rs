//! # Skiff Testkit
//!
//! Test utilities for Skiff.
//!
//! This crate provides:
//! - Storage fixtures and tracing setup
//! - Property-based test generators using proptest
//! - Builders for sync protocol lines
//! - Shared checksum and protocol test vectors
//!
//! ## Usage
//!
//! ```rust,ignore
//! use skiff_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_storage() {
//!     with_temp_storage(|storage| {
//!         let states = storage.bucket_states().unwrap();
//!         assert!(states.is_empty());
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod lines;
pub mod vectors;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::lines;
    pub use crate::vectors::*;
}

pub use fixtures::*;
pub use generators::*;
pub use vectors::*;
