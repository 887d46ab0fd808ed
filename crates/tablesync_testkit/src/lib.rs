//! # TableSync Testkit
//!
//! Test utilities for TableSync.
//!
//! This crate provides:
//! - A recording synchronizer that mirrors its table in memory
//! - Test fixtures, sample schemas and temporary stores
//! - Property-based test generators using proptest
//! - A mirror-consistency harness
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tablesync_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_store() {
//!     let stops = Arc::new(RecordingSynchronizer::new(stops_schema()));
//!     with_temp_store(registry_with(vec![stops.clone()]), |store| {
//!         // ... test operations
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod recorder;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::recorder::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use recorder::*;
pub use stress::*;
