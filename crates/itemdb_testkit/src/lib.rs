//! # itemdb testkit
//!
//! Test utilities for itemdb.
//!
//! This crate provides:
//! - Test stores, in memory or in a temporary directory
//! - A small issue-tracker schema and merge registry
//! - A stub connection whose state tests can change
//! - Listeners that record what they receive
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use itemdb_testkit::prelude::*;
//!
//! #[test]
//! fn edits_are_tracked() {
//!     let (_store, manager) = tracker_sync();
//!     let issue = download_issue(&manager, "crash", &["ui"]);
//!     edit_summary(&manager, issue, "crash on start");
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod connection;
pub mod fixtures;
pub mod generators;
pub mod listeners;
pub mod tracker;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::connection::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::listeners::*;
    pub use crate::tracker::*;
}

pub use connection::*;
pub use fixtures::*;
pub use generators::*;
pub use listeners::*;
pub use tracker::*;
