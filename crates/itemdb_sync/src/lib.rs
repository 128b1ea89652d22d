//! # itemdb sync
//!
//! Offline edits, downloads, uploads and auto-merge on top of an
//! [`itemdb_core::ItemStore`].
//!
//! This crate provides:
//! - Per-item locks shared by edit sessions, uploads and merges
//! - [`SyncManager`]: commit scheduling, download writes, upload passes and
//!   eligibility checks
//! - Shadow versions (base, conflict, download) stored next to the local
//!   trunk values, and the [`SyncState`] derived from them
//! - Pluggable merge strategies keyed by connection and item type
//! - Master and slave items that are deleted together, and an ordered edit
//!   history uploaded with an item
//!
//! ## Item versions
//!
//! An item's shadowable attributes exist on two branches. **Trunk** is what
//! the user sees and edits. The **server** branch is what the remote system
//! last said. As long as the two agree the item carries no shadows. The
//! first local edit records the server version in `BASE`; a download for an
//! edited or locked item lands in `DOWNLOAD` and is merged with the item's
//! [`MergeStrategy`]. A merge that cannot settle every attribute parks the
//! server version in `CONFLICT` for the user.
//!
//! ## Key invariants
//!
//! - An item is locked by at most one holder; check-and-acquire is atomic
//! - A local edit is never overwritten without an applicable merge rule
//! - Upload markers are persisted before remote I/O starts

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connection;
mod download;
mod drain;
mod error;
mod history;
mod lock;
mod manager;
pub mod merge;
pub mod schema;
mod session;
mod state;
pub mod subtree;
#[cfg(test)]
mod testing;
mod upload;
mod version;

pub use config::SyncConfig;
pub use connection::{Connection, ConnectionState};
pub use download::DownloadDrain;
pub use drain::{EditCommit, EditDrain};
pub use error::{SyncError, SyncResult};
pub use history::{read_history, HistoryRecord};
pub use lock::{LockOwner, LockTable, SessionId};
pub use manager::SyncManager;
pub use merge::{
    MergeData, MergeOperation, MergeOutcome, MergeRegistry, MergeRegistryBuilder, MergeReport, MergeStrategy,
};
pub use session::EditSession;
pub use state::SyncState;
pub use upload::{InterruptFlag, ItemUploader, UploadItem, UploadPrepare, UploadReport, UploadResult};
pub use version::ItemVersion;
