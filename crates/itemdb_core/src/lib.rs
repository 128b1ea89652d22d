//! # itemdb core
//!
//! Embedded, versioned item-attribute store.
//!
//! This crate provides:
//! - The attribute schema: typed attributes, item types and the system schema
//! - [`ItemStore`]: serialized write transactions, concurrent snapshot reads,
//!   item change numbers (ICNs) and a durable commit journal
//! - [`Predicate`] and [`Query`] for evaluating boolean expressions over a
//!   [`Reader`]
//! - Live queries that receive per-commit deltas instead of rescanning
//! - Triggers that run inside the committing transaction
//! - Gates, lifetimes and transaction handles for delivering results on a
//!   chosen execution context
//!
//! ```rust,ignore
//! use itemdb_core::{Attribute, DbError, ItemStore, Predicate, Reader};
//!
//! let store = ItemStore::open_in_memory()?;
//! let status: Attribute<String> = Attribute::new("tracker:status");
//!
//! let s = status.clone();
//! store.write(move |w| {
//!     let item = w.next_item()?;
//!     w.set_value(item, &s, Some("open".into()))?;
//!     Ok::<_, DbError>(())
//! }).wait()?;
//!
//! let open = store
//!     .snapshot()
//!     .query(Predicate::equals(&status, "open".to_string()))
//!     .copy_items_sorted();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod config;
mod dir;
mod error;
mod gate;
mod handle;
mod journal;
mod lifetime;
mod live;
mod modifiable;
mod query;
mod queue;
mod reader;
mod schema;
mod store;
mod table;
mod trigger;
mod types;
mod value;
mod writer;

pub use change_feed::{ChangeFeed, CommitEvent};
pub use config::StoreConfig;
pub use error::{DbError, DbResult};
pub use gate::{straight, Gate, Job, Straight, ThreadGate};
pub use handle::{CancellationToken, TxError, TxHandle, TxStatus};
pub use journal::{
    compute_crc32, read_journal, CommitRecord, JournalScan, RecordKind, ScannedRecord,
    JOURNAL_MAGIC, JOURNAL_VERSION,
};
pub use lifetime::Lifetime;
pub use live::{LiveQueryEvent, LiveQueryListener};
pub use modifiable::SimpleModifiable;
pub use query::{Predicate, Query, ResolvedPredicate};
pub use queue::Priority;
pub use reader::{Reader, Snapshot};
pub use schema::{sys, AttrValue, Attribute, AttributeKey, DbObject, ScalarValue};
pub use store::ItemStore;
pub use table::{Row, RowChange};
pub use trigger::TriggerFn;
pub use types::{Icn, ItemId};
pub use value::{AttrMap, Composition, Scalar, ScalarType, Value, ValueKind};
pub use writer::Writer;

/// Location of the journal inside a store directory.
///
/// Tools use this to read a journal without opening (and locking) the store.
#[must_use]
pub fn journal_path(store_dir: &std::path::Path) -> std::path::PathBuf {
    dir::StoreDir::journal_path_in(store_dir)
}
