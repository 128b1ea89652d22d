//! Auto-merge engine.
//!
//! When a server version arrives for an item with local changes, the item's
//! [`MergeStrategy`] reconciles trunk and server values:
//!
//! 1. [`MergeRegistry::find`] selects the strategy for the item's
//!    connection and type.
//! 2. The strategy's [`MergeOperation`]s run in order over a [`MergeData`].
//! 3. [`merge_item`] installs the resolution, or parks the server version in
//!    the conflict shadow. An operation may instead discard the whole local
//!    edit.

mod data;
mod engine;
mod operation;
mod registry;
mod strategy;

pub use data::MergeData;
pub use engine::{merge_item, MergeOutcome, MergeReport};
pub(crate) use engine::{finish_upload, normalize, settled};
pub use operation::{unite, unite_text, CustomMerge, MergeOperation};
pub use registry::{MergeRegistry, MergeRegistryBuilder};
pub use strategy::MergeStrategy;
