//! Error types for the sync layer.

use crate::lock::LockOwner;
use itemdb_core::{DbError, ItemId, TxError};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during edits, downloads, merges and uploads.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Error from the item store.
    #[error("store error: {0}")]
    Store(#[from] DbError),

    /// The item is locked by another holder.
    #[error("{item} is locked by {owner}")]
    Locked {
        /// The contested item.
        item: ItemId,
        /// Current holder of the lock.
        owner: LockOwner,
    },

    /// The operation is not possible in the current state.
    #[error("cannot perform: {message}")]
    CannotPerform {
        /// Why not.
        message: String,
    },

    /// The item may not be uploaded right now.
    #[error("upload of {item} not allowed: {reason}")]
    UploadNotAllowed {
        /// The item.
        item: ItemId,
        /// Why not.
        reason: String,
    },

    /// No merge strategy is registered for the item's connection and type.
    #[error("no merge strategy for {item} (type {item_type}, connection {connection})")]
    MissingMergeStrategy {
        /// The unresolved item.
        item: ItemId,
        /// Identity of the item's type.
        item_type: String,
        /// Identity of the item's connection, or `*`.
        connection: String,
    },

    /// A second merge strategy was registered for the same key.
    #[error("merge strategy for type {item_type} on connection {connection} registered twice")]
    DuplicateMergeStrategy {
        /// Identity of the item type.
        item_type: String,
        /// Identity of the connection, or `*`.
        connection: String,
    },

    /// The process-wide merge registry was already installed.
    #[error("merge registry already installed")]
    RegistryAlreadyInstalled,

    /// An upload was interrupted.
    #[error("upload interrupted")]
    Interrupted,

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// No connection with this id is registered.
    #[error("unknown connection: {id}")]
    UnknownConnection {
        /// Connection id.
        id: String,
    },

    /// The edit session was already committed or discarded.
    #[error("edit session already released")]
    SessionReleased,
}

impl SyncError {
    /// Creates a "cannot perform" error.
    pub fn cannot_perform(message: impl Into<String>) -> Self {
        Self::CannotPerform {
            message: message.into(),
        }
    }

    /// Creates an "upload not allowed" error.
    pub fn upload_not_allowed(item: ItemId, reason: impl Into<String>) -> Self {
        Self::UploadNotAllowed {
            item,
            reason: reason.into(),
        }
    }

    /// Returns true for conditions a caller is expected to handle, such as a
    /// lock held by someone else. Configuration and store errors are not
    /// recoverable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::Locked { .. }
                | SyncError::CannotPerform { .. }
                | SyncError::UploadNotAllowed { .. }
                | SyncError::MissingMergeStrategy { .. }
                | SyncError::SessionReleased
                | SyncError::Interrupted
                | SyncError::Cancelled
        )
    }
}

impl TxError for SyncError {
    fn is_cancelled(&self) -> bool {
        match self {
            SyncError::Cancelled | SyncError::Interrupted => true,
            SyncError::Store(e) => e.is_cancelled(),
            _ => false,
        }
    }
}
