//! Error types for the item store.

use crate::types::{Icn, ItemId};
use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors raised by the item store.
#[derive(Debug, Error)]
pub enum DbError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] itemdb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A journal payload could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// The journal is damaged in a way replay cannot skip.
    #[error("journal corruption at offset {offset}: {message}")]
    JournalCorruption {
        /// Byte offset of the bad record.
        offset: u64,
        /// Description of the damage.
        message: String,
    },

    /// A journal record failed its checksum.
    #[error("checksum mismatch at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Byte offset of the bad record.
        offset: u64,
        /// Checksum stored in the record.
        expected: u32,
        /// Checksum computed over the record.
        actual: u32,
    },

    /// The transaction was cancelled by its procedure or its handle.
    #[error("operation cancelled")]
    Cancelled,

    /// The transaction was aborted.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for the abort.
        reason: String,
    },

    /// Trigger work did not settle within the configured number of rounds.
    #[error("trigger cascade did not settle after {rounds} rounds")]
    TriggerCascade {
        /// Rounds that were run.
        rounds: usize,
    },

    /// A trigger with this name is already registered.
    #[error("trigger already registered: {name}")]
    DuplicateTrigger {
        /// Trigger name.
        name: String,
    },

    /// The item does not exist or was cleared.
    #[error("item not found: {item}")]
    ItemNotFound {
        /// The missing item.
        item: ItemId,
    },

    /// A value does not fit the attribute definition, or two definitions
    /// of one attribute disagree.
    #[error("schema error on {attribute}: {message}")]
    Schema {
        /// Attribute id.
        attribute: String,
        /// Description of the mismatch.
        message: String,
    },

    /// The requested snapshot has been compacted away or is in the future.
    #[error("snapshot unavailable at {icn}")]
    SnapshotUnavailable {
        /// The requested change number.
        icn: Icn,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Another process holds the store directory.
    #[error("store locked: another process has exclusive access")]
    StoreLocked,

    /// The store directory does not exist or is not a store.
    #[error("invalid store: {message}")]
    InvalidStore {
        /// Description of the problem.
        message: String,
    },

    /// The store has shut down before the work could run.
    #[error("store is closed")]
    StoreClosed,
}

impl DbError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a journal corruption error.
    pub fn journal_corruption(offset: u64, message: impl Into<String>) -> Self {
        Self::JournalCorruption {
            offset,
            message: message.into(),
        }
    }

    /// Creates a transaction aborted error.
    pub fn transaction_aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Creates a schema error.
    pub fn schema(attribute: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            attribute: attribute.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid store error.
    pub fn invalid_store(message: impl Into<String>) -> Self {
        Self::InvalidStore {
            message: message.into(),
        }
    }

    /// Returns true for the cancellation signal.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_recognised() {
        assert!(DbError::Cancelled.is_cancelled());
        assert!(!DbError::StoreClosed.is_cancelled());
    }

    #[test]
    fn error_display() {
        let err = DbError::ChecksumMismatch {
            offset: 42,
            expected: 0xdead_beef,
            actual: 1,
        };
        assert_eq!(
            err.to_string(),
            "checksum mismatch at offset 42: expected deadbeef, got 00000001"
        );
        let err = DbError::TriggerCascade { rounds: 16 };
        assert!(err.to_string().contains("16"));
    }
}
