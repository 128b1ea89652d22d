//! Connection abstraction.

use itemdb_core::{ItemId, Snapshot};
use std::fmt;

/// State of a connection to a remote system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected and accepting uploads.
    Ready,
    /// Going offline or misbehaving; no new uploads.
    Degrading,
    /// Offline.
    Disconnected,
}

impl ConnectionState {
    /// Returns true if uploads may start.
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Ready => f.write_str("ready"),
            ConnectionState::Degrading => f.write_str("degrading"),
            ConnectionState::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// A remote system items are synchronized with.
///
/// Items belong to a connection through their
/// [`CONNECTION`](crate::schema::CONNECTION) attribute.
pub trait Connection: Send + Sync {
    /// Stable identity, also used as the merge registry key.
    fn id(&self) -> &str;

    /// Current state.
    fn state(&self) -> ConnectionState;

    /// Upload policy for one item. Allows everything by default.
    fn is_upload_allowed(&self, snapshot: &Snapshot, item: ItemId) -> bool {
        let _ = (snapshot, item);
        true
    }
}
