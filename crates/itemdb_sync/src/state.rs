//! Synchronization state of an item.

use crate::schema::{BASE, CHANGE_HISTORY, CONFLICT, DONE_UPLOAD, DONE_UPLOAD_HISTORY, DOWNLOAD, UPLOAD_TASK};
use crate::version::ItemVersion;
use itemdb_core::{ItemId, Reader};
use std::fmt;

/// How an item relates to its server version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// Trunk equals the last known server version.
    Synchronized,
    /// Created locally and never uploaded.
    New,
    /// Changed locally.
    Edited,
    /// Deleted locally, not yet uploaded.
    LocalDelete,
    /// A server change conflicts with the local edit.
    Conflict,
    /// A server version waits to be merged.
    DownloadPending,
    /// An upload is in progress.
    Uploading,
    /// An upload was started but its outcome is unknown (for example after
    /// a restart).
    UploadUnconfirmed,
}

impl SyncState {
    /// Derives the state from the item's shadows.
    ///
    /// Never returns [`SyncState::UploadUnconfirmed`]; only the sync manager
    /// knows which uploads are still running.
    pub fn of<R: Reader + ?Sized>(reader: &R, item: ItemId) -> Option<Self> {
        let row = reader.values(item)?;
        if row.contains_key(UPLOAD_TASK.id()) {
            return Some(SyncState::Uploading);
        }
        if row.contains_key(CONFLICT.id()) {
            return Some(SyncState::Conflict);
        }
        // An unmerged server version outranks the local edit.
        if row.contains_key(DOWNLOAD.id()) {
            return Some(SyncState::DownloadPending);
        }
        // Accepted by the server, which has not sent its version back yet.
        if let Some(sent) = ItemVersion::shadow(reader, item, &*DONE_UPLOAD) {
            let trunk = ItemVersion::trunk(reader, item)?;
            let recorded = reader.get(item, &*CHANGE_HISTORY).map_or(0, |history| history.len());
            let sent_steps = reader.get(item, &*DONE_UPLOAD_HISTORY).unwrap_or(0);
            if sent.changed_attributes(&trunk).is_empty() && i64::try_from(recorded).unwrap_or(i64::MAX) <= sent_steps {
                return Some(SyncState::Synchronized);
            }
        }
        if let Some(base) = ItemVersion::shadow(reader, item, &*BASE) {
            let trunk = ItemVersion::trunk(reader, item)?;
            return Some(if trunk.is_invisible() {
                SyncState::LocalDelete
            } else if base.is_invisible() {
                SyncState::New
            } else {
                SyncState::Edited
            });
        }
        Some(SyncState::Synchronized)
    }

    /// Returns true if the item has local changes not yet on the server.
    pub const fn has_local_changes(self) -> bool {
        matches!(
            self,
            SyncState::New | SyncState::Edited | SyncState::LocalDelete | SyncState::Conflict
        )
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Synchronized => "synchronized",
            SyncState::New => "new",
            SyncState::Edited => "edited",
            SyncState::LocalDelete => "local-delete",
            SyncState::Conflict => "conflict",
            SyncState::DownloadPending => "download-pending",
            SyncState::Uploading => "uploading",
            SyncState::UploadUnconfirmed => "upload-unconfirmed",
        };
        f.write_str(name)
    }
}
