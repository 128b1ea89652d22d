//! Writing downloaded server data.

use crate::error::SyncResult;
use crate::manager::{ManagerInner, MergeRun};
use crate::merge::{MergeOutcome, MergeReport};
use crate::schema::{self, CONNECTION, DOWNLOAD};
use crate::subtree;
use crate::version::ItemVersion;
use itemdb_core::{sys, AttrMap, AttrValue, Attribute, AttributeKey, DbObject, ItemId, Reader, Value, Writer};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Write access for server data.
///
/// Items without local state are written straight to trunk. Items that
/// carry a local edit, a conflict, an upload marker or a lock are diverted:
/// their server values collect in [`DOWNLOAD`] and the item is merged when
/// the procedure returns.
pub struct DownloadDrain<'w> {
    writer: &'w mut Writer,
    manager: &'w ManagerInner,
    diverted: HashMap<ItemId, bool>,
    direct: MergeReport,
    queued: BTreeSet<ItemId>,
}

impl<'w> DownloadDrain<'w> {
    pub(crate) fn new(writer: &'w mut Writer, manager: &'w ManagerInner) -> Self {
        Self {
            writer,
            manager,
            diverted: HashMap::new(),
            direct: MergeReport::new(),
            queued: BTreeSet::new(),
        }
    }

    /// The transaction's view.
    pub fn reader(&self) -> &Writer {
        self.writer
    }

    /// Materializes an object, such as an item type.
    ///
    /// # Errors
    ///
    /// Store errors pass through.
    pub fn materialize(&mut self, object: &DbObject) -> SyncResult<ItemId> {
        Ok(self.writer.materialize(object)?)
    }

    /// Creates an item that arrived from the server.
    ///
    /// # Errors
    ///
    /// Store errors pass through.
    pub fn create_item(&mut self, item_type: &DbObject) -> SyncResult<ItemId> {
        let type_item = self.writer.materialize(item_type)?;
        let item = self.writer.next_item()?;
        self.writer.set_value(item, &*sys::TYPE, Some(type_item))?;
        self.diverted.insert(item, false);
        Ok(item)
    }

    /// Assigns the item to a connection.
    ///
    /// # Errors
    ///
    /// Store errors pass through.
    pub fn set_connection(&mut self, item: ItemId, connection: &str) -> SyncResult<()> {
        let object = self.writer.materialize(&schema::connection_object(connection))?;
        self.writer.set_value(item, &*CONNECTION, Some(object))?;
        Ok(())
    }

    /// Sets a typed server value.
    ///
    /// # Errors
    ///
    /// Store errors pass through.
    pub fn set_value<T: AttrValue>(&mut self, item: ItemId, attribute: &Attribute<T>, value: Option<T>) -> SyncResult<()> {
        self.set_raw(item, attribute.key(), value.map(AttrValue::into_value))
    }

    /// Sets an untyped server value. Local attributes always go to trunk.
    ///
    /// # Errors
    ///
    /// Store errors pass through.
    pub fn set_raw(&mut self, item: ItemId, key: &AttributeKey, value: Option<Value>) -> SyncResult<()> {
        if !key.is_shadowable() {
            self.writer.set_raw(item, key, value)?;
            return Ok(());
        }
        if !self.is_diverted(item) {
            self.writer.set_raw(item, key, value)?;
            self.direct.record(item, MergeOutcome::Synchronized);
            return Ok(());
        }
        self.writer.define_attribute(key)?;
        let mut download = self.download_values(item);
        match value.and_then(Value::normalized) {
            Some(value) => download.insert(Arc::clone(key.id()), value),
            None => download.remove(key.id()),
        };
        self.writer.set_value(item, &*DOWNLOAD, Some(download))?;
        self.queued.insert(item);
        Ok(())
    }

    /// Applies a server-side delete to an item and its slaves.
    ///
    /// If any item of the subtree carries local state or a lock, the delete
    /// goes through a merge of the master.
    ///
    /// # Errors
    ///
    /// Store errors pass through.
    pub fn delete_item(&mut self, item: ItemId) -> SyncResult<()> {
        if !self.writer.is_alive(item) {
            return Ok(());
        }
        let members = subtree::slaves_subtree(&*self.writer, item);
        let mut diverted = false;
        for member in &members {
            diverted |= self.is_diverted(*member);
        }
        if diverted {
            self.writer.set_value(item, &*DOWNLOAD, Some(schema::invisible_values()))?;
            self.diverted.insert(item, true);
            self.queued.insert(item);
            return Ok(());
        }
        for member in members {
            if self.writer.is_alive(member) {
                self.writer.clear_item(member)?;
            }
            self.direct.record(member, MergeOutcome::Deleted);
        }
        Ok(())
    }

    fn is_diverted(&mut self, item: ItemId) -> bool {
        let writer = &*self.writer;
        let locks = &self.manager.locks;
        *self
            .diverted
            .entry(item)
            .or_insert_with(|| schema::has_local_state(writer, item) || locks.find_lock(item).is_some())
    }

    /// The server version collected so far.
    fn download_values(&self, item: ItemId) -> AttrMap {
        match self.writer.get(item, &*DOWNLOAD) {
            Some(values) => values,
            None => ItemVersion::server(&*self.writer, item)
                .map(ItemVersion::into_values)
                .unwrap_or_default(),
        }
    }

    /// Merges the diverted items.
    pub(crate) fn finish(self, run: &mut MergeRun) -> SyncResult<()> {
        for (item, outcome) in self.direct.items {
            run.record(item, outcome);
        }
        for item in self.queued {
            run.merge(self.manager, self.writer, item)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::merge::MergeOutcome;
    use crate::schema::DOWNLOAD;
    use crate::testing::{download_comment, download_issue, edit_summary, manager, status, summary, tag_set, tags};
    use crate::{DownloadDrain, SyncResult, SyncState};
    use itemdb_core::Reader;

    #[test]
    fn new_items_land_on_trunk() {
        let manager = manager();
        let item = download_issue(&manager, "crash", &["ui"]);
        let snapshot = manager.store().snapshot();
        assert_eq!(snapshot.get(item, &summary()).as_deref(), Some("crash"));
        assert_eq!(snapshot.get(item, &tags()), Some(tag_set(&["ui"])));
        assert_eq!(manager.sync_state(item), Some(SyncState::Synchronized));
    }

    #[test]
    fn locked_items_collect_the_download() {
        let manager = manager();
        let item = download_issue(&manager, "crash", &["ui"]);
        let session = manager.prepare_edit(&[item]).unwrap();

        let report = manager
            .write_downloaded(move |drain: &mut DownloadDrain<'_>| -> SyncResult<()> {
                drain.set_value(item, &status(), Some("open".to_string()))?;
                drain.set_value(item, &tags(), None)
            })
            .wait()
            .unwrap();
        assert_eq!(report.outcome(item), Some(&MergeOutcome::Deferred));

        let snapshot = manager.store().snapshot();
        let download = snapshot.get(item, &*DOWNLOAD).unwrap();
        assert_eq!(download.len(), 2);
        assert!(download.contains_key(summary().id()));
        assert!(!download.contains_key(tags().id()));
        assert_eq!(snapshot.get(item, &status()), None);
        assert_eq!(manager.sync_state(item), Some(SyncState::DownloadPending));

        session.discard();
        manager
            .commit_edit(|_: &mut crate::EditDrain<'_>| -> SyncResult<()> { Ok(()) })
            .wait()
            .unwrap();
        let snapshot = manager.store().snapshot();
        assert_eq!(snapshot.get(item, &status()).as_deref(), Some("open"));
        assert_eq!(snapshot.get(item, &tags()), None);
        assert_eq!(manager.sync_state(item), Some(SyncState::Synchronized));
    }

    #[test]
    fn server_deletes() {
        let manager = manager();
        let quiet = download_issue(&manager, "quiet", &[]);
        let edited = download_issue(&manager, "edited", &[]);
        edit_summary(&manager, edited, "edited locally");

        let report = manager
            .write_downloaded(move |drain: &mut DownloadDrain<'_>| -> SyncResult<()> {
                drain.delete_item(quiet)?;
                drain.delete_item(edited)
            })
            .wait()
            .unwrap();
        assert_eq!(report.outcome(quiet), Some(&MergeOutcome::Deleted));
        assert_eq!(report.outcome(edited), Some(&MergeOutcome::Conflict));

        let snapshot = manager.store().snapshot();
        assert!(!snapshot.is_alive(quiet));
        assert_eq!(
            snapshot.get(edited, &summary()).as_deref(),
            Some("edited locally")
        );
        assert_eq!(manager.sync_state(edited), Some(SyncState::Conflict));
    }

    #[test]
    fn server_deletes_take_the_slaves_along() {
        let manager = manager();
        let item = download_issue(&manager, "crash", &[]);
        let note = download_comment(&manager, item, "seen on linux");
        let reply = download_comment(&manager, note, "me too");

        let report = manager
            .write_downloaded(move |drain: &mut DownloadDrain<'_>| -> SyncResult<()> { drain.delete_item(item) })
            .wait()
            .unwrap();
        for gone in [item, note, reply] {
            assert_eq!(report.outcome(gone), Some(&MergeOutcome::Deleted));
            assert!(!manager.store().snapshot().is_alive(gone));
        }
    }

    #[test]
    fn a_locked_slave_holds_back_the_master() {
        let manager = manager();
        let item = download_issue(&manager, "crash", &[]);
        let note = download_comment(&manager, item, "seen on linux");
        let session = manager.prepare_edit(&[note]).unwrap();

        let report = manager
            .write_downloaded(move |drain: &mut DownloadDrain<'_>| -> SyncResult<()> { drain.delete_item(item) })
            .wait()
            .unwrap();
        assert_eq!(report.outcome(item), Some(&MergeOutcome::Deferred));
        assert_eq!(manager.sync_state(item), Some(SyncState::DownloadPending));
        assert!(manager.store().snapshot().is_alive(note));

        session.discard();
        manager
            .commit_edit(|_: &mut crate::EditDrain<'_>| -> SyncResult<()> { Ok(()) })
            .wait()
            .unwrap();
        let snapshot = manager.store().snapshot();
        assert!(!snapshot.is_alive(item));
        assert!(!snapshot.is_alive(note));
    }
}
