//! Local edits inside a commit transaction.

use crate::error::{SyncError, SyncResult};
use crate::history::{self, HistoryRecord};
use crate::lock::LockOwner;
use crate::manager::{ManagerInner, MergeRun};
use crate::merge;
use crate::schema::{self, BASE, CONFLICT, CONNECTION, DOWNLOAD, INVISIBLE, UPLOAD_TASK};
use crate::subtree;
use crate::version::ItemVersion;
use itemdb_core::{sys, AttrValue, Attribute, AttributeKey, DbObject, ItemId, Reader, Value, Writer};
use std::collections::BTreeSet;
use tracing::debug;

/// The work of an edit commit.
///
/// [`EditCommit::perform_commit`] runs inside the write transaction and may
/// abort it by returning an error ([`SyncError::Cancelled`] aborts without
/// counting as a failure). [`EditCommit::on_commit_finished`] runs once the
/// transaction is durable or definitely failed; it is where an upload after
/// saving is chained.
///
/// Closures implement this trait:
///
/// ```rust,ignore
/// manager.commit_edit(move |drain: &mut EditDrain<'_>| -> SyncResult<()> {
///     drain.set_value(item, &status, Some("done".to_string()))
/// });
/// ```
pub trait EditCommit: Send + 'static {
    /// Performs the edit.
    ///
    /// # Errors
    ///
    /// Any error aborts the transaction.
    fn perform_commit(&mut self, drain: &mut EditDrain<'_>) -> SyncResult<()>;

    /// Called after the transaction finished.
    fn on_commit_finished(&mut self, success: bool) {
        let _ = success;
    }
}

impl<F> EditCommit for F
where
    F: FnMut(&mut EditDrain<'_>) -> SyncResult<()> + Send + 'static,
{
    fn perform_commit(&mut self, drain: &mut EditDrain<'_>) -> SyncResult<()> {
        self(drain)
    }
}

/// Write access for local edits.
///
/// Changing a shadowable value first records the item's server version in
/// [`BASE`]. When the commit procedure returns, items whose trunk is back at
/// that base become synchronized again.
pub struct EditDrain<'w> {
    writer: &'w mut Writer,
    manager: &'w ManagerInner,
    owner: Option<LockOwner>,
    based: BTreeSet<ItemId>,
}

impl<'w> EditDrain<'w> {
    pub(crate) fn new(writer: &'w mut Writer, manager: &'w ManagerInner, owner: Option<LockOwner>) -> Self {
        Self {
            writer,
            manager,
            owner,
            based: BTreeSet::new(),
        }
    }

    /// The transaction's view, including changes made so far.
    pub fn reader(&self) -> &Writer {
        self.writer
    }

    /// Raw writer access for local attributes. Shadowable values written
    /// here bypass change tracking.
    pub fn writer(&mut self) -> &mut Writer {
        self.writer
    }

    /// Checks the item's lock.
    fn check_lock(&self, item: ItemId) -> SyncResult<()> {
        match self.manager.locks.find_lock(item) {
            Some(holder) if Some(holder) != self.owner => {
                debug!(%item, %holder, "edit refused, item locked");
                Err(SyncError::Locked { item, owner: holder })
            }
            _ => Ok(()),
        }
    }

    /// Prepares an item for a local change: checks its lock and records its
    /// server version on first change.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Locked`] if another holder has the item and
    /// [`SyncError::CannotPerform`] if the item does not exist.
    pub fn change_item(&mut self, item: ItemId) -> SyncResult<()> {
        if self.based.contains(&item) {
            return Ok(());
        }
        self.check_lock(item)?;
        let Some(trunk) = ItemVersion::trunk(&*self.writer, item) else {
            return Err(SyncError::cannot_perform(format!("{item} does not exist")));
        };
        if self.writer.get(item, &*BASE).is_none() {
            self.writer.set_value(item, &*BASE, Some(trunk.into_values()))?;
        }
        self.based.insert(item);
        Ok(())
    }

    /// Sets a typed value.
    ///
    /// # Errors
    ///
    /// See [`EditDrain::change_item`]; store errors pass through.
    pub fn set_value<T: AttrValue>(&mut self, item: ItemId, attribute: &Attribute<T>, value: Option<T>) -> SyncResult<()> {
        self.set_raw(item, attribute.key(), value.map(AttrValue::into_value))
    }

    /// Sets an untyped value.
    ///
    /// # Errors
    ///
    /// See [`EditDrain::change_item`]; store errors pass through.
    pub fn set_raw(&mut self, item: ItemId, key: &AttributeKey, value: Option<Value>) -> SyncResult<()> {
        if key.is_shadowable() {
            self.change_item(item)?;
        } else {
            self.check_lock(item)?;
        }
        self.writer.set_raw(item, key, value)?;
        Ok(())
    }

    /// Creates an item that exists only locally until uploaded.
    ///
    /// # Errors
    ///
    /// Store errors pass through.
    pub fn create_item(&mut self, item_type: &DbObject) -> SyncResult<ItemId> {
        let type_item = self.writer.materialize(item_type)?;
        let item = self.writer.next_item()?;
        self.writer.set_value(item, &*sys::TYPE, Some(type_item))?;
        self.writer.set_value(item, &*BASE, Some(schema::invisible_values()))?;
        self.based.insert(item);
        Ok(item)
    }

    /// Assigns the item to a connection.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Locked`] for an item locked by someone else.
    pub fn set_connection(&mut self, item: ItemId, connection: &str) -> SyncResult<()> {
        self.check_lock(item)?;
        let object = self.writer.materialize(&schema::connection_object(connection))?;
        self.writer.set_value(item, &*CONNECTION, Some(object))?;
        Ok(())
    }

    /// Appends a step to the item's edit history. The step is uploaded with
    /// the item, after its attribute changes.
    ///
    /// # Errors
    ///
    /// See [`EditDrain::change_item`].
    pub fn add_history(&mut self, item: ItemId, record: HistoryRecord) -> SyncResult<()> {
        self.change_item(item)?;
        let mut records = history::read_history(&*self.writer, item);
        records.push(record);
        history::write_history(self.writer, item, &records)?;
        Ok(())
    }

    /// Deletes an item and its slaves locally. Items that were never
    /// uploaded are cleared right away; others stay invisible until the
    /// delete is uploaded.
    ///
    /// # Errors
    ///
    /// See [`EditDrain::change_item`]. Nothing is deleted if any item of the
    /// subtree is locked by someone else.
    pub fn delete_item(&mut self, item: ItemId) -> SyncResult<()> {
        let members = subtree::slaves_subtree(&*self.writer, item);
        for member in &members {
            self.check_lock(*member)?;
        }
        self.delete_one(item)?;
        for slave in members.into_iter().filter(|member| *member != item) {
            if self.writer.is_alive(slave) {
                self.delete_one(slave)?;
            }
        }
        Ok(())
    }

    fn delete_one(&mut self, item: ItemId) -> SyncResult<()> {
        self.change_item(item)?;
        let never_uploaded = ItemVersion::shadow(&*self.writer, item, &*BASE).is_some_and(|base| base.is_invisible());
        if never_uploaded {
            self.writer.clear_item(item)?;
            self.based.remove(&item);
        } else {
            self.writer.set_value(item, &*INVISIBLE, Some(true))?;
        }
        Ok(())
    }

    /// Reverts trunk to the newest server version and drops local state,
    /// the edit history included. If the server deleted the item, the item
    /// and its slaves are cleared.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Locked`] for an item locked by someone else.
    pub fn discard_changes(&mut self, item: ItemId) -> SyncResult<()> {
        self.check_lock(item)?;
        let Some(server) = ItemVersion::server(&*self.writer, item) else {
            return Ok(());
        };
        if server.is_invisible() {
            let members = subtree::slaves_subtree(&*self.writer, item);
            for member in &members {
                self.check_lock(*member)?;
            }
            for member in members {
                if self.writer.is_alive(member) {
                    self.writer.clear_item(member)?;
                }
                self.based.remove(&member);
            }
            return Ok(());
        }
        schema::discard_to(self.writer, item, server.values())?;
        self.based.remove(&item);
        Ok(())
    }

    /// Accepts the local version over a conflicting server version.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::CannotPerform`] if the item has no conflict.
    pub fn mark_merged(&mut self, item: ItemId) -> SyncResult<()> {
        self.check_lock(item)?;
        let Some(conflict) = self.writer.get(item, &*CONFLICT) else {
            return Err(SyncError::cannot_perform(format!("{item} has no conflict")));
        };
        self.writer.set_value(item, &*BASE, Some(conflict))?;
        self.writer.clear_value(item, &*CONFLICT)?;
        self.based.insert(item);
        Ok(())
    }

    /// Normalizes changed items and merges server versions that arrived
    /// while they were locked.
    pub(crate) fn finish(self, run: &mut MergeRun) -> SyncResult<()> {
        let mut candidates = self.based.clone();
        if let Some(owner) = self.owner {
            candidates.extend(self.manager.locks.items_of(owner));
        }
        for item in &self.based {
            merge::normalize(self.writer, *item)?;
        }
        for item in candidates {
            let pending = self
                .writer
                .values(item)
                .is_some_and(|row| row.contains_key(DOWNLOAD.id()) && !row.contains_key(UPLOAD_TASK.id()));
            if pending {
                run.merge(self.manager, self.writer, item)?;
            }
        }
        Ok(())
    }
}
