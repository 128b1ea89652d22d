//! Fixtures shared by the unit tests.

use crate::{
    Connection, ConnectionState, DownloadDrain, EditDrain, MergeOperation, MergeRegistry, MergeRegistryBuilder,
    MergeStrategy, SyncConfig, SyncManager, SyncResult,
};
use crate::subtree::define_master_reference;
use itemdb_core::{Attribute, DbObject, ItemId, ItemStore, Writer};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

pub(crate) fn issue() -> DbObject {
    DbObject::item_type("tracker:type:issue")
}

pub(crate) fn comment() -> DbObject {
    DbObject::item_type("tracker:type:comment")
}

/// Points a comment at its issue, or a reply at its comment.
pub(crate) fn parent() -> Attribute<ItemId> {
    Attribute::new("tracker:parent")
}

pub(crate) fn summary() -> Attribute<String> {
    Attribute::new("tracker:summary")
}

pub(crate) fn status() -> Attribute<String> {
    Attribute::new("tracker:status")
}

pub(crate) fn tags() -> Attribute<BTreeSet<String>> {
    Attribute::new("tracker:tags")
}

pub(crate) fn tag_set(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Unites tags; every other attribute needs no strategy of its own.
pub(crate) fn tags_registry() -> MergeRegistry {
    let mut builder = MergeRegistryBuilder::new();
    builder
        .register(
            None,
            &issue(),
            MergeStrategy::new().with(MergeOperation::unite_sets(&[tags().key()])),
        )
        .unwrap();
    builder.freeze()
}

pub(crate) fn manager_with(registry: MergeRegistry, config: SyncConfig) -> SyncManager {
    let store = Arc::new(ItemStore::open_in_memory().unwrap());
    store
        .write(|w: &mut Writer| define_master_reference(w, &parent()))
        .wait()
        .unwrap();
    SyncManager::new(store, registry, config).unwrap()
}

pub(crate) fn manager() -> SyncManager {
    manager_with(tags_registry(), SyncConfig::default())
}

/// Downloads a new issue.
pub(crate) fn download_issue(manager: &SyncManager, text: &str, tag_values: &[&str]) -> ItemId {
    let text = text.to_string();
    let tag_values = tag_set(tag_values);
    let created = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&created);
    manager
        .write_downloaded(move |drain: &mut DownloadDrain<'_>| -> SyncResult<()> {
            let item = drain.create_item(&issue())?;
            drain.set_value(item, &summary(), Some(text))?;
            drain.set_value(item, &tags(), Some(tag_values))?;
            *slot.lock() = Some(item);
            Ok(())
        })
        .wait()
        .unwrap();
    let item = created.lock().take();
    item.unwrap()
}

/// Downloads a comment below `master`.
pub(crate) fn download_comment(manager: &SyncManager, master: ItemId, text: &str) -> ItemId {
    let text = text.to_string();
    let created = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&created);
    manager
        .write_downloaded(move |drain: &mut DownloadDrain<'_>| -> SyncResult<()> {
            let item = drain.create_item(&comment())?;
            drain.set_value(item, &parent(), Some(master))?;
            drain.set_value(item, &summary(), Some(text))?;
            *slot.lock() = Some(item);
            Ok(())
        })
        .wait()
        .unwrap();
    let item = created.lock().take();
    item.unwrap()
}

/// Commits a summary change without a session.
pub(crate) fn edit_summary(manager: &SyncManager, item: ItemId, text: &str) {
    let text = text.to_string();
    manager
        .commit_edit(move |drain: &mut EditDrain<'_>| -> SyncResult<()> {
            drain.set_value(item, &summary(), Some(text.clone()))
        })
        .wait()
        .unwrap();
}

/// A connection whose state tests can flip.
pub(crate) struct TestConnection {
    pub(crate) id: String,
    pub(crate) state: Mutex<ConnectionState>,
}

impl TestConnection {
    pub(crate) fn ready(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            state: Mutex::new(ConnectionState::Ready),
        })
    }
}

impl Connection for TestConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }
}
