//! Merging a downloaded server version into an item.

use super::data::MergeData;
use super::registry::MergeRegistry;
use crate::error::SyncError;
use crate::history;
use crate::schema::{
    self, BASE, CHANGE_HISTORY, CONFLICT, DONE_UPLOAD, DONE_UPLOAD_HISTORY, DOWNLOAD, INVISIBLE, UPLOAD_TASK,
};
use crate::state::SyncState;
use crate::version::ItemVersion;
use itemdb_core::{DbResult, ItemId, Reader, Writer};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error};

/// What a merge did to one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Trunk now equals the server version.
    Synchronized,
    /// Merged; local changes remain to be uploaded.
    Edited,
    /// Local and server changes conflict; the server version waits in
    /// [`CONFLICT`].
    Conflict,
    /// The item was deleted on both sides and cleared.
    Deleted,
    /// The item is locked; the merge runs when the lock is released.
    Deferred,
    /// The merge could not run. The server version stays in [`DOWNLOAD`].
    Unresolved {
        /// Why.
        reason: String,
    },
}

impl MergeOutcome {
    /// Returns true if the item still needs attention.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            MergeOutcome::Conflict | MergeOutcome::Deferred | MergeOutcome::Unresolved { .. }
        )
    }
}

/// Per-item merge outcomes of one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Outcome per item.
    pub items: BTreeMap<ItemId, MergeOutcome>,
}

impl MergeReport {
    /// An empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an outcome, replacing an earlier one for the same item.
    pub fn record(&mut self, item: ItemId, outcome: MergeOutcome) {
        self.items.insert(item, outcome);
    }

    /// The outcome for one item.
    pub fn outcome(&self, item: ItemId) -> Option<&MergeOutcome> {
        self.items.get(&item)
    }

    /// Items left unresolved, ascending.
    pub fn unresolved(&self) -> Vec<ItemId> {
        self.filter(|outcome| matches!(outcome, MergeOutcome::Unresolved { .. }))
    }

    /// Items in conflict, ascending.
    pub fn conflicts(&self) -> Vec<ItemId> {
        self.filter(|outcome| *outcome == MergeOutcome::Conflict)
    }

    /// Items whose merge was deferred, ascending.
    pub fn deferred(&self) -> Vec<ItemId> {
        self.filter(|outcome| *outcome == MergeOutcome::Deferred)
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if no item was touched.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn filter(&self, keep: impl Fn(&MergeOutcome) -> bool) -> Vec<ItemId> {
        self.items
            .iter()
            .filter(|(_, outcome)| keep(outcome))
            .map(|(item, _)| *item)
            .collect()
    }
}

/// Merges the item's pending [`DOWNLOAD`] into trunk.
///
/// The caller holds the item's lock. Store errors abort the transaction; a
/// missing strategy only leaves this item unresolved. A merge that deletes
/// the item clears only the item itself; its slaves are the caller's.
pub fn merge_item(writer: &mut Writer, item: ItemId, registry: &MergeRegistry) -> DbResult<MergeOutcome> {
    let Some(trunk) = ItemVersion::trunk(&*writer, item) else {
        return Ok(MergeOutcome::Deleted);
    };
    let Some(server) = ItemVersion::shadow(&*writer, item, &*DOWNLOAD) else {
        return Ok(settled(&*writer, item));
    };
    if awaits_server_version(&*writer, item) {
        let sent = ItemVersion::shadow(&*writer, item, &*DONE_UPLOAD);
        if !finish_upload(writer, item, sent, server)? {
            debug!(%item, "uploaded delete confirmed by download");
            return Ok(MergeOutcome::Deleted);
        }
        writer.clear_value(item, &*DOWNLOAD)?;
        normalize(writer, item)?;
        let outcome = settled(&*writer, item);
        debug!(%item, ?outcome, "upload finished by download");
        return Ok(outcome);
    }
    let Some(base) = ItemVersion::shadow(&*writer, item, &*BASE) else {
        return take_server(writer, item, server);
    };

    let history = history::read_history(&*writer, item);
    let mut data = MergeData::new(base, trunk, server.clone()).with_history(history.clone());
    if !data.has_local_changes() {
        return take_server(writer, item, server);
    }
    if !data.has_server_changes() {
        writer.clear_value(item, &*DOWNLOAD)?;
        normalize(writer, item)?;
        return Ok(settled(&*writer, item));
    }

    let connection = schema::connection_id(&*writer, item);
    let item_type = schema::type_id(&*writer, item).unwrap_or_default();
    let Some(strategy) = registry.find(connection.as_deref(), &item_type) else {
        let reason = SyncError::MissingMergeStrategy {
            item,
            item_type,
            connection: connection.unwrap_or_else(|| "*".to_string()),
        }
        .to_string();
        error!(%item, %reason, "item left unresolved");
        return Ok(MergeOutcome::Unresolved { reason });
    };

    // A delete on one side against an edit on the other never resolves
    // silently.
    if data.trunk().is_invisible() != data.server().is_invisible() {
        data.mark_conflict(INVISIBLE.id());
    }
    strategy.apply(&mut data);

    if data.is_local_discarded() {
        debug!(%item, "local edit discarded by merge");
        return take_server(writer, item, server);
    }
    let conflicts = data.conflicts();
    if !conflicts.is_empty() {
        debug!(%item, conflicts = conflicts.len(), "merge conflict");
        writer.set_value(item, &*CONFLICT, Some(server.into_values()))?;
        writer.clear_value(item, &*DOWNLOAD)?;
        return Ok(MergeOutcome::Conflict);
    }

    let resolution = data.resolution();
    if server.is_invisible() && ItemVersion::from_values(item, resolution.clone()).is_invisible() {
        writer.clear_item(item)?;
        debug!(%item, "merged delete");
        return Ok(MergeOutcome::Deleted);
    }
    if data.history() != history.as_slice() {
        history::write_history(writer, item, data.history())?;
    }
    schema::write_shadowable(writer, item, &resolution)?;
    writer.set_value(item, &*BASE, Some(server.into_values()))?;
    writer.clear_value(item, &*DOWNLOAD)?;
    writer.clear_value(item, &*CONFLICT)?;
    normalize(writer, item)?;
    let outcome = settled(&*writer, item);
    debug!(%item, ?outcome, "merged");
    Ok(outcome)
}

/// Replaces trunk with the server version and drops local state.
fn take_server(writer: &mut Writer, item: ItemId, server: ItemVersion) -> DbResult<MergeOutcome> {
    if server.is_invisible() {
        writer.clear_item(item)?;
        return Ok(MergeOutcome::Deleted);
    }
    schema::discard_to(writer, item, server.values())?;
    Ok(settled(&*writer, item))
}

/// Returns true for an item whose upload the server accepted without
/// sending its new version.
fn awaits_server_version<R: Reader + ?Sized>(reader: &R, item: ItemId) -> bool {
    let Some(row) = reader.values(item) else { return false };
    row.contains_key(DONE_UPLOAD.id())
        || (row.contains_key(DONE_UPLOAD_HISTORY.id()) && !row.contains_key(UPLOAD_TASK.id()))
}

/// Installs the server version that answers an upload of `sent`.
///
/// Attributes edited after `sent` was taken keep their trunk value; all
/// others take the server value, which also becomes the new base. The
/// history records the upload took are dropped. Returns false if the item
/// is gone, for example because a delete was uploaded.
pub(crate) fn finish_upload(
    writer: &mut Writer,
    item: ItemId,
    sent: Option<ItemVersion>,
    server: ItemVersion,
) -> DbResult<bool> {
    let done = writer.get(item, &*DONE_UPLOAD_HISTORY).unwrap_or(0);
    writer.clear_value(item, &*DONE_UPLOAD)?;
    writer.clear_value(item, &*DONE_UPLOAD_HISTORY)?;
    let Some(trunk) = ItemVersion::trunk(&*writer, item) else {
        return Ok(false);
    };
    if server.is_invisible() && trunk.is_invisible() {
        writer.clear_item(item)?;
        return Ok(false);
    }
    history::drop_uploaded(writer, item, usize::try_from(done).unwrap_or(0))?;

    let edited: BTreeSet<Arc<str>> = sent
        .map(|sent| sent.changed_attributes(&trunk))
        .unwrap_or_default();
    let mut values = server.values().clone();
    for id in &edited {
        match trunk.value(id) {
            Some(value) => values.insert(Arc::clone(id), value.clone()),
            None => values.remove(id),
        };
    }
    schema::write_shadowable(writer, item, &values)?;
    writer.set_value(item, &*BASE, Some(server.into_values()))?;
    writer.clear_value(item, &*CONFLICT)?;
    Ok(true)
}

/// Drops [`BASE`] from an item whose trunk is back at its base and that
/// carries no other shadow and no pending history.
pub(crate) fn normalize(writer: &mut Writer, item: ItemId) -> DbResult<()> {
    let Some(row) = writer.values(item) else { return Ok(()) };
    if [
        CONFLICT.id(),
        DOWNLOAD.id(),
        UPLOAD_TASK.id(),
        DONE_UPLOAD.id(),
        DONE_UPLOAD_HISTORY.id(),
        CHANGE_HISTORY.id(),
    ]
    .iter()
    .any(|id| row.contains_key(*id))
    {
        return Ok(());
    }
    let Some(base) = ItemVersion::shadow(&*writer, item, &*BASE) else { return Ok(()) };
    let trunk = ItemVersion::from_values(item, schema::shadowable_values(&*writer, &row));
    if trunk == base {
        writer.clear_value(item, &*BASE)?;
    }
    Ok(())
}

/// The outcome that describes an item's current state.
pub(crate) fn settled<R: Reader + ?Sized>(reader: &R, item: ItemId) -> MergeOutcome {
    match SyncState::of(reader, item) {
        None => MergeOutcome::Deleted,
        Some(SyncState::Synchronized) => MergeOutcome::Synchronized,
        Some(SyncState::Conflict) => MergeOutcome::Conflict,
        Some(SyncState::DownloadPending) => MergeOutcome::Deferred,
        Some(_) => MergeOutcome::Edited,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{MergeOperation, MergeRegistryBuilder, MergeStrategy};
    use itemdb_core::{AttrMap, AttrValue, Attribute, DbObject, ItemStore};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn issue() -> DbObject {
        DbObject::item_type("tracker:type:issue")
    }

    fn summary() -> Attribute<String> {
        Attribute::new("tracker:summary")
    }

    fn tags() -> Attribute<BTreeSet<String>> {
        Attribute::new("tracker:tags")
    }

    fn tag_set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn values(summary_text: &str, tag_values: &[&str]) -> AttrMap {
        let mut map = AttrMap::new();
        map.insert(Arc::from("tracker:summary"), summary_text.to_string().into_value());
        if !tag_values.is_empty() {
            map.insert(Arc::from("tracker:tags"), tag_set(tag_values).into_value());
        }
        map
    }

    /// An issue whose base is `base`, trunk `trunk` and download `download`.
    fn diverged(store: &ItemStore, base: AttrMap, trunk: AttrMap, download: AttrMap) -> ItemId {
        store
            .write(move |w: &mut Writer| -> DbResult<ItemId> {
                let issue_type = w.materialize(&issue())?;
                let item = w.next_item()?;
                w.set_value(item, &*itemdb_core::sys::TYPE, Some(issue_type))?;
                w.set_value(item, &summary(), Some("draft".to_string()))?;
                w.set_value(item, &tags(), Some(tag_set(&["draft"])))?;
                schema::write_shadowable(w, item, &trunk)?;
                w.set_value(item, &*BASE, Some(base))?;
                w.set_value(item, &*DOWNLOAD, Some(download))?;
                Ok(item)
            })
            .wait()
            .unwrap()
    }

    fn merge(store: &ItemStore, item: ItemId, registry: MergeRegistry) -> MergeOutcome {
        store
            .write(move |w: &mut Writer| merge_item(w, item, &registry))
            .wait()
            .unwrap()
    }

    fn tags_registry() -> MergeRegistry {
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

    #[test]
    fn non_overlapping_changes_merge_and_keep_local_edit() {
        let store = ItemStore::open_in_memory().unwrap();
        let item = diverged(
            &store,
            values("crash", &["b"]),
            values("crash on start", &["a", "b"]),
            values("crash", &["b", "c"]),
        );
        assert_eq!(merge(&store, item, tags_registry()), MergeOutcome::Edited);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.get(item, &tags()), Some(tag_set(&["a", "b", "c"])));
        assert_eq!(snapshot.get(item, &summary()).as_deref(), Some("crash on start"));
        assert_eq!(snapshot.get(item, &*BASE), Some(values("crash", &["b", "c"])));
        assert_eq!(snapshot.get(item, &*DOWNLOAD), None);
    }

    #[test]
    fn merge_that_reaches_the_server_version_synchronizes() {
        let store = ItemStore::open_in_memory().unwrap();
        let item = diverged(
            &store,
            values("crash", &["b"]),
            values("crash", &["b", "c"]),
            values("crash", &["c", "b"]),
        );
        assert_eq!(merge(&store, item, tags_registry()), MergeOutcome::Synchronized);
        assert_eq!(SyncState::of(&store.snapshot(), item), Some(SyncState::Synchronized));
    }

    #[test]
    fn diverging_scalar_edits_conflict() {
        let store = ItemStore::open_in_memory().unwrap();
        let item = diverged(
            &store,
            values("crash", &[]),
            values("local", &[]),
            values("server", &[]),
        );
        assert_eq!(merge(&store, item, tags_registry()), MergeOutcome::Conflict);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.get(item, &summary()).as_deref(), Some("local"));
        assert_eq!(snapshot.get(item, &*CONFLICT), Some(values("server", &[])));
        assert_eq!(snapshot.get(item, &*BASE), Some(values("crash", &[])));
    }

    fn with_history(store: &ItemStore, item: ItemId) {
        store
            .write(move |w: &mut Writer| {
                history::write_history(w, item, &[history::HistoryRecord::new("workflow", "start progress")])
            })
            .wait()
            .unwrap();
    }

    #[test]
    fn history_alone_keeps_the_item_edited() {
        let store = ItemStore::open_in_memory().unwrap();
        let item = diverged(
            &store,
            values("crash", &["b"]),
            values("crash", &["b"]),
            values("crash at startup", &["b"]),
        );
        with_history(&store, item);
        assert_eq!(merge(&store, item, tags_registry()), MergeOutcome::Edited);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.get(item, &summary()).as_deref(), Some("crash at startup"));
        assert_eq!(snapshot.get(item, &*BASE), Some(values("crash at startup", &["b"])));
        assert_eq!(history::read_history(&snapshot, item).len(), 1);
    }

    #[test]
    fn discarding_strategies_take_the_server_version() {
        let store = ItemStore::open_in_memory().unwrap();
        let item = diverged(
            &store,
            values("crash", &[]),
            values("local", &["mine"]),
            values("server", &[]),
        );
        with_history(&store, item);
        let mut builder = MergeRegistryBuilder::new();
        builder
            .register(None, &issue(), MergeStrategy::new().with(MergeOperation::DiscardLocal))
            .unwrap();
        assert_eq!(merge(&store, item, builder.freeze()), MergeOutcome::Synchronized);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.get(item, &summary()).as_deref(), Some("server"));
        assert_eq!(snapshot.get(item, &tags()), None);
        assert_eq!(snapshot.get(item, &*BASE), None);
        assert_eq!(snapshot.get(item, &*CHANGE_HISTORY), None);
    }

    #[test]
    fn missing_strategy_leaves_the_item_unresolved() {
        let store = ItemStore::open_in_memory().unwrap();
        let item = diverged(
            &store,
            values("crash", &[]),
            values("local", &[]),
            values("server", &[]),
        );
        let before = store.snapshot().values(item);
        let outcome = merge(&store, item, MergeRegistry::empty());
        assert!(matches!(outcome, MergeOutcome::Unresolved { .. }));
        assert_eq!(store.snapshot().values(item), before);
    }

    #[test]
    fn server_delete_against_local_edit_conflicts() {
        let store = ItemStore::open_in_memory().unwrap();
        let mut deleted = values("crash", &[]);
        deleted.extend(schema::invisible_values());
        let item = diverged(&store, values("crash", &[]), values("local", &[]), deleted);
        assert_eq!(merge(&store, item, tags_registry()), MergeOutcome::Conflict);
        assert!(store.snapshot().is_alive(item));
    }

    #[test]
    fn unedited_items_take_the_server_delete() {
        let store = ItemStore::open_in_memory().unwrap();
        let mut deleted = values("crash", &[]);
        deleted.extend(schema::invisible_values());
        let item = diverged(&store, values("crash", &[]), values("crash", &[]), deleted);
        assert_eq!(merge(&store, item, MergeRegistry::empty()), MergeOutcome::Deleted);
        assert!(!store.snapshot().is_alive(item));
    }

    #[test]
    fn report_groups_outcomes() {
        let mut report = MergeReport::new();
        let a = ItemId::new(1).unwrap();
        let b = ItemId::new(2).unwrap();
        report.record(a, MergeOutcome::Conflict);
        report.record(b, MergeOutcome::Unresolved { reason: "x".into() });
        assert_eq!(report.conflicts(), vec![a]);
        assert_eq!(report.unresolved(), vec![b]);
        assert!(report.outcome(b).unwrap().is_pending());
        assert_eq!(report.len(), 2);
    }
}
