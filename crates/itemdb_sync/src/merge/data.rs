//! Per-item merge input and working state.

use crate::history::HistoryRecord;
use crate::version::ItemVersion;
use itemdb_core::{AttrMap, ItemId, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Three versions of one item and the resolution built from them.
///
/// Merge operations run in order against the same `MergeData`; each sees
/// what earlier operations resolved. Attributes no operation touches are
/// resolved per attribute: the server value if only the server changed it,
/// the trunk value otherwise. An attribute changed differently on both sides
/// and left unresolved is a conflict.
///
/// An operation may also give up the whole local edit with
/// [`MergeData::discard_local_edit`]; the item then takes the server
/// version as is.
#[derive(Debug, Clone)]
pub struct MergeData {
    item: ItemId,
    base: ItemVersion,
    trunk: ItemVersion,
    server: ItemVersion,
    resolution: BTreeMap<Arc<str>, Option<Value>>,
    flagged: BTreeSet<Arc<str>>,
    history: Vec<HistoryRecord>,
    discard_local: bool,
}

impl MergeData {
    /// Creates merge input from the base, trunk and server versions.
    pub fn new(base: ItemVersion, trunk: ItemVersion, server: ItemVersion) -> Self {
        Self {
            item: trunk.item(),
            base,
            trunk,
            server,
            resolution: BTreeMap::new(),
            flagged: BTreeSet::new(),
            history: Vec::new(),
            discard_local: false,
        }
    }

    /// Adds the item's pending edit history.
    #[must_use]
    pub fn with_history(mut self, history: Vec<HistoryRecord>) -> Self {
        self.history = history;
        self
    }

    /// The merged item.
    pub fn item(&self) -> ItemId {
        self.item
    }

    /// Server version from before the local edit.
    pub fn base(&self) -> &ItemVersion {
        &self.base
    }

    /// Local version.
    pub fn trunk(&self) -> &ItemVersion {
        &self.trunk
    }

    /// New server version.
    pub fn server(&self) -> &ItemVersion {
        &self.server
    }

    /// Every attribute id present in any of the three versions.
    pub fn attributes(&self) -> BTreeSet<Arc<str>> {
        self.base
            .values()
            .keys()
            .chain(self.trunk.values().keys())
            .chain(self.server.values().keys())
            .cloned()
            .collect()
    }

    /// Returns true if the local edit changed the attribute.
    pub fn local_changed(&self, id: &str) -> bool {
        self.trunk.value(id) != self.base.value(id)
    }

    /// Returns true if the server changed the attribute.
    pub fn server_changed(&self, id: &str) -> bool {
        self.server.value(id) != self.base.value(id)
    }

    /// Returns true if the local edit changed anything or left history.
    pub fn has_local_changes(&self) -> bool {
        !self.history.is_empty() || !self.trunk.changed_attributes(&self.base).is_empty()
    }

    /// Edit steps waiting for upload, oldest first.
    pub fn history(&self) -> &[HistoryRecord] {
        &self.history
    }

    /// Replaces the pending history, for steps the server version made
    /// obsolete.
    pub fn replace_history(&mut self, history: Vec<HistoryRecord>) {
        self.history = history;
    }

    /// Drops the whole local edit in favor of the server version.
    pub fn discard_local_edit(&mut self) {
        self.discard_local = true;
    }

    /// Returns true once an operation discarded the local edit.
    pub fn is_local_discarded(&self) -> bool {
        self.discard_local
    }

    /// Returns true if the server changed anything.
    pub fn has_server_changes(&self) -> bool {
        !self.server.changed_attributes(&self.base).is_empty()
    }

    /// The local side as seen by the next operation: an explicit resolution
    /// if an earlier operation made one, else the trunk value.
    pub fn local_value(&self, id: &str) -> Option<Value> {
        match self.resolution.get(id) {
            Some(value) => value.clone(),
            None => self.trunk.value(id).cloned(),
        }
    }

    /// The value the merge would install right now.
    pub fn resolved(&self, id: &str) -> Option<Value> {
        if self.discard_local {
            return self.server.value(id).cloned();
        }
        if let Some(value) = self.resolution.get(id) {
            return value.clone();
        }
        if self.local_changed(id) {
            self.trunk.value(id).cloned()
        } else {
            self.server.value(id).cloned()
        }
    }

    /// Returns true if an operation resolved the attribute explicitly.
    pub fn is_resolved(&self, id: &str) -> bool {
        self.resolution.contains_key(id)
    }

    /// Resolves an attribute. Clears a conflict flag set earlier.
    pub fn resolve(&mut self, id: &str, value: Option<Value>) {
        let id: Arc<str> = Arc::from(id);
        self.flagged.remove(&id);
        self.resolution.insert(id, value.and_then(Value::normalized));
    }

    /// Flags an attribute for manual resolution.
    pub fn mark_conflict(&mut self, id: &str) {
        self.flagged.insert(Arc::from(id));
    }

    /// Attributes that need manual resolution.
    pub fn conflicts(&self) -> BTreeSet<Arc<str>> {
        if self.discard_local {
            return BTreeSet::new();
        }
        self.attributes()
            .into_iter()
            .filter(|id| {
                self.flagged.contains(id)
                    || (!self.resolution.contains_key(id)
                        && self.local_changed(id)
                        && self.server_changed(id)
                        && self.trunk.value(id) != self.server.value(id))
            })
            .collect()
    }

    /// The full resolved version.
    pub fn resolution(&self) -> AttrMap {
        self.attributes()
            .into_iter()
            .filter_map(|id| self.resolved(&id).map(|value| (id, value)))
            .collect()
    }
}
