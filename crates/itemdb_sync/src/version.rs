//! Item versions: the shadowable values of an item on one branch.

use crate::schema::{self, BASE, CONFLICT, DOWNLOAD, INVISIBLE};
use itemdb_core::{AttrMap, AttrValue, Attribute, ItemId, Reader, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// The shadowable values of an item as seen on one branch.
///
/// The trunk version is the local state everyone sees. Shadow versions
/// (base, conflict, download) are stored as records on the trunk item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemVersion {
    item: ItemId,
    values: AttrMap,
}

impl ItemVersion {
    /// Wraps a value map. Empty collections are dropped, as the store does.
    pub fn from_values(item: ItemId, values: AttrMap) -> Self {
        let values = values
            .into_iter()
            .filter_map(|(id, value)| value.normalized().map(|value| (id, value)))
            .collect();
        Self { item, values }
    }

    /// The trunk version, or `None` if the item does not exist.
    pub fn trunk<R: Reader + ?Sized>(reader: &R, item: ItemId) -> Option<Self> {
        let row = reader.values(item)?;
        Some(Self::from_values(item, schema::shadowable_values(reader, &row)))
    }

    /// The version stored in a shadow attribute.
    pub fn shadow<R: Reader + ?Sized>(reader: &R, item: ItemId, shadow: &Attribute<AttrMap>) -> Option<Self> {
        reader
            .get(item, shadow)
            .map(|values| Self::from_values(item, values))
    }

    /// The newest known server version: download, then conflict, then base.
    /// An item without shadows is synchronized, so its trunk is the server
    /// version.
    pub fn server<R: Reader + ?Sized>(reader: &R, item: ItemId) -> Option<Self> {
        [&*DOWNLOAD, &*CONFLICT, &*BASE]
            .into_iter()
            .find_map(|shadow| Self::shadow(reader, item, shadow))
            .or_else(|| Self::trunk(reader, item))
    }

    /// The item.
    pub const fn item(&self) -> ItemId {
        self.item
    }

    /// All values.
    pub fn values(&self) -> &AttrMap {
        &self.values
    }

    /// Consumes the version.
    pub fn into_values(self) -> AttrMap {
        self.values
    }

    /// One raw value by attribute id.
    pub fn value(&self, id: &str) -> Option<&Value> {
        self.values.get(id)
    }

    /// One typed value.
    pub fn get<T: AttrValue>(&self, attribute: &Attribute<T>) -> Option<T> {
        self.values.get(attribute.id()).and_then(T::from_value)
    }

    /// Returns true if the item is deleted on this branch.
    pub fn is_invisible(&self) -> bool {
        self.get(&*INVISIBLE).unwrap_or(false)
    }

    /// Attribute ids whose values differ between the two versions.
    pub fn changed_attributes(&self, other: &ItemVersion) -> BTreeSet<Arc<str>> {
        self.values
            .keys()
            .chain(other.values.keys())
            .filter(|id| self.values.get(*id) != other.values.get(*id))
            .cloned()
            .collect()
    }
}
