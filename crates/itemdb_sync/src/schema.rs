//! Attributes the sync layer keeps on items.
//!
//! Shadow attributes hold whole item versions (maps of shadowable attribute
//! values) next to the trunk values:
//!
//! | Attribute | Holds |
//! |---|---|
//! | [`BASE`] | server version from before the first local edit |
//! | [`CONFLICT`] | server version that could not be merged |
//! | [`DOWNLOAD`] | server version received while the item was edited or locked |
//! | [`UPLOADING`] | version sent by an upload that is not yet confirmed |
//!
//! [`UPLOAD_TASK`] names the upload that owns [`UPLOADING`], and
//! [`CONNECTION`] points at the item's connection object.
//!
//! An upload the server accepted without returning its new version leaves
//! the sent version in [`DONE_UPLOAD`] until the next download finishes it.
//! Edits that are not attribute changes queue in [`CHANGE_HISTORY`];
//! [`DONE_UPLOAD_HISTORY`] counts the records an upload took with it.

use itemdb_core::{AttrMap, AttrValue, Attribute, AttributeKey, DbObject, ItemId, Reader, Value, Writer};
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Identity of the connection object type.
pub const CONNECTION_TYPE_ID: &str = "sync:type:connection";

/// The type of connection objects.
pub static CONNECTION_TYPE: LazyLock<DbObject> =
    LazyLock::new(|| DbObject::item_type(CONNECTION_TYPE_ID).with_name("Connection"));

/// Server version from before the first local edit.
pub static BASE: LazyLock<Attribute<AttrMap>> = LazyLock::new(|| Attribute::local("sync:attr:base"));
/// Server version that conflicts with the local edit.
pub static CONFLICT: LazyLock<Attribute<AttrMap>> =
    LazyLock::new(|| Attribute::local("sync:attr:conflict"));
/// Server version waiting to be merged.
pub static DOWNLOAD: LazyLock<Attribute<AttrMap>> =
    LazyLock::new(|| Attribute::local("sync:attr:download"));
/// Id of the upload that sent [`UPLOADING`].
pub static UPLOAD_TASK: LazyLock<Attribute<String>> =
    LazyLock::new(|| Attribute::local("sync:attr:upload-task"));
/// Version sent to the server by an unconfirmed upload.
pub static UPLOADING: LazyLock<Attribute<AttrMap>> =
    LazyLock::new(|| Attribute::local("sync:attr:uploading"));
/// Connection object the item belongs to.
pub static CONNECTION: LazyLock<Attribute<ItemId>> =
    LazyLock::new(|| Attribute::local("sync:attr:connection"));
/// Version accepted by the server whose new server version has not
/// arrived yet.
pub static DONE_UPLOAD: LazyLock<Attribute<AttrMap>> =
    LazyLock::new(|| Attribute::local("sync:attr:done-upload"));
/// Number of [`CHANGE_HISTORY`] records sent by the current or done upload.
pub static DONE_UPLOAD_HISTORY: LazyLock<Attribute<i64>> =
    LazyLock::new(|| Attribute::local("sync:attr:done-upload-history"));
/// Local edit steps waiting for upload, oldest first.
pub static CHANGE_HISTORY: LazyLock<Attribute<AttrMap>> =
    LazyLock::new(|| Attribute::local("sync:attr:change-history"));
/// Set on the definition of an attribute that points from slaves to their
/// master.
pub static MASTER_REFERENCE: LazyLock<Attribute<bool>> =
    LazyLock::new(|| Attribute::local("sync:attr:master-reference"));
/// Marks an item deleted on its branch.
pub static INVISIBLE: LazyLock<Attribute<bool>> = LazyLock::new(|| Attribute::new("sync:attr:invisible"));

/// The object representing a connection in the store.
pub fn connection_object(id: &str) -> DbObject {
    DbObject::new(&format!("sync:connection:{id}"), &CONNECTION_TYPE).with_name(id)
}

/// The version of an item that does not exist on its branch.
pub fn invisible_values() -> AttrMap {
    let mut values = AttrMap::new();
    values.insert(Arc::clone(INVISIBLE.key().id()), true.into_value());
    values
}

/// Keeps the values of shadowable attributes.
pub fn shadowable_values<R: Reader + ?Sized>(reader: &R, row: &AttrMap) -> AttrMap {
    row.iter()
        .filter(|(id, _)| is_shadowable(reader, id))
        .map(|(id, value)| (Arc::clone(id), value.clone()))
        .collect()
}

fn is_shadowable<R: Reader + ?Sized>(reader: &R, id: &str) -> bool {
    id == INVISIBLE.id() || reader.attribute_key(id).is_some_and(|key| key.is_shadowable())
}

/// Returns true if the item carries any sync shadow.
pub fn has_local_state<R: Reader + ?Sized>(reader: &R, item: ItemId) -> bool {
    let Some(row) = reader.values(item) else { return false };
    [BASE.id(), CONFLICT.id(), DOWNLOAD.id(), UPLOAD_TASK.id(), DONE_UPLOAD.id()]
        .iter()
        .any(|id| row.contains_key(*id))
}

/// Identity of the item's connection, if it has one.
pub fn connection_id<R: Reader + ?Sized>(reader: &R, item: ItemId) -> Option<String> {
    let object = reader.get(item, &*CONNECTION)?;
    let id = reader.object_id(object)?;
    Some(id.strip_prefix("sync:connection:").unwrap_or(&id).to_string())
}

/// Identity of the item's type, if it has one.
pub fn type_id<R: Reader + ?Sized>(reader: &R, item: ItemId) -> Option<String> {
    reader.object_id(reader.item_type(item)?)
}

fn key_of(writer: &Writer, id: &str) -> Option<AttributeKey> {
    if id == INVISIBLE.id() {
        return Some(INVISIBLE.key().clone());
    }
    writer.attribute_key(id)
}

/// Writes one shadowable value by attribute id.
///
/// An attribute the store has not seen yet is defined from the value's
/// kind, so server versions can carry attributes no local edit ever wrote.
pub(crate) fn set_by_id(
    writer: &mut Writer,
    item: ItemId,
    id: &str,
    value: Option<Value>,
) -> itemdb_core::DbResult<()> {
    if let Some(key) = key_of(writer, id) {
        return writer.set_raw(item, &key, value);
    }
    let Some(value) = value.and_then(Value::normalized) else {
        return Ok(());
    };
    let Some(kind) = value.kind() else {
        return Ok(());
    };
    let key = AttributeKey::new(id, kind);
    debug!(%item, attribute = id, "defining attribute from server value");
    writer.define_attribute(&key)?;
    writer.set_raw(item, &key, Some(value))
}

/// Replaces the trunk's shadowable values with `values`.
pub(crate) fn write_shadowable(writer: &mut Writer, item: ItemId, values: &AttrMap) -> itemdb_core::DbResult<()> {
    let current = writer
        .values(item)
        .map(|row| shadowable_values(&*writer, &row))
        .unwrap_or_default();
    for id in current.keys() {
        if !values.contains_key(id) {
            set_by_id(writer, item, id, None)?;
        }
    }
    for (id, value) in values {
        set_by_id(writer, item, id, Some(value.clone()))?;
    }
    Ok(())
}

/// Removes every sync shadow and the edit history from an item.
pub(crate) fn clear_shadows(writer: &mut Writer, item: ItemId) -> itemdb_core::DbResult<()> {
    writer.clear_value(item, &*BASE)?;
    writer.clear_value(item, &*CONFLICT)?;
    writer.clear_value(item, &*DOWNLOAD)?;
    writer.clear_value(item, &*UPLOAD_TASK)?;
    writer.clear_value(item, &*UPLOADING)?;
    writer.clear_value(item, &*DONE_UPLOAD)?;
    writer.clear_value(item, &*DONE_UPLOAD_HISTORY)?;
    writer.clear_value(item, &*CHANGE_HISTORY)
}

/// Replaces trunk with `server` and forgets the local edit.
pub(crate) fn discard_to(writer: &mut Writer, item: ItemId, server: &AttrMap) -> itemdb_core::DbResult<()> {
    write_shadowable(writer, item, server)?;
    clear_shadows(writer, item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use itemdb_core::{DbError, ItemStore};

    #[test]
    fn only_shadowable_values_are_kept() {
        let store = ItemStore::open_in_memory().unwrap();
        let summary: Attribute<String> = Attribute::new("tracker:summary");
        let seen: Attribute<bool> = Attribute::local("tracker:seen");
        let item = store
            .write(move |w| {
                let item = w.next_item()?;
                w.set_value(item, &summary, Some("crash".to_string()))?;
                w.set_value(item, &seen, Some(true))?;
                w.set_value(item, &*INVISIBLE, Some(false))?;
                Ok::<_, DbError>(item)
            })
            .wait()
            .unwrap();

        let snapshot = store.snapshot();
        let row = snapshot.values(item).unwrap();
        let shadowable = shadowable_values(&snapshot, &row);
        let ids: Vec<&str> = shadowable.keys().map(|id| id.as_ref()).collect();
        assert_eq!(ids, vec!["sync:attr:invisible", "tracker:summary"]);
        assert!(!has_local_state(&snapshot, item));
    }

    #[test]
    fn unknown_attributes_are_defined_from_the_value() {
        let store = ItemStore::open_in_memory().unwrap();
        let mut values = AttrMap::new();
        values.insert(Arc::from("tracker:severity"), "major".to_string().into_value());
        values.insert(Arc::from("tracker:watchers"), Value::Set(Default::default()));
        let item = store
            .write(move |w| {
                let item = w.next_item()?;
                write_shadowable(w, item, &values)?;
                Ok::<_, DbError>(item)
            })
            .wait()
            .unwrap();

        let snapshot = store.snapshot();
        let severity: Attribute<String> = Attribute::new("tracker:severity");
        assert_eq!(snapshot.get(item, &severity).as_deref(), Some("major"));
        assert!(snapshot.attribute_key("tracker:severity").is_some_and(|key| key.is_shadowable()));
        // Empty values carry no kind and define nothing.
        assert!(snapshot.attribute_key("tracker:watchers").is_none());
    }

    #[test]
    fn connection_objects_are_typed() {
        let object = connection_object("jira");
        assert_eq!(object.type_id(), CONNECTION_TYPE_ID);
        assert_eq!(object.name(), Some("jira"));
        assert_eq!(invisible_values().len(), 1);
    }
}
