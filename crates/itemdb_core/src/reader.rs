//! Read access to items.

use crate::error::DbResult;
use crate::query::{Predicate, Query};
use crate::schema::{sys, AttrValue, Attribute, AttributeKey, DbObject};
use crate::table::{ItemTable, Row, SnapshotPin};
use crate::types::{Icn, ItemId};
use crate::value::{AttrMap, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A consistent view of the store.
///
/// Implemented by [`Snapshot`] (a committed state) and by
/// [`crate::Writer`] (a committed state plus the writer's pending changes).
pub trait Reader {
    /// The committed ICN this view is based on.
    fn icn(&self) -> Icn;

    /// All attribute values of an item, or `None` if it is absent or cleared.
    fn values(&self, item: ItemId) -> Option<Row>;

    /// Visits every live item.
    fn for_each_item(&self, f: &mut dyn FnMut(ItemId, &AttrMap));

    /// Resolves an object identity without creating it.
    fn find_materialized_id(&self, id: &str) -> Option<ItemId>;

    /// Looks up a materialized attribute definition.
    fn attribute_key(&self, id: &str) -> Option<AttributeKey>;

    /// Returns true if the item exists in this view.
    fn is_alive(&self, item: ItemId) -> bool {
        self.values(item).is_some()
    }

    /// Reads one raw value.
    fn value(&self, item: ItemId, key: &AttributeKey) -> Option<Value> {
        self.values(item)?.get(key.id().as_ref()).cloned()
    }

    /// Reads one typed value.
    fn get<T: AttrValue>(&self, item: ItemId, attribute: &Attribute<T>) -> Option<T> {
        self.values(item)?
            .get(attribute.id())
            .and_then(T::from_value)
    }

    /// Resolves a named object without creating it.
    fn find_materialized(&self, object: &DbObject) -> Option<ItemId> {
        self.find_materialized_id(object.id())
    }

    /// The type item of an item.
    fn item_type(&self, item: ItemId) -> Option<ItemId> {
        self.get(item, &*sys::TYPE)
    }

    /// The identity string of a materialized object.
    fn object_id(&self, item: ItemId) -> Option<String> {
        self.get(item, &*sys::ID)
    }

    /// Starts a query over this view.
    fn query(&self, predicate: Predicate) -> Query<'_, Self>
    where
        Self: Sized,
    {
        Query::new(self, predicate)
    }
}

/// A read-only view frozen at one ICN.
///
/// Holding a snapshot keeps its row versions from being compacted.
/// Materialized objects are resolved once per snapshot and cached.
pub struct Snapshot {
    pin: SnapshotPin,
    materialized: Mutex<HashMap<Arc<str>, Option<ItemId>>>,
}

impl Snapshot {
    pub(crate) fn new(pin: SnapshotPin) -> Self {
        Self {
            pin,
            materialized: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> &ItemTable {
        self.pin.table()
    }

    /// Opens a second snapshot at the same ICN.
    ///
    /// # Errors
    ///
    /// Never fails in practice: this snapshot keeps its ICN pinned.
    pub fn reopen(&self) -> DbResult<Snapshot> {
        self.pin.table().pin_at(self.icn()).map(Snapshot::new)
    }

    /// Every live item, ascending.
    #[must_use]
    pub fn all_items(&self) -> Vec<ItemId> {
        let mut items = Vec::new();
        self.for_each_item(&mut |item, _| items.push(item));
        items
    }

    /// All materialized attribute definitions, sorted by id.
    #[must_use]
    pub fn attributes(&self) -> Vec<AttributeKey> {
        self.table().attributes()
    }
}

impl Reader for Snapshot {
    fn icn(&self) -> Icn {
        self.pin.icn()
    }

    fn values(&self, item: ItemId) -> Option<Row> {
        self.table().row_at(item, self.icn())
    }

    fn for_each_item(&self, f: &mut dyn FnMut(ItemId, &AttrMap)) {
        self.table().for_each_at(self.icn(), &mut |item, row| f(item, row));
    }

    fn find_materialized_id(&self, id: &str) -> Option<ItemId> {
        if let Some(cached) = self.materialized.lock().get(id) {
            return *cached;
        }
        let found = self.table().identity_at(id, self.icn());
        self.materialized.lock().insert(Arc::from(id), found);
        found
    }

    fn attribute_key(&self, id: &str) -> Option<AttributeKey> {
        self.table().attribute(id)
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot").field("icn", &self.icn()).finish()
    }
}
