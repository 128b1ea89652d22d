//! The write side of a transaction.

use crate::error::{DbError, DbResult};
use crate::handle::CancellationToken;
use crate::reader::Reader;
use crate::schema::{sys, AttrValue, Attribute, AttributeKey, DbObject};
use crate::table::{ItemTable, Row, RowChange};
use crate::types::{Icn, ItemId};
use crate::value::{AttrMap, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

type FinishCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Pending changes of one write transaction.
///
/// A writer sees the committed state it started from plus its own changes.
/// Nothing it does becomes visible to anyone else until the procedure and
/// all triggers have returned successfully.
pub struct Writer {
    table: Arc<ItemTable>,
    base: Icn,
    pending: BTreeMap<ItemId, Option<Row>>,
    // Item -> row before its first change in the current trigger round.
    dirty: BTreeMap<ItemId, Option<Row>>,
    next_item: u64,
    identities: HashMap<Arc<str>, ItemId>,
    catalog: HashMap<Arc<str>, AttributeKey>,
    cancel: CancellationToken,
    finish: Vec<FinishCallback>,
    skip_if_unchanged: bool,
}

/// What a successful procedure leaves for the store to commit.
pub(crate) struct PendingCommit {
    pub(crate) changes: Vec<RowChange>,
    pub(crate) next_item: u64,
    pub(crate) finish: Vec<FinishCallback>,
    /// Nothing changed and the procedure asked not to commit in that case.
    pub(crate) skip: bool,
}

impl Writer {
    pub(crate) fn new(table: Arc<ItemTable>, cancel: CancellationToken) -> Self {
        let base = table.committed();
        let next_item = table.next_item();
        Self {
            table,
            base,
            pending: BTreeMap::new(),
            dirty: BTreeMap::new(),
            next_item,
            identities: HashMap::new(),
            catalog: HashMap::new(),
            cancel,
            finish: Vec::new(),
            skip_if_unchanged: false,
        }
    }

    /// Allocates and creates a new, empty item.
    ///
    /// # Errors
    ///
    /// Fails only if the id space is exhausted.
    pub fn next_item(&mut self) -> DbResult<ItemId> {
        let item = ItemId::new(self.next_item)
            .ok_or_else(|| DbError::invalid_operation("item id space exhausted"))?;
        self.next_item += 1;
        self.put_row(item, Some(Arc::new(AttrMap::new())), None);
        Ok(item)
    }

    /// Sets or clears (`None`) a typed value.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ItemNotFound`] for a missing item and
    /// [`DbError::Schema`] when the attribute's materialized definition
    /// disagrees with the handle.
    pub fn set_value<T: AttrValue>(
        &mut self,
        item: ItemId,
        attribute: &Attribute<T>,
        value: Option<T>,
    ) -> DbResult<()> {
        self.set_raw(item, attribute.key(), value.map(AttrValue::into_value))
    }

    /// Clears one value.
    ///
    /// # Errors
    ///
    /// See [`Writer::set_value`].
    pub fn clear_value<T: AttrValue>(&mut self, item: ItemId, attribute: &Attribute<T>) -> DbResult<()> {
        self.set_raw(item, attribute.key(), None)
    }

    /// Sets or clears an untyped value. Empty lists and sets clear the value;
    /// writing the current value again changes nothing.
    ///
    /// # Errors
    ///
    /// See [`Writer::set_value`].
    pub fn set_raw(&mut self, item: ItemId, key: &AttributeKey, value: Option<Value>) -> DbResult<()> {
        let row = self.values(item).ok_or(DbError::ItemNotFound { item })?;
        let value = value.and_then(Value::normalized);
        if let Some(value) = &value {
            key.check(value)?;
        }
        if row.get(key.id().as_ref()) == value.as_ref() {
            return Ok(());
        }
        self.ensure_attribute(key)?;

        let mut updated = (*row).clone();
        match value {
            Some(value) => updated.insert(Arc::clone(key.id()), value),
            None => updated.remove(key.id().as_ref()),
        };
        self.put_row(item, Some(Arc::new(updated)), Some(row));
        Ok(())
    }

    /// Replaces every value of an item at once.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ItemNotFound`] for a missing item, or a schema
    /// error if a value does not fit its materialized attribute.
    pub fn replace_values(&mut self, item: ItemId, values: AttrMap) -> DbResult<()> {
        let row = self.values(item).ok_or(DbError::ItemNotFound { item })?;
        let mut normalized = AttrMap::new();
        for (id, value) in values {
            let Some(value) = value.normalized() else { continue };
            if let Some(key) = self.attribute_key(&id) {
                key.check(&value)?;
            }
            normalized.insert(id, value);
        }
        if *row == normalized {
            return Ok(());
        }
        self.put_row(item, Some(Arc::new(normalized)), Some(row));
        Ok(())
    }

    /// Tombstones an item. Older snapshots still see it.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ItemNotFound`] for a missing item and
    /// [`DbError::InvalidOperation`] for a materialized object.
    pub fn clear_item(&mut self, item: ItemId) -> DbResult<()> {
        let row = self.values(item).ok_or(DbError::ItemNotFound { item })?;
        if row.contains_key(sys::ID.id()) {
            return Err(DbError::invalid_operation(format!(
                "{item} is a materialized object and cannot be cleared"
            )));
        }
        self.put_row(item, None, Some(row));
        Ok(())
    }

    /// Resolves a named object, creating it (and its type) on first use.
    ///
    /// # Errors
    ///
    /// Returns a schema error if one of the object's attributes conflicts with
    /// an existing definition.
    pub fn materialize(&mut self, object: &DbObject) -> DbResult<ItemId> {
        if let Some(item) = self.find_materialized(object) {
            return Ok(item);
        }
        let type_item = match self.find_materialized_id(object.type_id()) {
            Some(item) => item,
            None => self.materialize(&DbObject::item_type(object.type_id()))?,
        };
        let item = self.next_item()?;
        self.identities.insert(Arc::from(object.id()), item);
        self.set_value(item, &*sys::ID, Some(object.id().to_string()))?;
        self.set_value(item, &*sys::TYPE, Some(type_item))?;
        if let Some(name) = object.name() {
            self.set_value(item, &*sys::NAME, Some(name.to_string()))?;
        }
        for (key, value) in object.values() {
            self.set_raw(item, key, Some(value.clone()))?;
        }
        Ok(item)
    }

    /// Materializes an attribute definition without setting a value.
    ///
    /// # Errors
    ///
    /// Returns a schema error if the attribute exists with another
    /// definition.
    pub fn define_attribute(&mut self, key: &AttributeKey) -> DbResult<()> {
        self.ensure_attribute(key)
    }

    /// Fails with [`DbError::Cancelled`] once the transaction's handle was
    /// cancelled. Long procedures call this between steps.
    ///
    /// # Errors
    ///
    /// Returns the cancellation signal.
    pub fn check_cancelled(&self) -> DbResult<()> {
        self.cancel.check()
    }

    /// Registers a callback that runs once the transaction is durable
    /// (`true`) or definitely failed (`false`), before the handle completes.
    pub fn on_finish(&mut self, callback: impl FnOnce(bool) + Send + 'static) {
        self.finish.push(Box::new(callback));
    }

    /// Asks the store not to commit (and not to use an ICN) if the
    /// transaction ends up changing nothing. The handle then reports
    /// [`crate::TxStatus::Completed`].
    pub fn skip_if_unchanged(&mut self) {
        self.skip_if_unchanged = true;
    }

    /// The values of an item as of the transaction start.
    #[must_use]
    pub fn base_values(&self, item: ItemId) -> Option<Row> {
        self.table.row_at(item, self.base)
    }

    /// Items changed so far, ascending.
    #[must_use]
    pub fn changed_items(&self) -> Vec<ItemId> {
        self.pending
            .iter()
            .filter(|(item, row)| **row != self.base_values(**item))
            .map(|(item, _)| *item)
            .collect()
    }

    fn put_row(&mut self, item: ItemId, row: Option<Row>, previous: Option<Row>) {
        self.dirty.entry(item).or_insert(previous);
        self.pending.insert(item, row);
    }

    fn ensure_attribute(&mut self, key: &AttributeKey) -> DbResult<()> {
        match self.attribute_key(key.id()) {
            Some(existing) if existing == *key => Ok(()),
            Some(existing) => Err(DbError::schema(
                key.id().as_ref(),
                format!(
                    "defined as {:?} (shadowable: {}), used as {:?} (shadowable: {})",
                    existing.kind(),
                    existing.is_shadowable(),
                    key.kind(),
                    key.is_shadowable()
                ),
            )),
            None => {
                self.materialize(&key.definition())?;
                self.catalog.insert(Arc::clone(key.id()), key.clone());
                Ok(())
            }
        }
    }

    /// Items changed since the last call, with their rows before the change.
    pub(crate) fn take_dirty(&mut self) -> BTreeMap<ItemId, Option<Row>> {
        std::mem::take(&mut self.dirty)
    }

    pub(crate) fn take_finish(&mut self) -> Vec<FinishCallback> {
        std::mem::take(&mut self.finish)
    }

    pub(crate) fn into_commit(self) -> PendingCommit {
        let changes: Vec<RowChange> = self
            .pending
            .iter()
            .filter(|(item, row)| **row != self.table.row_at(**item, self.base))
            .map(|(item, row)| RowChange {
                item: *item,
                row: row.clone(),
            })
            .collect();
        // Allocated ids are spent even if their items were cleared again.
        let allocated = self.next_item != self.table.next_item();
        PendingCommit {
            skip: self.skip_if_unchanged && changes.is_empty() && !allocated,
            changes,
            next_item: self.next_item,
            finish: self.finish,
        }
    }
}

impl Reader for Writer {
    fn icn(&self) -> Icn {
        self.base
    }

    fn values(&self, item: ItemId) -> Option<Row> {
        match self.pending.get(&item) {
            Some(row) => row.clone(),
            None => self.table.row_at(item, self.base),
        }
    }

    fn for_each_item(&self, f: &mut dyn FnMut(ItemId, &AttrMap)) {
        self.table.for_each_at(self.base, &mut |item, row| {
            if !self.pending.contains_key(&item) {
                f(item, row);
            }
        });
        for (item, row) in &self.pending {
            if let Some(row) = row {
                f(*item, row);
            }
        }
    }

    fn find_materialized_id(&self, id: &str) -> Option<ItemId> {
        self.identities
            .get(id)
            .copied()
            .or_else(|| self.table.identity_at(id, self.base))
    }

    fn attribute_key(&self, id: &str) -> Option<AttributeKey> {
        self.catalog
            .get(id)
            .cloned()
            .or_else(|| self.table.attribute(id))
    }
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("base", &self.base)
            .field("pending", &self.pending.len())
            .finish()
    }
}
