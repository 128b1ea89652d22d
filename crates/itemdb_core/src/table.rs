//! Versioned item rows.
//!
//! Every item owns a chain of row versions ordered by ICN. A row version is
//! the full attribute map of the item as of that commit, or a tombstone.
//! Readers look up the newest version at or below their ICN; the single
//! writer appends versions at the next ICN before publishing it.

use crate::error::{DbError, DbResult};
use crate::schema::{self, sys, AttributeKey};
use crate::types::{Icn, ItemId};
use crate::value::{AttrMap, Scalar, Value};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared attribute map of one item version.
pub type Row = Arc<AttrMap>;

/// New state of one item in a commit. `None` clears the item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    /// The changed item.
    pub item: ItemId,
    /// The item's attribute values after the commit.
    pub row: Option<Row>,
}

#[derive(Debug)]
struct RowVersion {
    icn: Icn,
    row: Option<Row>,
}

#[derive(Debug, Default)]
struct Retention {
    pins: BTreeMap<Icn, usize>,
    horizon: Icn,
}

pub(crate) struct ItemTable {
    rows: RwLock<BTreeMap<ItemId, Vec<RowVersion>>>,
    identities: RwLock<HashMap<Arc<str>, (ItemId, Icn)>>,
    catalog: RwLock<HashMap<Arc<str>, AttributeKey>>,
    committed: AtomicU64,
    next_item: AtomicU64,
    retention: Mutex<Retention>,
}

impl ItemTable {
    /// A table holding the system schema at ICN 0.
    pub(crate) fn genesis() -> Self {
        let table = Self {
            rows: RwLock::new(BTreeMap::new()),
            identities: RwLock::new(HashMap::new()),
            catalog: RwLock::new(HashMap::new()),
            committed: AtomicU64::new(0),
            next_item: AtomicU64::new(1),
            retention: Mutex::new(Retention::default()),
        };
        let changes: Vec<RowChange> = schema::genesis_rows()
            .into_iter()
            .map(|(item, row)| RowChange {
                item,
                row: Some(Arc::new(row)),
            })
            .collect();
        let next = changes.iter().map(|c| c.item.get()).max().unwrap_or(0) + 1;
        table.install(Icn::ZERO, &changes);
        table.next_item.store(next, Ordering::Release);
        table
    }

    fn install(&self, icn: Icn, changes: &[RowChange]) {
        let mut rows = self.rows.write();
        for change in changes {
            rows.entry(change.item).or_default().push(RowVersion {
                icn,
                row: change.row.clone(),
            });
            let Some(row) = &change.row else { continue };
            if let Some(Value::Scalar(Scalar::Text(id))) = row.get(sys::ID.id()) {
                self.identities
                    .write()
                    .entry(Arc::from(id.as_str()))
                    .or_insert((change.item, icn));
            }
            let is_attribute = matches!(
                row.get(sys::TYPE.id()),
                Some(Value::Scalar(Scalar::Item(t))) if *t == schema::ATTRIBUTE_TYPE_ITEM
            );
            if is_attribute {
                if let Some(key) = AttributeKey::from_definition(row) {
                    self.catalog.write().insert(Arc::clone(key.id()), key);
                }
            }
        }
    }

    /// Installs a commit and publishes its ICN.
    pub(crate) fn apply(&self, icn: Icn, next_item: u64, changes: &[RowChange]) {
        self.install(icn, changes);
        self.next_item.fetch_max(next_item, Ordering::AcqRel);
        self.committed.store(icn.as_u64(), Ordering::Release);
    }

    pub(crate) fn committed(&self) -> Icn {
        Icn::new(self.committed.load(Ordering::Acquire))
    }

    pub(crate) fn next_item(&self) -> u64 {
        self.next_item.load(Ordering::Acquire)
    }

    pub(crate) fn row_at(&self, item: ItemId, icn: Icn) -> Option<Row> {
        let rows = self.rows.read();
        let versions = rows.get(&item)?;
        let visible = versions.partition_point(|v| v.icn <= icn);
        versions.get(visible.checked_sub(1)?)?.row.clone()
    }

    /// Visits every item alive at `icn`, in item order.
    pub(crate) fn for_each_at(&self, icn: Icn, f: &mut dyn FnMut(ItemId, &Row)) {
        let rows = self.rows.read();
        for (item, versions) in rows.iter() {
            let visible = versions.partition_point(|v| v.icn <= icn);
            if let Some(Some(row)) = visible.checked_sub(1).map(|i| &versions[i].row) {
                f(*item, row);
            }
        }
    }

    pub(crate) fn identity_at(&self, id: &str, icn: Icn) -> Option<ItemId> {
        match self.identities.read().get(id) {
            Some((item, created)) if *created <= icn => Some(*item),
            _ => None,
        }
    }

    pub(crate) fn attribute(&self, id: &str) -> Option<AttributeKey> {
        self.catalog.read().get(id).cloned()
    }

    pub(crate) fn attributes(&self) -> Vec<AttributeKey> {
        let mut keys: Vec<AttributeKey> = self.catalog.read().values().cloned().collect();
        keys.sort_by(|a, b| a.id().cmp(b.id()));
        keys
    }

    /// Pins the latest committed state.
    pub(crate) fn pin_latest(self: &Arc<Self>) -> SnapshotPin {
        let mut retention = self.retention.lock();
        let icn = self.committed();
        *retention.pins.entry(icn).or_default() += 1;
        SnapshotPin {
            table: Arc::clone(self),
            icn,
        }
    }

    /// Pins an older state, if it has not been compacted away.
    pub(crate) fn pin_at(self: &Arc<Self>, icn: Icn) -> DbResult<SnapshotPin> {
        let mut retention = self.retention.lock();
        if icn < retention.horizon || icn > self.committed() {
            return Err(DbError::SnapshotUnavailable { icn });
        }
        *retention.pins.entry(icn).or_default() += 1;
        Ok(SnapshotPin {
            table: Arc::clone(self),
            icn,
        })
    }

    fn unpin(&self, icn: Icn) {
        let mut retention = self.retention.lock();
        if let Some(count) = retention.pins.get_mut(&icn) {
            *count -= 1;
            if *count == 0 {
                retention.pins.remove(&icn);
            }
        }
    }

    pub(crate) fn horizon(&self) -> Icn {
        self.retention.lock().horizon
    }

    /// Drops row versions no pinned or current state can see.
    ///
    /// Returns the number of versions removed.
    pub(crate) fn compact(&self) -> usize {
        let mut retention = self.retention.lock();
        let committed = self.committed();
        let keep_from = retention
            .pins
            .keys()
            .next()
            .copied()
            .map_or(committed, |oldest| oldest.min(committed));

        let mut removed = 0;
        let mut rows = self.rows.write();
        rows.retain(|_, versions| {
            let visible = versions.partition_point(|v| v.icn <= keep_from);
            if visible > 1 {
                removed += visible - 1;
                versions.drain(..visible - 1);
            }
            let dead = versions.len() == 1 && versions[0].row.is_none() && versions[0].icn <= keep_from;
            if dead {
                removed += 1;
            }
            !dead
        });
        retention.horizon = retention.horizon.max(keep_from);
        removed
    }
}

/// Keeps the row versions visible at one ICN from being compacted.
pub(crate) struct SnapshotPin {
    table: Arc<ItemTable>,
    icn: Icn,
}

impl SnapshotPin {
    pub(crate) fn icn(&self) -> Icn {
        self.icn
    }

    pub(crate) fn table(&self) -> &Arc<ItemTable> {
        &self.table
    }
}

impl Drop for SnapshotPin {
    fn drop(&mut self) {
        self.table.unpin(self.icn);
    }
}
