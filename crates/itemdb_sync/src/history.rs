//! Edit history: local steps that are not plain attribute changes.
//!
//! Some edits only make sense replayed on the server in order, such as a
//! workflow transition or a posted comment. A connection records them as
//! [`HistoryRecord`]s next to the attribute edit. The records travel with
//! the item's upload and are dropped once the server confirms them.

use crate::schema::CHANGE_HISTORY;
use itemdb_core::{AttrMap, AttrValue, DbResult, ItemId, Reader, Value, Writer};
use std::sync::Arc;

const KIND: &str = "kind";
const STEP: &str = "step";

/// One recorded edit step.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HistoryRecord {
    kind: String,
    step: String,
}

impl HistoryRecord {
    /// A step of `kind` with a connection-defined payload.
    pub fn new(kind: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            step: step.into(),
        }
    }

    /// What sort of step this is, for example `"workflow"`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The payload the connection replays.
    pub fn step(&self) -> &str {
        &self.step
    }

    fn to_value(&self) -> Value {
        let mut record = AttrMap::new();
        record.insert(Arc::from(KIND), self.kind.clone().into_value());
        record.insert(Arc::from(STEP), self.step.clone().into_value());
        Value::Record(record)
    }

    fn from_value(value: &Value) -> Option<Self> {
        let record = value.as_record()?;
        let text = |id: &str| record.get(id).and_then(String::from_value);
        Some(Self {
            kind: text(KIND)?,
            step: text(STEP)?,
        })
    }
}

// Zero-padded positions keep the record map in insertion order.
fn position(index: usize) -> Arc<str> {
    Arc::from(format!("{index:08}"))
}

/// The item's pending history, oldest first.
pub fn read_history<R: Reader + ?Sized>(reader: &R, item: ItemId) -> Vec<HistoryRecord> {
    reader
        .get(item, &*CHANGE_HISTORY)
        .map(|records| records.values().filter_map(HistoryRecord::from_value).collect())
        .unwrap_or_default()
}

/// Replaces the item's history. An empty history clears the attribute.
pub(crate) fn write_history(writer: &mut Writer, item: ItemId, records: &[HistoryRecord]) -> DbResult<()> {
    if records.is_empty() {
        return writer.clear_value(item, &*CHANGE_HISTORY);
    }
    let encoded: AttrMap = records
        .iter()
        .enumerate()
        .map(|(index, record)| (position(index), record.to_value()))
        .collect();
    writer.set_value(item, &*CHANGE_HISTORY, Some(encoded))
}

/// Drops the `done` oldest records.
pub(crate) fn drop_uploaded(writer: &mut Writer, item: ItemId, done: usize) -> DbResult<()> {
    if done == 0 {
        return Ok(());
    }
    let history = read_history(&*writer, item);
    let rest = history.get(done..).unwrap_or_default();
    write_history(writer, item, rest)
}
