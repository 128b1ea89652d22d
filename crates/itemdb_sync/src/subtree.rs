//! Master and slave items.
//!
//! A slave (a comment, an attachment, a worklog entry) points at its master
//! through an item-valued attribute flagged as a *master reference*. A slave
//! has no life of its own: deleting a master deletes every item below it,
//! and a server-side delete of a master removes its whole subtree at once.

use crate::schema::MASTER_REFERENCE;
use itemdb_core::{Attribute, AttributeKey, DbResult, ItemId, Predicate, Reader, Scalar, ScalarType, Value, ValueKind, Writer};
use std::collections::BTreeSet;

/// Flags `attribute` as a reference from slaves to their master.
///
/// # Errors
///
/// Returns a store error if the attribute clashes with an existing
/// definition.
pub fn define_master_reference(writer: &mut Writer, attribute: &Attribute<ItemId>) -> DbResult<()> {
    writer.define_attribute(attribute.key())?;
    let Some(definition) = writer.find_materialized_id(attribute.id()) else {
        return Ok(());
    };
    writer.set_value(definition, &*MASTER_REFERENCE, Some(true))
}

/// Every attribute flagged with [`define_master_reference`], by id.
pub fn master_attributes<R: Reader>(reader: &R) -> Vec<AttributeKey> {
    let mut keys: Vec<AttributeKey> = reader
        .query(Predicate::equals(&*MASTER_REFERENCE, true))
        .items()
        .into_iter()
        .filter_map(|definition| reader.object_id(definition))
        .filter_map(|id| reader.attribute_key(&id))
        .filter(|key| key.kind() == ValueKind::Scalar(ScalarType::Item))
        .collect();
    keys.sort_by(|a, b| a.id().cmp(b.id()));
    keys
}

/// Direct slaves of `master` through any master reference, ascending.
pub fn slaves<R: Reader>(reader: &R, master: ItemId) -> Vec<ItemId> {
    slaves_through(reader, master, &master_attributes(reader))
}

fn slaves_through<R: Reader>(reader: &R, master: ItemId, attributes: &[AttributeKey]) -> Vec<ItemId> {
    if attributes.is_empty() {
        return Vec::new();
    }
    let refers = attributes
        .iter()
        .map(|key| Predicate::Equals {
            attribute: key.clone(),
            value: Value::Scalar(Scalar::Item(master)),
        })
        .fold(Predicate::False, Predicate::or);
    reader.query(refers).copy_items_sorted()
}

/// `item` and every item below it, ascending.
pub fn slaves_subtree<R: Reader>(reader: &R, item: ItemId) -> Vec<ItemId> {
    let attributes = master_attributes(reader);
    let mut subtree = BTreeSet::from([item]);
    let mut frontier = vec![item];
    while let Some(master) = frontier.pop() {
        for slave in slaves_through(reader, master, &attributes) {
            if subtree.insert(slave) {
                frontier.push(slave);
            }
        }
    }
    subtree.into_iter().collect()
}

/// The items `item` is a slave of, nearest first.
pub fn masters_of<R: Reader>(reader: &R, item: ItemId) -> Vec<ItemId> {
    let attributes = master_attributes(reader);
    let mut seen = BTreeSet::from([item]);
    let mut chain = Vec::new();
    let mut current = vec![item];
    while !current.is_empty() {
        let mut next = Vec::new();
        for slave in current {
            let Some(row) = reader.values(slave) else { continue };
            for key in &attributes {
                if let Some(Value::Scalar(Scalar::Item(master))) = row.get(key.id()) {
                    if seen.insert(*master) {
                        chain.push(*master);
                        next.push(*master);
                    }
                }
            }
        }
        current = next;
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use itemdb_core::{DbError, ItemStore};

    fn parent() -> Attribute<ItemId> {
        Attribute::new("tracker:parent")
    }

    fn related() -> Attribute<ItemId> {
        Attribute::new("tracker:related")
    }

    #[test]
    fn subtrees_follow_master_references_only() {
        let store = ItemStore::open_in_memory().unwrap();
        let items = store
            .write(|w| -> DbResult<[ItemId; 5]> {
                define_master_reference(w, &parent())?;
                let issue = w.next_item()?;
                let comment = w.next_item()?;
                let reply = w.next_item()?;
                let other = w.next_item()?;
                let linked = w.next_item()?;
                w.set_value(comment, &parent(), Some(issue))?;
                w.set_value(reply, &parent(), Some(comment))?;
                w.set_value(linked, &related(), Some(issue))?;
                Ok([issue, comment, reply, other, linked])
            })
            .wait()
            .unwrap();
        let [issue, comment, reply, other, linked] = items;

        let snapshot = store.snapshot();
        assert_eq!(master_attributes(&snapshot), vec![parent().key().clone()]);
        assert_eq!(slaves(&snapshot, issue), vec![comment]);
        assert_eq!(slaves_subtree(&snapshot, issue), vec![issue, comment, reply]);
        assert_eq!(slaves_subtree(&snapshot, other), vec![other]);
        assert_eq!(masters_of(&snapshot, reply), vec![comment, issue]);
        assert!(masters_of(&snapshot, linked).is_empty());
    }

    #[test]
    fn only_item_references_can_be_masters() {
        let store = ItemStore::open_in_memory().unwrap();
        let clash = store
            .write(|w| {
                let text: Attribute<String> = Attribute::new("tracker:parent");
                let item = w.next_item()?;
                w.set_value(item, &text, Some("x".to_string()))?;
                define_master_reference(w, &parent())
            })
            .wait();
        assert!(matches!(clash, Err(DbError::Schema { .. })));
    }
}
