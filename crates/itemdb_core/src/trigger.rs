//! Triggers: predicate-scoped callbacks run inside the writing transaction.
//!
//! After a write procedure returns, the changes it made are drained in
//! rounds. Each round hands every trigger the items whose membership in its
//! predicate changed (items that match after the change, and items that
//! stopped matching). Writes made by triggers form the next round. Work that
//! has not settled after the configured number of rounds aborts the
//! transaction with [`DbError::TriggerCascade`].

use crate::error::{DbError, DbResult};
use crate::query::Predicate;
use crate::types::ItemId;
use crate::writer::Writer;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{trace, warn};

/// Callback of a trigger. Receives the affected items in ascending order.
pub type TriggerFn = dyn Fn(&[ItemId], &mut Writer) -> DbResult<()> + Send + Sync;

struct Trigger {
    name: String,
    predicate: Predicate,
    callback: Arc<TriggerFn>,
}

#[derive(Default)]
pub(crate) struct TriggerRegistry {
    triggers: RwLock<Vec<Arc<Trigger>>>,
}

impl TriggerRegistry {
    pub(crate) fn register(
        &self,
        name: &str,
        predicate: Predicate,
        callback: Arc<TriggerFn>,
    ) -> DbResult<()> {
        let mut triggers = self.triggers.write();
        if triggers.iter().any(|t| t.name == name) {
            return Err(DbError::DuplicateTrigger { name: name.to_string() });
        }
        triggers.push(Arc::new(Trigger {
            name: name.to_string(),
            predicate,
            callback,
        }));
        Ok(())
    }

    pub(crate) fn unregister(&self, name: &str) -> bool {
        let mut triggers = self.triggers.write();
        let before = triggers.len();
        triggers.retain(|t| t.name != name);
        triggers.len() != before
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.triggers.read().iter().map(|t| t.name.clone()).collect()
    }

    /// Drains the writer's changes through all triggers.
    pub(crate) fn run(&self, writer: &mut Writer, max_rounds: usize) -> DbResult<()> {
        let triggers = self.triggers.read().clone();
        if triggers.is_empty() {
            return Ok(());
        }
        let mut round = 0;
        loop {
            let dirty = writer.take_dirty();
            if dirty.is_empty() {
                return Ok(());
            }
            if round == max_rounds {
                warn!(rounds = round, pending = dirty.len(), "trigger cascade did not settle");
                return Err(DbError::TriggerCascade { rounds: round });
            }
            round += 1;
            for trigger in &triggers {
                writer.check_cancelled()?;
                let resolved = trigger.predicate.resolve(&*writer);
                let affected: Vec<ItemId> = dirty
                    .iter()
                    .filter(|(item, before)| {
                        let was = matches!(before, Some(row) if resolved.matches(**item, row));
                        was || resolved.matches_in(&*writer, **item)
                    })
                    .map(|(item, _)| *item)
                    .collect();
                if affected.is_empty() {
                    continue;
                }
                trace!(trigger = %trigger.name, round, items = affected.len(), "running trigger");
                (trigger.callback)(&affected, writer)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::CancellationToken;
    use crate::reader::Reader;
    use crate::schema::Attribute;
    use crate::table::ItemTable;
    use parking_lot::Mutex;

    fn writer() -> Writer {
        Writer::new(Arc::new(ItemTable::genesis()), CancellationToken::new())
    }

    fn status() -> Attribute<String> {
        Attribute::new("tracker:status")
    }

    fn closed() -> Attribute<bool> {
        Attribute::local("tracker:closed")
    }

    #[test]
    fn derived_values_are_maintained_in_the_same_writer() {
        let registry = TriggerRegistry::default();
        registry
            .register(
                "closed-flag",
                Predicate::equals(&status(), "done".to_string()),
                Arc::new(|items: &[ItemId], w: &mut Writer| -> DbResult<()> {
                    for item in items {
                        let done = w.get(*item, &status()).as_deref() == Some("done");
                        w.set_value(*item, &closed(), Some(done))?;
                    }
                    Ok(())
                }),
            )
            .unwrap();

        let mut w = writer();
        let item = w.next_item().unwrap();
        w.set_value(item, &status(), Some("done".into())).unwrap();
        registry.run(&mut w, 4).unwrap();
        assert_eq!(w.get(item, &closed()), Some(true));

        // Dropping out of the predicate is reported too.
        w.set_value(item, &status(), Some("open".into())).unwrap();
        registry.run(&mut w, 4).unwrap();
        assert_eq!(w.get(item, &closed()), Some(false));
    }

    #[test]
    fn unrelated_changes_do_not_fire() {
        let registry = TriggerRegistry::default();
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        registry
            .register(
                "count",
                Predicate::equals(&status(), "done".to_string()),
                Arc::new(move |_: &[ItemId], _: &mut Writer| -> DbResult<()> {
                    *counter.lock() += 1;
                    Ok(())
                }),
            )
            .unwrap();
        let mut w = writer();
        let item = w.next_item().unwrap();
        w.set_value(item, &status(), Some("open".into())).unwrap();
        registry.run(&mut w, 4).unwrap();
        assert_eq!(*calls.lock(), 0);
    }

    #[test]
    fn endless_cascade_is_cut_off() {
        let counter: Attribute<i64> = Attribute::local("tracker:counter");
        let registry = TriggerRegistry::default();
        let bump = counter.clone();
        registry
            .register(
                "bump",
                Predicate::has_value(&counter),
                Arc::new(move |items: &[ItemId], w: &mut Writer| -> DbResult<()> {
                    for item in items {
                        let next = w.get(*item, &bump).unwrap_or(0) + 1;
                        w.set_value(*item, &bump, Some(next))?;
                    }
                    Ok(())
                }),
            )
            .unwrap();

        let mut w = writer();
        let item = w.next_item().unwrap();
        w.set_value(item, &counter, Some(0)).unwrap();
        assert!(matches!(
            registry.run(&mut w, 5),
            Err(DbError::TriggerCascade { rounds: 5 })
        ));
    }

    #[test]
    fn names_are_unique() {
        let registry = TriggerRegistry::default();
        let noop = || -> Arc<TriggerFn> {
            Arc::new(|_: &[ItemId], _: &mut Writer| -> DbResult<()> { Ok(()) })
        };
        registry.register("a", Predicate::True, noop()).unwrap();
        assert!(matches!(
            registry.register("a", Predicate::True, noop()),
            Err(DbError::DuplicateTrigger { .. })
        ));
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(registry.names().is_empty());
    }
}
