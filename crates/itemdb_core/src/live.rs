//! Live queries: standing subscriptions that receive per-commit deltas.
//!
//! A subscription keeps the set of items currently matching its predicate.
//! For every commit, only the items that commit touched are re-evaluated and
//! the difference is delivered as a [`LiveQueryEvent`]. Commits that cannot
//! affect the subscription are reported through
//! [`LiveQueryListener::on_icn_passed`] instead, so a consumer always learns
//! that it has seen everything up to a given ICN.

use crate::gate::Gate;
use crate::lifetime::Lifetime;
use crate::query::{Predicate, ResolvedPredicate};
use crate::reader::{Reader, Snapshot};
use crate::types::{Icn, ItemId};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// A change to a live query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveQueryEvent {
    /// The commit this event describes.
    pub icn: Icn,
    /// True for the first event of a subscription, which carries the whole
    /// result in `added_and_changed`.
    pub initial: bool,
    /// Items that entered the result or changed while in it, ascending.
    pub added_and_changed: Vec<ItemId>,
    /// Items that left the result, ascending.
    pub removed: Vec<ItemId>,
}

impl LiveQueryEvent {
    /// Returns true if the result did not change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added_and_changed.is_empty() && self.removed.is_empty()
    }
}

/// Receiver of live query events.
///
/// Calls for one subscription arrive on its gate in strictly increasing ICN
/// order.
pub trait LiveQueryListener: Send + Sync + 'static {
    /// The result changed at `event.icn`, or a commit touched items of the
    /// predicate's type scope without changing the result (an empty event).
    fn on_change(&self, event: &LiveQueryEvent);

    /// A commit passed without affecting this subscription.
    fn on_icn_passed(&self, icn: Icn) {
        let _ = icn;
    }
}

struct SubscriptionState {
    matching: BTreeSet<ItemId>,
    last_icn: Icn,
}

struct Subscription {
    predicate: Predicate,
    scope: Option<Predicate>,
    listener: Arc<dyn LiveQueryListener>,
    gate: Arc<dyn Gate>,
    alive: Arc<AtomicBool>,
    state: Mutex<SubscriptionState>,
}

impl Subscription {
    fn deliver(&self, event: Delivery) {
        let listener = Arc::clone(&self.listener);
        let alive = Arc::clone(&self.alive);
        self.gate.execute(Box::new(move || {
            if !alive.load(Ordering::Acquire) {
                return;
            }
            match event {
                Delivery::Change(event) => listener.on_change(&event),
                Delivery::Passed(icn) => listener.on_icn_passed(icn),
            }
        }));
    }

    fn process(&self, snapshot: &Snapshot, touched: &[ItemId]) {
        let icn = snapshot.icn();
        let mut state = self.state.lock();
        if icn <= state.last_icn {
            return;
        }
        state.last_icn = icn;

        let resolved = self.predicate.resolve(snapshot);
        let scope: Option<ResolvedPredicate> = self.scope.as_ref().map(|s| s.resolve(snapshot));
        let mut added_and_changed = Vec::new();
        let mut removed = Vec::new();
        let mut in_scope = false;
        for item in touched {
            let row = snapshot.values(*item);
            let now = row.as_ref().is_some_and(|row| resolved.matches(*item, row));
            let before = state.matching.contains(item);
            if now {
                added_and_changed.push(*item);
                state.matching.insert(*item);
            } else if before {
                removed.push(*item);
                state.matching.remove(item);
            }
            if let (Some(scope), Some(row)) = (&scope, &row) {
                in_scope |= scope.matches(*item, row);
            }
        }
        drop(state);

        let event = LiveQueryEvent {
            icn,
            initial: false,
            added_and_changed,
            removed,
        };
        if !event.is_empty() || in_scope {
            trace!(%icn, added = event.added_and_changed.len(), removed = event.removed.len(), "live query delta");
            self.deliver(Delivery::Change(event));
        } else {
            self.deliver(Delivery::Passed(icn));
        }
    }
}

enum Delivery {
    Change(LiveQueryEvent),
    Passed(Icn),
}

/// All live query subscriptions of a store.
#[derive(Default)]
pub(crate) struct LiveQueries {
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
}

impl LiveQueries {
    /// Registers a subscription and delivers its initial result.
    ///
    /// `open_latest` is called under the registry lock, so no commit can be
    /// processed between the initial result and the first delta. The initial
    /// event is delivered after the registry lock is released, so a listener
    /// may use the store from inside it.
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        lifetime: &Lifetime,
        predicate: Predicate,
        gate: Arc<dyn Gate>,
        listener: Arc<dyn LiveQueryListener>,
        open_latest: impl FnOnce() -> Snapshot,
    ) {
        if lifetime.is_ended() {
            return;
        }
        let mut subscriptions = self.subscriptions.lock();
        let snapshot = open_latest();
        let matching = snapshot.query(predicate.clone()).items();
        let initial = LiveQueryEvent {
            icn: snapshot.icn(),
            initial: true,
            added_and_changed: matching.iter().copied().collect(),
            removed: Vec::new(),
        };
        let subscription = Arc::new(Subscription {
            scope: predicate.type_scope(),
            predicate,
            listener,
            gate,
            alive: Arc::new(AtomicBool::new(true)),
            state: Mutex::new(SubscriptionState {
                matching,
                last_icn: snapshot.icn(),
            }),
        });
        // Deltas queue behind the state lock until the initial event is out.
        let held = subscription.state.lock();
        subscriptions.push(Arc::clone(&subscription));
        drop(subscriptions);
        subscription.deliver(Delivery::Change(initial));
        drop(held);

        let registry: Weak<Self> = Arc::downgrade(self);
        let ended = Arc::downgrade(&subscription);
        lifetime.on_end(move || {
            let Some(subscription) = ended.upgrade() else { return };
            subscription.alive.store(false, Ordering::Release);
            if let Some(registry) = registry.upgrade() {
                registry
                    .subscriptions
                    .lock()
                    .retain(|s| !Arc::ptr_eq(s, &subscription));
            }
        });
    }

    /// Feeds one commit to every subscription.
    pub(crate) fn process(&self, snapshot: &Snapshot, touched: &[ItemId]) {
        let subscriptions = self.subscriptions.lock().clone();
        for subscription in subscriptions {
            if subscription.alive.load(Ordering::Acquire) {
                subscription.process(snapshot, touched);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::straight;
    use crate::handle::CancellationToken;
    use crate::schema::Attribute;
    use crate::table::ItemTable;
    use crate::writer::Writer;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<LiveQueryEvent>>,
        passed: Mutex<Vec<Icn>>,
    }

    impl LiveQueryListener for Recorder {
        fn on_change(&self, event: &LiveQueryEvent) {
            self.events.lock().push(event.clone());
        }

        fn on_icn_passed(&self, icn: Icn) {
            self.passed.lock().push(icn);
        }
    }

    fn status() -> Attribute<String> {
        Attribute::new("tracker:status")
    }

    fn commit(table: &Arc<ItemTable>, live: &LiveQueries, edit: impl FnOnce(&mut Writer)) {
        let mut writer = Writer::new(Arc::clone(table), CancellationToken::new());
        edit(&mut writer);
        let touched = writer.changed_items();
        let icn = table.committed().next();
        let commit = writer.into_commit();
        table.apply(icn, commit.next_item, &commit.changes);
        live.process(&Snapshot::new(table.pin_latest()), &touched);
    }

    #[test]
    fn deltas_follow_commits() {
        let table = Arc::new(ItemTable::genesis());
        let live = Arc::new(LiveQueries::default());
        let recorder = Arc::new(Recorder::default());
        let lifetime = Lifetime::new();
        live.subscribe(
            &lifetime,
            Predicate::equals(&status(), "open".to_string()),
            straight(),
            recorder.clone(),
            || Snapshot::new(table.pin_latest()),
        );

        let mut item = None;
        commit(&table, &live, |w| {
            let id = w.next_item().unwrap();
            w.set_value(id, &status(), Some("open".into())).unwrap();
            item = Some(id);
        });
        let item = item.unwrap();
        commit(&table, &live, |w| {
            w.set_value(item, &status(), Some("done".into())).unwrap();
        });

        let events = recorder.events.lock().clone();
        assert_eq!(events.len(), 3);
        assert!(events[0].initial && events[0].is_empty());
        assert_eq!(events[1].added_and_changed, vec![item]);
        assert_eq!(events[2].removed, vec![item]);
        assert!(events.windows(2).all(|w| w[0].icn < w[1].icn));
    }

    #[test]
    fn unrelated_commits_only_pass_the_icn() {
        let table = Arc::new(ItemTable::genesis());
        let live = Arc::new(LiveQueries::default());
        let recorder = Arc::new(Recorder::default());
        let lifetime = Lifetime::new();
        live.subscribe(
            &lifetime,
            Predicate::equals(&status(), "open".to_string()),
            straight(),
            recorder.clone(),
            || Snapshot::new(table.pin_latest()),
        );
        commit(&table, &live, |w| {
            let id = w.next_item().unwrap();
            w.set_value(id, &status(), Some("done".into())).unwrap();
        });
        assert_eq!(recorder.events.lock().len(), 1);
        assert_eq!(recorder.passed.lock().as_slice(), &[Icn::new(1)]);
    }

    #[test]
    fn ended_lifetime_stops_delivery() {
        let table = Arc::new(ItemTable::genesis());
        let live = Arc::new(LiveQueries::default());
        let recorder = Arc::new(Recorder::default());
        let lifetime = Lifetime::new();
        live.subscribe(
            &lifetime,
            Predicate::True,
            straight(),
            recorder.clone(),
            || Snapshot::new(table.pin_latest()),
        );
        assert_eq!(live.len(), 1);
        lifetime.end();
        assert_eq!(live.len(), 0);
        commit(&table, &live, |w| {
            w.next_item().unwrap();
        });
        assert_eq!(recorder.events.lock().len(), 1);
        assert!(recorder.passed.lock().is_empty());
    }
}
