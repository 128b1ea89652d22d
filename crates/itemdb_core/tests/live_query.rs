//! Live query delivery: ordering, watermarks and replay equivalence.

use itemdb_core::{
    straight, Attribute, DbResult, Icn, ItemId, ItemStore, Lifetime, LiveQueryEvent,
    LiveQueryListener, Predicate, Reader, ThreadGate,
};
use parking_lot::{Condvar, Mutex};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

fn status() -> Attribute<String> {
    Attribute::new("tracker:status")
}

/// Rebuilds the result set from delivered events.
#[derive(Default)]
struct Replay {
    state: Mutex<ReplayState>,
    progressed: Condvar,
}

#[derive(Default)]
struct ReplayState {
    items: BTreeSet<ItemId>,
    watermark: Icn,
    icns: Vec<Icn>,
    empty_events: usize,
}

impl Replay {
    fn wait_for(&self, icn: Icn) -> (BTreeSet<ItemId>, Icn) {
        let mut state = self.state.lock();
        while state.watermark < icn {
            if self
                .progressed
                .wait_for(&mut state, Duration::from_secs(5))
                .timed_out()
            {
                panic!("live query stalled at {}", state.watermark);
            }
        }
        (state.items.clone(), state.watermark)
    }
}

impl LiveQueryListener for Replay {
    fn on_change(&self, event: &LiveQueryEvent) {
        let mut state = self.state.lock();
        if event.initial {
            state.items = event.added_and_changed.iter().copied().collect();
        } else {
            state.items.extend(event.added_and_changed.iter().copied());
            for item in &event.removed {
                state.items.remove(item);
            }
        }
        if event.is_empty() && !event.initial {
            state.empty_events += 1;
        }
        state.watermark = event.icn;
        state.icns.push(event.icn);
        self.progressed.notify_all();
    }

    fn on_icn_passed(&self, icn: Icn) {
        let mut state = self.state.lock();
        state.watermark = icn;
        state.icns.push(icn);
        self.progressed.notify_all();
    }
}

#[derive(Debug, Clone)]
enum Op {
    Create(u8),
    Set(usize, u8),
    Clear(usize),
}

const STATUSES: [&str; 3] = ["open", "done", "wontfix"];

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..3).prop_map(Op::Create),
        (any::<usize>(), 0u8..3).prop_map(|(i, s)| Op::Set(i, s)),
        any::<usize>().prop_map(Op::Clear),
    ]
}

fn apply(store: &ItemStore, items: &mut Vec<ItemId>, op: Op) {
    match op {
        Op::Create(s) => {
            let value = STATUSES[usize::from(s)].to_string();
            let item = store
                .write(move |w| -> DbResult<ItemId> {
                    let item = w.next_item()?;
                    w.set_value(item, &status(), Some(value))?;
                    Ok(item)
                })
                .wait()
                .unwrap();
            items.push(item);
        }
        Op::Set(i, s) if !items.is_empty() => {
            let item = items[i % items.len()];
            let value = STATUSES[usize::from(s)].to_string();
            store.write(move |w| w.set_value(item, &status(), Some(value))).wait().unwrap();
        }
        Op::Clear(i) if !items.is_empty() => {
            let item = items.remove(i % items.len());
            store.write(move |w| w.clear_item(item)).wait().unwrap();
        }
        _ => {}
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn replayed_deltas_match_the_query(
        seed in prop::collection::vec(0u8..3, 0..4),
        ops in prop::collection::vec(op_strategy(), 1..24),
    ) {
        let store = ItemStore::open_in_memory().unwrap();
        let mut items = Vec::new();
        for s in seed {
            apply(&store, &mut items, Op::Create(s));
        }

        let predicate = Predicate::equals(&status(), "open".to_string());
        let replay = Arc::new(Replay::default());
        let lifetime = Lifetime::new();
        store.live_query(&lifetime, predicate.clone(), straight(), Arc::clone(&replay) as Arc<dyn LiveQueryListener>);

        for op in ops {
            apply(&store, &mut items, op);
        }

        let (replayed, watermark) = replay.wait_for(store.last_icn());
        let expected: BTreeSet<ItemId> = store
            .snapshot_at(watermark)
            .unwrap()
            .query(predicate)
            .items();
        prop_assert_eq!(replayed, expected);

        let icns = replay.state.lock().icns.clone();
        prop_assert!(icns.windows(2).all(|pair| pair[0] < pair[1]));
        lifetime.end();
    }
}

#[test]
fn unrelated_commits_only_advance_the_watermark() {
    let store = ItemStore::open_in_memory().unwrap();
    let other: Attribute<String> = Attribute::new("tracker:other");
    let replay = Arc::new(Replay::default());
    let lifetime = Lifetime::new();
    store.live_query(
        &lifetime,
        Predicate::equals(&status(), "open".to_string()),
        straight(),
        Arc::clone(&replay) as Arc<dyn LiveQueryListener>,
    );

    store
        .write(move |w| {
            let item = w.next_item()?;
            w.set_value(item, &other, Some("x".to_string()))
        })
        .wait()
        .unwrap();

    let (items, watermark) = replay.wait_for(store.last_icn());
    assert!(items.is_empty());
    assert_eq!(watermark, store.last_icn());
    assert_eq!(replay.state.lock().empty_events, 0);
}

#[test]
fn delivery_uses_the_requested_gate_and_stops_with_the_lifetime() {
    struct GateCheck {
        gate: Arc<ThreadGate>,
        calls: Mutex<Vec<bool>>,
    }

    impl LiveQueryListener for GateCheck {
        fn on_change(&self, _event: &LiveQueryEvent) {
            self.calls.lock().push(self.gate.is_current());
        }

        fn on_icn_passed(&self, _icn: Icn) {
            self.calls.lock().push(self.gate.is_current());
        }
    }

    let store = ItemStore::open_in_memory().unwrap();
    let gate = ThreadGate::spawn("live-test").unwrap();
    let listener = Arc::new(GateCheck {
        gate: Arc::clone(&gate),
        calls: Mutex::new(Vec::new()),
    });
    let lifetime = Lifetime::new();
    store.live_query(
        &lifetime,
        Predicate::has_value(&status()),
        gate.clone(),
        Arc::clone(&listener) as Arc<dyn LiveQueryListener>,
    );
    assert_eq!(store.live_query_count(), 1);

    let write = |value: &'static str| {
        store
            .write(move |w| {
                let item = w.next_item()?;
                w.set_value(item, &status(), Some(value.to_string()))
            })
            .wait()
            .unwrap();
    };
    write("open");

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while listener.calls.lock().len() < 2 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*listener.calls.lock(), vec![true, true]);

    lifetime.end();
    assert_eq!(store.live_query_count(), 0);
    write("done");
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(listener.calls.lock().len(), 2);
}

#[test]
fn listeners_on_a_straight_gate_may_query_the_store() {
    struct Counting {
        store: Arc<ItemStore>,
        seen: Mutex<Vec<usize>>,
    }

    impl LiveQueryListener for Counting {
        fn on_change(&self, _event: &LiveQueryEvent) {
            self.seen.lock().push(self.store.live_query_count());
        }
    }

    let store = Arc::new(ItemStore::open_in_memory().unwrap());
    let listener = Arc::new(Counting {
        store: Arc::clone(&store),
        seen: Mutex::new(Vec::new()),
    });
    let lifetime = Lifetime::new();
    store.live_query(
        &lifetime,
        Predicate::equals(&status(), "open".to_string()),
        straight(),
        Arc::clone(&listener) as Arc<dyn LiveQueryListener>,
    );
    assert_eq!(*listener.seen.lock(), vec![1]);
    lifetime.end();
    assert_eq!(store.live_query_count(), 0);
}
