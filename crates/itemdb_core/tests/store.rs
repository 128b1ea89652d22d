//! Item store behavior across transactions, restarts and snapshots.

use itemdb_core::{
    sys, Attribute, DbError, DbObject, DbResult, Icn, ItemId, ItemStore, Predicate, Priority,
    Reader, StoreConfig, TxStatus,
};
use itemdb_storage::InMemoryBackend;
use std::collections::BTreeSet;
use std::sync::mpsc;
use std::time::Duration;
use tempfile::tempdir;

fn status() -> Attribute<String> {
    Attribute::new("tracker:status")
}

fn tags() -> Attribute<BTreeSet<String>> {
    Attribute::new("tracker:tags")
}

fn issue() -> DbObject {
    DbObject::item_type("tracker:type:issue")
}

fn create_issue(store: &ItemStore, value: &str) -> ItemId {
    let value = value.to_string();
    store
        .write(move |w| -> DbResult<ItemId> {
            let issue_type = w.materialize(&issue())?;
            let item = w.next_item()?;
            w.set_value(item, &*sys::TYPE, Some(issue_type))?;
            w.set_value(item, &status(), Some(value))?;
            Ok(item)
        })
        .wait()
        .unwrap()
}

fn set_status(store: &ItemStore, item: ItemId, value: &str) -> Icn {
    let value = value.to_string();
    let handle = store.write(move |w| w.set_value(item, &status(), Some(value)));
    assert!(handle.wait_status().is_success());
    handle.commit_icn().unwrap()
}

#[test]
fn snapshots_do_not_see_later_commits() {
    let store = ItemStore::open_in_memory().unwrap();
    let item = create_issue(&store, "open");
    let before = store.snapshot();

    let icn = set_status(&store, item, "done");
    assert!(icn > before.icn());

    assert_eq!(before.get(item, &status()).as_deref(), Some("open"));
    assert_eq!(store.snapshot().get(item, &status()).as_deref(), Some("done"));
    assert_eq!(
        store.snapshot_at(before.icn()).unwrap().get(item, &status()).as_deref(),
        Some("open")
    );
}

#[test]
fn reads_are_pinned_at_submission() {
    let store = ItemStore::open_in_memory().unwrap();
    let item = create_issue(&store, "open");

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let blocker = store.enquire_read(Priority::Background, move |_| {
        let _ = release_rx.recv_timeout(Duration::from_secs(5));
        Ok::<_, DbError>(())
    });
    let second_blocker = store.enquire_read(Priority::Background, |_| Ok::<_, DbError>(()));
    let pinned = store.read(move |snapshot| Ok::<_, DbError>(snapshot.get(item, &status())));

    set_status(&store, item, "done");
    release_tx.send(()).unwrap();

    assert_eq!(pinned.wait().unwrap().as_deref(), Some("open"));
    blocker.wait().unwrap();
    second_blocker.wait().unwrap();
}

#[test]
fn icns_increase_and_cancelled_writes_use_none() {
    let store = ItemStore::open_in_memory().unwrap();
    let item = create_issue(&store, "open");
    let mut last = store.last_icn();

    for round in 0..5 {
        if round % 2 == 0 {
            let icn = set_status(&store, item, &format!("state-{round}"));
            assert_eq!(icn, last.next());
            last = icn;
        } else {
            let handle = store.write(move |w| -> DbResult<()> {
                w.set_value(item, &status(), Some("discarded".to_string()))?;
                Err(DbError::Cancelled)
            });
            assert_eq!(handle.wait_status(), TxStatus::Cancelled);
            assert_eq!(store.last_icn(), last);
        }
    }
    assert_ne!(store.snapshot().get(item, &status()).as_deref(), Some("discarded"));
}

#[test]
fn handle_cancelled_before_start_never_runs() {
    let store = ItemStore::open_in_memory().unwrap();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let blocker = store.write(move |_| {
        let _ = release_rx.recv_timeout(Duration::from_secs(5));
        Ok::<_, DbError>(())
    });
    let skipped = store.write(|w| {
        w.next_item()?;
        Ok::<_, DbError>(())
    });
    skipped.cancel();
    release_tx.send(()).unwrap();

    blocker.wait().unwrap();
    assert_eq!(skipped.wait_status(), TxStatus::Cancelled);
    assert_eq!(store.last_icn(), Icn::new(1));
}

#[test]
fn file_store_survives_restart() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("store");

    let (item, cleared, icn) = {
        let store = ItemStore::open(&path, StoreConfig::default()).unwrap();
        let item = create_issue(&store, "open");
        let cleared = create_issue(&store, "spam");
        store
            .write(move |w| {
                w.set_value(item, &tags(), Some(BTreeSet::from(["ui".to_string(), "db".to_string()])))?;
                w.clear_item(cleared)
            })
            .wait()
            .unwrap();
        (item, cleared, store.last_icn())
    };

    let store = ItemStore::open(&path, StoreConfig::default()).unwrap();
    assert_eq!(store.last_icn(), icn);
    let snapshot = store.snapshot();
    assert_eq!(snapshot.get(item, &status()).as_deref(), Some("open"));
    assert_eq!(snapshot.get(item, &tags()).map(|t| t.len()), Some(2));
    assert!(!snapshot.is_alive(cleared));
    assert!(snapshot.find_materialized(&issue()).is_some());
    assert!(snapshot.attribute_key("tracker:tags").is_some());

    // Item ids are never reused across restarts.
    let fresh = create_issue(&store, "new");
    assert!(fresh > cleared);
}

#[test]
fn second_open_of_a_directory_is_locked() {
    let temp = tempdir().unwrap();
    let _store = ItemStore::open(temp.path(), StoreConfig::default()).unwrap();
    assert!(matches!(
        ItemStore::open(temp.path(), StoreConfig::default()),
        Err(DbError::StoreLocked)
    ));
}

#[test]
fn torn_journal_tail_is_ignored_on_reopen() {
    let backend = InMemoryBackend::new();
    let item = {
        let store = ItemStore::open_with_backend(StoreConfig::default(), Box::new(backend.clone())).unwrap();
        let item = create_issue(&store, "open");
        set_status(&store, item, "done");
        item
    };
    let length = backend.snapshot().len() as u64;
    let mut handle = backend.clone();
    itemdb_storage::StorageBackend::truncate(&mut handle, length - 5).unwrap();

    let store = ItemStore::open_with_backend(StoreConfig::default(), Box::new(backend)).unwrap();
    assert_eq!(store.last_icn(), Icn::new(1));
    assert_eq!(store.snapshot().get(item, &status()).as_deref(), Some("open"));
}

#[test]
fn triggers_maintain_derived_values_atomically() {
    let store = ItemStore::open_in_memory().unwrap();
    let closed: Attribute<bool> = Attribute::local("tracker:closed");
    let derived = closed.clone();
    store
        .register_trigger(
            "closed-flag",
            Predicate::equals(&status(), "done".to_string()),
            move |items, w| -> DbResult<()> {
                for &item in items {
                    if !w.is_alive(item) {
                        continue;
                    }
                    let done = w.get(item, &status()).as_deref() == Some("done");
                    w.set_value(item, &derived, done.then_some(true))?;
                }
                Ok(())
            },
        )
        .unwrap();

    let item = create_issue(&store, "open");
    assert_eq!(store.snapshot().get(item, &closed), None);

    let icn = set_status(&store, item, "done");
    let snapshot = store.snapshot_at(icn).unwrap();
    assert_eq!(snapshot.get(item, &closed), Some(true));

    set_status(&store, item, "open");
    assert_eq!(store.snapshot().get(item, &closed), None);
}

#[test]
fn runaway_triggers_abort_the_transaction() {
    let store = ItemStore::open_with_backend(
        StoreConfig::default().max_trigger_rounds(4),
        Box::new(InMemoryBackend::new()),
    )
    .unwrap();
    let counter: Attribute<i64> = Attribute::new("tracker:counter");
    let bump = counter.clone();
    store
        .register_trigger("bump", Predicate::has_value(&counter), move |items, w| -> DbResult<()> {
            for &item in items {
                let next = w.get(item, &bump).unwrap_or(0) + 1;
                w.set_value(item, &bump, Some(next))?;
            }
            Ok(())
        })
        .unwrap();

    let before = store.last_icn();
    let result = store
        .write(move |w| {
            let item = w.next_item()?;
            w.set_value(item, &counter, Some(1))
        })
        .wait();
    assert!(matches!(result, Err(DbError::TriggerCascade { .. })));
    assert_eq!(store.last_icn(), before);
}

#[test]
fn compaction_respects_pinned_snapshots() {
    let store = ItemStore::open_in_memory().unwrap();
    let item = create_issue(&store, "open");
    let pinned = store.snapshot();
    for round in 0..3 {
        set_status(&store, item, &format!("state-{round}"));
    }

    store.compact();
    assert_eq!(pinned.get(item, &status()).as_deref(), Some("open"));
    assert!(store.snapshot_at(pinned.icn()).is_ok());

    let pinned_icn = pinned.icn();
    drop(pinned);
    store.compact();
    assert!(store.retention_horizon() > pinned_icn);
    assert!(matches!(
        store.snapshot_at(pinned_icn),
        Err(DbError::SnapshotUnavailable { .. })
    ));
}

#[test]
fn change_feed_reports_every_commit() {
    let store = ItemStore::open_in_memory().unwrap();
    let events = store.subscribe();
    let item = create_issue(&store, "open");
    let icn = set_status(&store, item, "done");

    let mut seen = Vec::new();
    while seen.last().copied() != Some(icn) {
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(event.items.contains(&item));
        seen.push(event.icn);
    }
    assert_eq!(seen, vec![Icn::new(1), icn]);
    assert_eq!(store.poll_changes(Icn::new(1), 10).len(), 1);
}

#[test]
fn queries_are_repeatable_for_a_fixed_snapshot() {
    let store = ItemStore::open_in_memory().unwrap();
    for value in ["open", "done", "open", "wontfix"] {
        create_issue(&store, value);
    }
    let snapshot = store.snapshot();
    let predicate = Predicate::of_type(&issue()).and(Predicate::equals(&status(), "open".to_string()));
    let first = snapshot.query(predicate.clone()).copy_items_sorted();
    create_issue(&store, "open");
    let again = snapshot.reopen().unwrap().query(predicate.clone()).copy_items_sorted();

    assert_eq!(first.len(), 2);
    assert_eq!(first, again);
    assert_eq!(store.snapshot().query(predicate).count(), 3);
}

#[test]
fn unchanged_writes_can_skip_their_icn() {
    let store = ItemStore::open_in_memory().unwrap();
    let item = create_issue(&store, "open");
    let before = store.last_icn();

    let skipped = store.write(move |w| {
        w.skip_if_unchanged();
        w.set_value(item, &status(), Some("open".to_string()))
    });
    assert_eq!(skipped.wait_status(), TxStatus::Completed);
    assert_eq!(store.last_icn(), before);

    let plain = store.write(|_| Ok::<_, DbError>(()));
    assert_eq!(plain.wait_status(), TxStatus::Committed(before.next()));
}

#[test]
fn ids_allocated_by_skipped_writes_are_not_reused() {
    let store = ItemStore::open_in_memory().unwrap();
    let discarded = store
        .write(|w| -> DbResult<ItemId> {
            w.skip_if_unchanged();
            let item = w.next_item()?;
            w.clear_item(item)?;
            Ok(item)
        })
        .wait()
        .unwrap();
    let next = store
        .write(|w| w.next_item())
        .wait()
        .unwrap();
    assert_ne!(discarded, next);
    assert!(next > discarded);
}
