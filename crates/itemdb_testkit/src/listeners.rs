//! Listeners that record what they receive.

use itemdb_core::{straight, ItemStore, Lifetime, LiveQueryEvent, LiveQueryListener, Predicate};
use itemdb_sync::{MergeReport, SyncManager};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default time to wait for deliveries.
pub const WAIT: Duration = Duration::from_secs(5);

/// A thread-safe log of received values.
pub struct Recorder<T> {
    values: Mutex<Vec<T>>,
    arrived: Condvar,
}

impl<T: Clone> Recorder<T> {
    /// An empty log.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            values: Mutex::new(Vec::new()),
            arrived: Condvar::new(),
        })
    }

    /// Appends a value and wakes waiters.
    pub fn record(&self, value: T) {
        self.values.lock().push(value);
        self.arrived.notify_all();
    }

    /// Everything received so far.
    pub fn values(&self) -> Vec<T> {
        self.values.lock().clone()
    }

    /// Number of values received.
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    /// Returns true if nothing arrived.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until at least `count` values arrived. Returns false on timeout.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut values = self.values.lock();
        while values.len() < count {
            if self.arrived.wait_until(&mut values, deadline).timed_out() {
                return values.len() >= count;
            }
        }
        true
    }
}

/// Records merge reports of a sync manager.
pub type RecordingMergeListener = Recorder<MergeReport>;

/// Records live query events.
pub type RecordingListener = Recorder<LiveQueryEvent>;

impl LiveQueryListener for Recorder<LiveQueryEvent> {
    fn on_change(&self, event: &LiveQueryEvent) {
        self.record(event.clone());
    }
}

/// Subscribes a fresh merge recorder until `lifetime` ends.
pub fn record_merges(manager: &SyncManager, lifetime: &Lifetime) -> Arc<RecordingMergeListener> {
    let recorder = Recorder::new();
    let sink = Arc::clone(&recorder);
    manager.add_merge_listener(lifetime, straight(), move |report| sink.record(report.clone()));
    recorder
}

/// Subscribes a fresh live query recorder until `lifetime` ends.
pub fn record_live_query(store: &ItemStore, lifetime: &Lifetime, predicate: Predicate) -> Arc<RecordingListener> {
    let recorder = Recorder::new();
    store.live_query(lifetime, predicate, straight(), Arc::clone(&recorder) as Arc<dyn LiveQueryListener>);
    recorder
}

/// Records one entry per change notification of the store.
pub fn record_changes(store: &ItemStore, lifetime: &Lifetime) -> Arc<Recorder<()>> {
    let recorder = Recorder::new();
    let sink = Arc::clone(&recorder);
    store.modifiable().add_listener(lifetime, straight(), move || sink.record(()));
    recorder
}
