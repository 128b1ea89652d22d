//! The item store facade.

use crate::change_feed::{ChangeFeed, CommitEvent};
use crate::config::StoreConfig;
use crate::dir::StoreDir;
use crate::error::{DbError, DbResult};
use crate::gate::Gate;
use crate::handle::{tx_pair, TxCompleter, TxError, TxHandle};
use crate::journal::{CommitRecord, Journal};
use crate::lifetime::Lifetime;
use crate::live::{LiveQueries, LiveQueryListener};
use crate::modifiable::SimpleModifiable;
use crate::query::Predicate;
use crate::queue::{Priority, ReadPool};
use crate::reader::{Reader, Snapshot};
use crate::table::ItemTable;
use crate::trigger::TriggerRegistry;
use crate::types::{Icn, ItemId};
use crate::writer::{PendingCommit, Writer};
use itemdb_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, info};

type WriteJob = Box<dyn FnOnce(&StoreShared, &Sender<CommitNotice>) + Send + 'static>;

struct CommitNotice {
    snapshot: Snapshot,
    items: Arc<[ItemId]>,
}

struct StoreShared {
    config: StoreConfig,
    table: Arc<ItemTable>,
    journal: Journal,
    triggers: TriggerRegistry,
    live: Arc<LiveQueries>,
    feed: ChangeFeed,
    modifiable: SimpleModifiable,
    dir: Option<StoreDir>,
}

struct Worker {
    handle: JoinHandle<()>,
    id: ThreadId,
}

impl Worker {
    fn spawn(name: &str, body: impl FnOnce() + Send + 'static) -> DbResult<Self> {
        let handle = thread::Builder::new().name(name.to_string()).spawn(body)?;
        let id = handle.thread().id();
        Ok(Self { handle, id })
    }

    fn join(self) {
        if thread::current().id() != self.id && self.handle.join().is_err() {
            error!("store worker thread panicked");
        }
    }
}

/// A transactional, versioned item-attribute store.
///
/// Writes are serialized on one writer thread; each successful write gets
/// the next item change number (ICN). Reads run on a pool of reader threads
/// against a snapshot pinned when they are submitted. Live queries, the
/// change feed and change listeners are notified on a separate thread in
/// ICN order, so slow listeners never hold up the writer.
///
/// ```rust,ignore
/// use itemdb_core::{Attribute, DbError, ItemStore, Reader};
///
/// let store = ItemStore::open_in_memory()?;
/// let summary: Attribute<String> = Attribute::new("tracker:summary");
///
/// let handle = store.write(move |w| {
///     let item = w.next_item()?;
///     w.set_value(item, &summary, Some("crash on start".into()))?;
///     Ok::<_, DbError>(item)
/// });
/// let item = handle.wait()?;
/// ```
pub struct ItemStore {
    shared: Arc<StoreShared>,
    jobs: Mutex<Option<Sender<WriteJob>>>,
    writer: Mutex<Option<Worker>>,
    notifier: Mutex<Option<Worker>>,
    reads: ReadPool,
}

impl ItemStore {
    /// Opens or creates a store in a directory.
    ///
    /// # Errors
    ///
    /// Fails if the directory is locked by another process, does not satisfy
    /// `create_if_missing`/`error_if_exists`, or holds a damaged journal.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> DbResult<Self> {
        let dir = StoreDir::open(path.as_ref(), config.create_if_missing, config.error_if_exists)?;
        let backend = FileBackend::open(&dir.journal_path())?;
        Self::start(config, Box::new(backend), Some(dir))
    }

    /// Opens a fresh store that lives in memory.
    ///
    /// # Errors
    ///
    /// Fails only if the store threads cannot be spawned.
    pub fn open_in_memory() -> DbResult<Self> {
        Self::open_with_backend(StoreConfig::default(), Box::new(InMemoryBackend::new()))
    }

    /// Opens a store over a journal backend, replaying what it holds.
    ///
    /// # Errors
    ///
    /// Fails if the journal is damaged or the store threads cannot be
    /// spawned.
    pub fn open_with_backend(config: StoreConfig, backend: Box<dyn StorageBackend>) -> DbResult<Self> {
        Self::start(config, backend, None)
    }

    fn start(config: StoreConfig, backend: Box<dyn StorageBackend>, dir: Option<StoreDir>) -> DbResult<Self> {
        let journal = Journal::new(backend, config.sync_on_commit);
        let table = Arc::new(ItemTable::genesis());
        let records = journal.replay()?;
        for record in &records {
            table.apply(record.icn, record.next_item, &record.rows);
        }
        info!(
            icn = %table.committed(),
            commits = records.len(),
            next_item = table.next_item(),
            path = ?dir.as_ref().map(StoreDir::path),
            "item store opened"
        );
        drop(records);

        let shared = Arc::new(StoreShared {
            feed: ChangeFeed::with_max_history(config.change_history),
            config,
            table,
            journal,
            triggers: TriggerRegistry::default(),
            live: Arc::new(LiveQueries::default()),
            modifiable: SimpleModifiable::new(),
            dir,
        });

        let (job_tx, job_rx) = mpsc::channel::<WriteJob>();
        let (notice_tx, notice_rx) = mpsc::channel::<CommitNotice>();
        let writer_shared = Arc::clone(&shared);
        let writer = Worker::spawn("itemdb-writer", move || {
            for job in job_rx {
                job(&writer_shared, &notice_tx);
            }
        })?;
        let notifier_shared = Arc::clone(&shared);
        let notifier = Worker::spawn("itemdb-notify", move || {
            notifier_shared.run_notifier(&notice_rx);
        })?;
        let reads = ReadPool::new(shared.config.reader_threads)?;

        Ok(Self {
            shared,
            jobs: Mutex::new(Some(job_tx)),
            writer: Mutex::new(Some(writer)),
            notifier: Mutex::new(Some(notifier)),
            reads,
        })
    }

    /// Submits a write transaction.
    ///
    /// The procedure runs on the writer thread against the latest committed
    /// state. If it returns `Ok`, triggers run, the changes are journaled and
    /// published at the next ICN. If it returns an error (for example
    /// [`DbError::Cancelled`]) nothing is written and no ICN is used.
    pub fn write<T, E, F>(&self, procedure: F) -> TxHandle<T, E>
    where
        T: Send + 'static,
        E: TxError,
        F: FnOnce(&mut Writer) -> Result<T, E> + Send + 'static,
    {
        let (handle, completer) = tx_pair::<T, E>();
        let job: WriteJob = Box::new(move |shared: &StoreShared, notices: &Sender<CommitNotice>| {
            shared.execute_write(procedure, completer, notices);
        });
        if let Some(jobs) = self.jobs.lock().as_ref() {
            // A failed send drops the job, which fails the handle.
            let _ = jobs.send(job);
        }
        handle
    }

    /// Submits a foreground read transaction.
    pub fn read<T, E, F>(&self, procedure: F) -> TxHandle<T, E>
    where
        T: Send + 'static,
        E: TxError,
        F: FnOnce(&Snapshot) -> Result<T, E> + Send + 'static,
    {
        self.enquire_read(Priority::Foreground, procedure)
    }

    /// Submits a read transaction with a scheduling priority.
    ///
    /// The snapshot is pinned now; the procedure sees this state no matter
    /// how long it waits in the queue.
    pub fn enquire_read<T, E, F>(&self, priority: Priority, procedure: F) -> TxHandle<T, E>
    where
        T: Send + 'static,
        E: TxError,
        F: FnOnce(&Snapshot) -> Result<T, E> + Send + 'static,
    {
        let (handle, completer) = tx_pair::<T, E>();
        let snapshot = self.snapshot();
        self.reads.submit(
            priority,
            Box::new(move || {
                if completer.cancel_token().is_cancelled() {
                    completer.complete(Err(E::from(DbError::Cancelled)), None);
                    return;
                }
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| procedure(&snapshot)))
                    .unwrap_or_else(|_| Err(E::from(DbError::transaction_aborted("read procedure panicked"))));
                completer.complete(outcome, None);
            }),
        );
        handle
    }

    /// A snapshot of the latest committed state.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.shared.table.pin_latest())
    }

    /// A snapshot of an older state.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::SnapshotUnavailable`] if the state was compacted
    /// away or has not been committed yet.
    pub fn snapshot_at(&self, icn: Icn) -> DbResult<Snapshot> {
        self.shared.table.pin_at(icn).map(Snapshot::new)
    }

    /// The latest committed ICN.
    #[must_use]
    pub fn last_icn(&self) -> Icn {
        self.shared.table.committed()
    }

    /// Subscribes to a predicate's result.
    ///
    /// The listener first receives the current result as an initial event,
    /// then a delta or an ICN-passed notification for every later commit, on
    /// `gate`, until `lifetime` ends.
    pub fn live_query(
        &self,
        lifetime: &Lifetime,
        predicate: Predicate,
        gate: Arc<dyn Gate>,
        listener: Arc<dyn LiveQueryListener>,
    ) {
        let table = Arc::clone(&self.shared.table);
        self.shared
            .live
            .subscribe(lifetime, predicate, gate, listener, move || Snapshot::new(table.pin_latest()));
    }

    /// Number of live query subscriptions.
    #[must_use]
    pub fn live_query_count(&self) -> usize {
        self.shared.live.len()
    }

    /// Registers a trigger under a unique name.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::DuplicateTrigger`] if the name is taken.
    pub fn register_trigger(
        &self,
        name: &str,
        predicate: Predicate,
        callback: impl Fn(&[ItemId], &mut Writer) -> DbResult<()> + Send + Sync + 'static,
    ) -> DbResult<()> {
        self.shared.triggers.register(name, predicate, Arc::new(callback))
    }

    /// Removes a trigger. Returns false if no trigger had that name.
    pub fn unregister_trigger(&self, name: &str) -> bool {
        self.shared.triggers.unregister(name)
    }

    /// Names of registered triggers, in run order.
    #[must_use]
    pub fn trigger_names(&self) -> Vec<String> {
        self.shared.triggers.names()
    }

    /// Listeners told "something changed" after every commit.
    #[must_use]
    pub fn modifiable(&self) -> &SimpleModifiable {
        &self.shared.modifiable
    }

    /// Subscribes to commit events.
    pub fn subscribe(&self) -> Receiver<CommitEvent> {
        self.shared.feed.subscribe()
    }

    /// Retained commit events after `cursor`.
    #[must_use]
    pub fn poll_changes(&self, cursor: Icn, limit: usize) -> Vec<CommitEvent> {
        self.shared.feed.poll(cursor, limit)
    }

    /// Drops row versions no snapshot can see any more.
    ///
    /// Returns the number of versions removed.
    pub fn compact(&self) -> usize {
        let removed = self.shared.table.compact();
        debug!(removed, horizon = %self.shared.table.horizon(), "compacted");
        removed
    }

    /// Oldest ICN still available to [`ItemStore::snapshot_at`].
    #[must_use]
    pub fn retention_horizon(&self) -> Icn {
        self.shared.table.horizon()
    }

    /// The store configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// The store directory, if the store is on disk.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.shared.dir.as_ref().map(StoreDir::path)
    }

    /// Size of the journal in bytes.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the backend.
    pub fn journal_size(&self) -> DbResult<u64> {
        self.shared.journal.size()
    }

    /// Returns true until [`ItemStore::close`] is called.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.jobs.lock().is_some()
    }

    /// Stops accepting work, finishes queued writes and their notifications,
    /// and stops the store threads. Queued reads fail with
    /// [`DbError::StoreClosed`].
    pub fn close(&self) {
        let jobs = self.jobs.lock().take();
        if jobs.is_none() {
            return;
        }
        drop(jobs);
        self.reads.shutdown();
        if let Some(writer) = self.writer.lock().take() {
            writer.join();
        }
        if let Some(notifier) = self.notifier.lock().take() {
            notifier.join();
        }
        debug!(icn = %self.last_icn(), "item store closed");
    }
}

impl Drop for ItemStore {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ItemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemStore")
            .field("icn", &self.last_icn())
            .field("path", &self.path())
            .finish()
    }
}

impl StoreShared {
    fn execute_write<T, E, F>(&self, procedure: F, completer: TxCompleter<T, E>, notices: &Sender<CommitNotice>)
    where
        E: TxError,
        F: FnOnce(&mut Writer) -> Result<T, E>,
    {
        let cancel = completer.cancel_token();
        if cancel.is_cancelled() {
            debug!("write cancelled before it started");
            completer.complete(Err(E::from(DbError::Cancelled)), None);
            return;
        }

        let mut writer = Writer::new(Arc::clone(&self.table), cancel);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<T, E> {
            let value = procedure(&mut writer)?;
            self.triggers.run(&mut writer, self.config.max_trigger_rounds)?;
            Ok(value)
        }))
        .unwrap_or_else(|_| Err(E::from(DbError::transaction_aborted("write procedure panicked"))));

        match outcome {
            Ok(value) => {
                let pending = writer.into_commit();
                if pending.skip {
                    debug!("write changed nothing; skipped");
                    for callback in pending.finish {
                        callback(true);
                    }
                    completer.complete(Ok(value), None);
                    return;
                }
                match self.commit(pending, notices) {
                    Ok(icn) => completer.complete(Ok(value), Some(icn)),
                    Err(e) => {
                        error!(error = %e, "commit failed");
                        completer.complete(Err(E::from(e)), None);
                    }
                }
            }
            Err(e) => {
                if e.is_cancelled() {
                    debug!("write cancelled");
                } else {
                    debug!("write procedure failed");
                }
                for callback in writer.take_finish() {
                    callback(false);
                }
                completer.complete(Err(e), None);
            }
        }
    }

    fn commit(&self, pending: PendingCommit, notices: &Sender<CommitNotice>) -> DbResult<Icn> {
        let PendingCommit {
            changes,
            next_item,
            finish,
            ..
        } = pending;
        let icn = self.table.committed().next();
        let record = CommitRecord {
            icn,
            next_item,
            rows: changes,
        };
        if let Err(e) = self.journal.append(&record) {
            for callback in finish {
                callback(false);
            }
            return Err(e);
        }
        self.table.apply(icn, next_item, &record.rows);
        let items: Arc<[ItemId]> = record.rows.iter().map(|change| change.item).collect();
        debug!(%icn, items = items.len(), "committed");

        // The notifier may be gone during shutdown; the commit is durable
        // either way.
        let _ = notices.send(CommitNotice {
            snapshot: Snapshot::new(self.table.pin_latest()),
            items,
        });
        for callback in finish {
            callback(true);
        }
        Ok(icn)
    }

    fn run_notifier(&self, notices: &Receiver<CommitNotice>) {
        for notice in notices {
            let icn = notice.snapshot.icn();
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
                self.live.process(&notice.snapshot, &notice.items);
                self.feed.emit(CommitEvent {
                    icn,
                    items: Arc::clone(&notice.items),
                });
                self.modifiable.fire_changed();
            }));
            if delivered.is_err() {
                error!(%icn, "commit listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::TxStatus;
    use crate::reader::Reader;
    use crate::schema::Attribute;
    use std::time::Duration;

    fn status() -> Attribute<String> {
        Attribute::new("tracker:status")
    }

    fn create(store: &ItemStore, value: &str) -> ItemId {
        let value = value.to_string();
        store
            .write(move |w| -> DbResult<ItemId> {
                let item = w.next_item()?;
                w.set_value(item, &status(), Some(value))?;
                Ok(item)
            })
            .wait()
            .unwrap()
    }

    #[test]
    fn writes_get_increasing_icns() {
        let store = ItemStore::open_in_memory().unwrap();
        let first = store.write(|_| Ok::<_, DbError>(()));
        let second = store.write(|_| Ok::<_, DbError>(()));
        let a = first.wait_status().icn().unwrap();
        let b = second.wait_status().icn().unwrap();
        assert!(a < b);
        assert_eq!(store.last_icn(), b);
    }

    #[test]
    fn cancelled_write_leaves_no_trace() {
        let store = ItemStore::open_in_memory().unwrap();
        let item = create(&store, "open");
        let before = store.last_icn();

        let handle = store.write(move |w| -> DbResult<()> {
            w.set_value(item, &status(), Some("done".into()))?;
            Err(DbError::Cancelled)
        });
        assert_eq!(handle.wait_status(), TxStatus::Cancelled);
        assert_eq!(store.last_icn(), before);
        assert_eq!(store.snapshot().get(item, &status()).as_deref(), Some("open"));

        let next = store.write(|_| Ok::<_, DbError>(())).wait_status();
        assert_eq!(next.icn(), Some(before.next()));
    }

    #[test]
    fn finish_callbacks_see_the_outcome() {
        let store = ItemStore::open_in_memory().unwrap();
        let (tx, rx) = mpsc::channel();
        let ok_tx = tx.clone();
        store
            .write(move |w| -> DbResult<()> {
                w.on_finish(move |success| ok_tx.send(success).unwrap());
                Ok(())
            })
            .wait()
            .unwrap();
        let _ = store
            .write(move |w| -> DbResult<()> {
                w.on_finish(move |success| tx.send(success).unwrap());
                Err(DbError::invalid_operation("nope"))
            })
            .wait();
        assert_eq!(rx.iter().take(2).collect::<Vec<_>>(), vec![true, false]);
    }

    #[test]
    fn panicking_procedure_aborts() {
        let store = ItemStore::open_in_memory().unwrap();
        let handle = store.write(|_| -> DbResult<()> { panic!("boom") });
        assert!(matches!(handle.wait(), Err(DbError::TransactionAborted { .. })));
        assert!(store.write(|_| Ok::<_, DbError>(())).wait().is_ok());
    }

    #[test]
    fn reads_see_the_snapshot_of_submission() {
        let store = ItemStore::open_in_memory().unwrap();
        let item = create(&store, "open");
        let snapshot = store.snapshot();
        store
            .write(move |w| w.set_value(item, &status(), Some("done".into())))
            .wait()
            .unwrap();
        assert_eq!(snapshot.get(item, &status()).as_deref(), Some("open"));
        let latest = store
            .read(move |s| Ok::<_, DbError>(s.get(item, &status())))
            .wait()
            .unwrap();
        assert_eq!(latest.as_deref(), Some("done"));
    }

    #[test]
    fn cancelled_read_does_not_run() {
        let store = ItemStore::open_with_backend(
            StoreConfig::default().reader_threads(1),
            Box::new(InMemoryBackend::new()),
        )
        .unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let blocker = store.read(move |_| {
            release_rx.recv().ok();
            Ok::<_, DbError>(())
        });
        let queued = store.read(|_| Ok::<_, DbError>(1));
        queued.cancel();
        release_tx.send(()).unwrap();
        blocker.wait().unwrap();
        assert_eq!(queued.wait_status(), TxStatus::Cancelled);
    }

    #[test]
    fn commits_reach_the_change_feed() {
        let store = ItemStore::open_in_memory().unwrap();
        let events = store.subscribe();
        let item = create(&store, "open");
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(event.items.contains(&item));
        assert_eq!(store.poll_changes(Icn::ZERO, 10).len(), 1);
    }

    #[test]
    fn closed_store_fails_new_work() {
        let store = ItemStore::open_in_memory().unwrap();
        store.close();
        assert!(!store.is_open());
        assert!(matches!(
            store.write(|_| Ok::<_, DbError>(())).wait(),
            Err(DbError::StoreClosed)
        ));
        assert!(matches!(
            store.read(|_| Ok::<_, DbError>(())).wait(),
            Err(DbError::StoreClosed)
        ));
    }
}
