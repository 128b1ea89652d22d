//! The sync manager: commit scheduling, downloads, merges and lock queries.

use crate::config::SyncConfig;
use crate::connection::Connection;
use crate::download::DownloadDrain;
use crate::drain::{EditCommit, EditDrain};
use crate::error::{SyncError, SyncResult};
use crate::lock::{LockOwner, LockTable, SessionId};
use crate::merge::{merge_item, MergeOutcome, MergeRegistry, MergeReport};
use crate::schema::{
    BASE, CHANGE_HISTORY, CONFLICT, CONNECTION, CONNECTION_TYPE, DONE_UPLOAD, DONE_UPLOAD_HISTORY, DOWNLOAD, INVISIBLE,
    MASTER_REFERENCE, UPLOADING, UPLOAD_TASK,
};
use crate::session::EditSession;
use crate::state::SyncState;
use crate::subtree;
use crate::upload::{InterruptFlag, ItemUploader, UploadReport};
use crate::version::ItemVersion;
use itemdb_core::{
    straight, AttrMap, Gate, ItemId, ItemStore, Lifetime, Priority, Reader, Snapshot, TxHandle, Writer,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

type FinishAction = Box<dyn FnOnce(bool) + Send>;

/// A completion action that runs once, from whichever path sees the
/// outcome first: the writer's finish callback, or the handle's completion
/// when the write was cancelled before it started.
#[derive(Clone, Default)]
pub(crate) struct Finisher(Arc<Mutex<Option<FinishAction>>>);

impl Finisher {
    pub(crate) fn new(action: impl FnOnce(bool) + Send + 'static) -> Self {
        Self(Arc::new(Mutex::new(Some(Box::new(action)))))
    }

    pub(crate) fn run(&self, success: bool) {
        let action = self.0.lock().take();
        if let Some(action) = action {
            action(success);
        }
    }
}

type ReportCallback = Arc<dyn Fn(&MergeReport) + Send + Sync>;

struct MergeListener {
    id: u64,
    gate: Arc<dyn Gate>,
    callback: ReportCallback,
    alive: Arc<AtomicBool>,
}

#[derive(Default)]
struct MergeListeners {
    next_id: AtomicU64,
    listeners: Arc<Mutex<Vec<MergeListener>>>,
}

impl MergeListeners {
    fn add(&self, lifetime: &Lifetime, gate: Arc<dyn Gate>, callback: ReportCallback) {
        if lifetime.is_ended() {
            return;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let alive = Arc::new(AtomicBool::new(true));
        self.listeners.lock().push(MergeListener {
            id,
            gate,
            callback,
            alive: Arc::clone(&alive),
        });
        let listeners: Weak<Mutex<Vec<MergeListener>>> = Arc::downgrade(&self.listeners);
        lifetime.on_end(move || {
            alive.store(false, Ordering::Release);
            if let Some(listeners) = listeners.upgrade() {
                listeners.lock().retain(|l| l.id != id);
            }
        });
    }

    fn fire(&self, report: MergeReport) {
        let report = Arc::new(report);
        let targets: Vec<(Arc<dyn Gate>, ReportCallback, Arc<AtomicBool>)> = self
            .listeners
            .lock()
            .iter()
            .map(|l| (Arc::clone(&l.gate), Arc::clone(&l.callback), Arc::clone(&l.alive)))
            .collect();
        for (gate, callback, alive) in targets {
            let report = Arc::clone(&report);
            gate.execute(Box::new(move || {
                if alive.load(Ordering::Acquire) {
                    callback(&report);
                }
            }));
        }
    }
}

/// State shared by the manager, its sessions and in-flight transactions.
pub(crate) struct ManagerInner {
    /// The store everything is written to.
    pub(crate) store: Arc<ItemStore>,
    pub(crate) config: SyncConfig,
    /// Who may mutate which item right now.
    pub(crate) locks: LockTable,
    /// Frozen strategies.
    pub(crate) registry: MergeRegistry,
    connections: RwLock<HashMap<String, Arc<dyn Connection>>>,
    listeners: MergeListeners,
    /// Ids of uploads running in this process.
    pub(crate) active_uploads: Mutex<HashSet<String>>,
    sequence: AtomicU64,
}

impl ManagerInner {
    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn connection(&self, id: &str) -> Option<Arc<dyn Connection>> {
        self.connections.read().get(id).cloned()
    }

    /// Runs an edit commit inside a write transaction.
    ///
    /// `release` runs once the outcome is known, before the handle
    /// completes; the commit's own callback runs after.
    pub(crate) fn commit<C: EditCommit>(
        self: &Arc<Self>,
        owner: Option<LockOwner>,
        release: Finisher,
        commit: C,
    ) -> TxHandle<bool, SyncError> {
        let commit = Arc::new(Mutex::new(commit));
        let performer = Arc::clone(&commit);
        let manager = Arc::clone(self);
        let on_finish = release.clone();
        let handle = self.store.write(move |writer: &mut Writer| -> SyncResult<bool> {
            writer.on_finish(move |committed| on_finish.run(committed));
            writer.skip_if_unchanged();
            let mut run = MergeRun::start(&manager, writer, owner);
            let mut drain = EditDrain::new(writer, &manager, owner);
            performer.lock().perform_commit(&mut drain)?;
            drain.finish(&mut run)?;
            run.finish();
            Ok(!writer.changed_items().is_empty())
        });
        handle.on_complete(straight(), move |status| {
            release.run(status.is_success());
            commit.lock().on_commit_finished(status.is_success());
        });
        handle
    }

    /// Merges the pending downloads of `items` in a new transaction.
    pub(crate) fn request_auto_merge(self: &Arc<Self>, items: Vec<ItemId>) -> TxHandle<MergeReport, SyncError> {
        let manager = Arc::clone(self);
        self.store.write(move |writer: &mut Writer| -> SyncResult<MergeReport> {
            writer.skip_if_unchanged();
            let mut run = MergeRun::start(&manager, writer, None);
            for item in items {
                let pending = writer
                    .values(item)
                    .is_some_and(|row| row.contains_key(DOWNLOAD.id()) && !row.contains_key(UPLOAD_TASK.id()));
                if pending {
                    run.merge(&manager, writer, item)?;
                }
            }
            Ok(run.finish())
        })
    }

    /// Requests a merge for the items among `items` and their masters that
    /// have a download waiting. Used after locks are released outside a
    /// merge run.
    pub(crate) fn merge_pending(self: &Arc<Self>, items: &[ItemId]) {
        let snapshot = self.store.snapshot();
        let candidates: BTreeSet<ItemId> = items
            .iter()
            .flat_map(|item| std::iter::once(*item).chain(subtree::masters_of(&snapshot, *item)))
            .collect();
        let pending: Vec<ItemId> = candidates
            .into_iter()
            .filter(|item| {
                snapshot
                    .values(*item)
                    .is_some_and(|row| row.contains_key(DOWNLOAD.id()) && !row.contains_key(UPLOAD_TASK.id()))
            })
            .collect();
        if !pending.is_empty() {
            debug!(items = pending.len(), "merging downloads that waited for a lock");
            let _ = self.request_auto_merge(pending);
        }
    }

    /// The item's state, telling uploads of this process apart from ones
    /// left behind by a crash.
    pub(crate) fn sync_state<R: Reader + ?Sized>(&self, reader: &R, item: ItemId) -> Option<SyncState> {
        let state = SyncState::of(reader, item)?;
        if state == SyncState::Uploading {
            let running = reader
                .get(item, &*UPLOAD_TASK)
                .is_some_and(|task| self.active_uploads.lock().contains(&task));
            if !running {
                return Some(SyncState::UploadUnconfirmed);
            }
        }
        Some(state)
    }
}

/// Merge work of one write transaction.
///
/// Merges take short merge locks that are released when the transaction
/// finishes. Items already locked by `own` (the transaction's edit session
/// or upload) are merged directly.
pub(crate) struct MergeRun {
    owner: LockOwner,
    own: Option<LockOwner>,
    report: MergeReport,
    published: Arc<Mutex<Option<MergeReport>>>,
}

impl MergeRun {
    /// Starts a run and arranges for its locks to be released and its
    /// report published when the transaction finishes.
    pub(crate) fn start(manager: &Arc<ManagerInner>, writer: &mut Writer, own: Option<LockOwner>) -> Self {
        let owner = LockOwner::Merge(manager.next_sequence());
        let published = Arc::new(Mutex::new(None::<MergeReport>));
        let slot = Arc::clone(&published);
        let manager = Arc::clone(manager);
        writer.on_finish(move |committed| {
            manager.locks.release_owner(owner);
            let report = slot.lock().take();
            if let Some(report) = report.filter(|report| committed && !report.is_empty()) {
                manager.listeners.fire(report);
            }
        });
        Self {
            owner,
            own,
            report: MergeReport::new(),
            published,
        }
    }

    pub(crate) fn record(&mut self, item: ItemId, outcome: MergeOutcome) {
        self.report.record(item, outcome);
    }

    /// Locks and merges one item, or defers it to the current holder.
    ///
    /// A server-side delete of a master also locks its slaves and clears
    /// them with it. A locked slave defers the master's merge.
    pub(crate) fn merge(&mut self, manager: &ManagerInner, writer: &mut Writer, item: ItemId) -> SyncResult<MergeOutcome> {
        let outcome = match self.lock(manager, item, item) {
            Ok(()) => self.merge_locked(manager, writer, item)?,
            Err(outcome) => outcome,
        };
        self.report.record(item, outcome.clone());
        Ok(outcome)
    }

    fn merge_locked(&mut self, manager: &ManagerInner, writer: &mut Writer, item: ItemId) -> SyncResult<MergeOutcome> {
        let deleted_on_server =
            ItemVersion::shadow(&*writer, item, &*DOWNLOAD).is_some_and(|server| server.is_invisible());
        let slaves: Vec<ItemId> = if deleted_on_server {
            subtree::slaves_subtree(&*writer, item)
                .into_iter()
                .filter(|slave| *slave != item)
                .collect()
        } else {
            Vec::new()
        };
        for slave in &slaves {
            if let Err(outcome) = self.lock(manager, *slave, item) {
                debug!(%item, %slave, "slave locked, master merge waits");
                return Ok(outcome);
            }
        }
        let outcome = merge_item(writer, item, &manager.registry)?;
        if outcome == MergeOutcome::Deleted {
            for slave in slaves {
                if writer.is_alive(slave) {
                    writer.clear_item(slave)?;
                }
                self.report.record(slave, MergeOutcome::Deleted);
            }
        }
        Ok(outcome)
    }

    /// Locks `item` for the merge of `merging`, which is `item` itself or
    /// one of its masters.
    fn lock(&self, manager: &ManagerInner, item: ItemId, merging: ItemId) -> Result<(), MergeOutcome> {
        if self.own.is_some() && manager.locks.find_lock(item) == self.own {
            return Ok(());
        }
        let mut attempts = 0;
        loop {
            match manager.locks.try_acquire(&[item], self.owner) {
                Ok(()) => return Ok(()),
                Err((_, LockOwner::Edit(session))) => {
                    if manager.locks.defer_merge_behind(session, item, merging) {
                        debug!(%merging, %session, "merge deferred to edit session");
                        return Err(MergeOutcome::Deferred);
                    }
                    // The session let go between the two calls.
                    attempts += 1;
                    if attempts >= manager.config.merge_lock_attempts {
                        error!(%item, attempts, "could not lock item for merge");
                        return Err(MergeOutcome::Unresolved {
                            reason: format!("{item} stayed locked after {attempts} attempts"),
                        });
                    }
                }
                Err((_, holder)) => {
                    debug!(%item, %holder, "merge deferred to lock holder");
                    return Err(MergeOutcome::Deferred);
                }
            }
        }
    }

    /// Hands the report to the finish callback and returns it.
    pub(crate) fn finish(self) -> MergeReport {
        *self.published.lock() = Some(self.report.clone());
        self.report
    }
}

/// Orchestrates edits, downloads, merges and uploads over an [`ItemStore`].
///
/// # Example
///
/// ```rust,ignore
/// let manager = SyncManager::new(store, registry, SyncConfig::default())?;
/// let session = manager.prepare_edit(&[issue])?;
/// session
///     .commit(move |drain: &mut EditDrain<'_>| -> SyncResult<()> {
///         drain.set_value(issue, &STATUS, Some("done".to_string()))
///     })
///     .wait()?;
/// ```
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<ManagerInner>,
}

impl SyncManager {
    /// Creates a manager and defines the sync attributes in the store.
    ///
    /// # Errors
    ///
    /// Returns a store error if the attributes cannot be defined, for
    /// example because an existing definition clashes.
    pub fn new(store: Arc<ItemStore>, registry: MergeRegistry, config: SyncConfig) -> SyncResult<Self> {
        store
            .write(|writer: &mut Writer| -> SyncResult<()> {
                writer.skip_if_unchanged();
                for key in [
                    BASE.key(),
                    CONFLICT.key(),
                    DOWNLOAD.key(),
                    UPLOADING.key(),
                    DONE_UPLOAD.key(),
                    CHANGE_HISTORY.key(),
                ] {
                    writer.define_attribute(key)?;
                }
                writer.define_attribute(UPLOAD_TASK.key())?;
                writer.define_attribute(DONE_UPLOAD_HISTORY.key())?;
                writer.define_attribute(MASTER_REFERENCE.key())?;
                writer.define_attribute(CONNECTION.key())?;
                writer.define_attribute(INVISIBLE.key())?;
                writer.materialize(&CONNECTION_TYPE)?;
                Ok(())
            })
            .wait()?;
        info!(strategies = registry.len(), "sync manager ready");
        Ok(Self {
            inner: Arc::new(ManagerInner {
                store,
                config,
                locks: LockTable::new(),
                registry,
                connections: RwLock::new(HashMap::new()),
                listeners: MergeListeners::default(),
                active_uploads: Mutex::new(HashSet::new()),
                sequence: AtomicU64::new(1),
            }),
        })
    }

    /// Creates a manager that uses the process-wide registry.
    ///
    /// # Errors
    ///
    /// See [`SyncManager::new`].
    pub fn with_global_registry(store: Arc<ItemStore>, config: SyncConfig) -> SyncResult<Self> {
        let registry = match MergeRegistry::global() {
            Some(registry) => registry.clone(),
            None => {
                warn!("no merge registry installed, local edits will not auto-merge");
                MergeRegistry::empty()
            }
        };
        Self::new(store, registry, config)
    }

    /// The store.
    pub fn store(&self) -> &Arc<ItemStore> {
        &self.inner.store
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// The merge registry.
    pub fn registry(&self) -> &MergeRegistry {
        &self.inner.registry
    }

    /// The lock table.
    pub fn locks(&self) -> &LockTable {
        &self.inner.locks
    }

    /// Registers a connection, replacing one with the same id.
    pub fn add_connection(&self, connection: Arc<dyn Connection>) {
        let id = connection.id().to_string();
        debug!(connection = %id, "connection registered");
        self.inner.connections.write().insert(id, connection);
    }

    /// Removes a connection. Returns false if it was not registered.
    pub fn remove_connection(&self, id: &str) -> bool {
        self.inner.connections.write().remove(id).is_some()
    }

    /// A registered connection.
    pub fn connection(&self, id: &str) -> Option<Arc<dyn Connection>> {
        self.inner.connection(id)
    }

    /// Opens an edit session that locks all `items`, or none of them.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Locked`] if any item is held by another session,
    /// an upload or a merge.
    pub fn prepare_edit(&self, items: &[ItemId]) -> SyncResult<EditSession> {
        let session = SessionId::new();
        if let Err((item, holder)) = self.inner.locks.try_acquire(items, LockOwner::Edit(session)) {
            debug!(%item, %holder, "edit refused, item locked");
            return Err(SyncError::Locked { item, owner: holder });
        }
        debug!(%session, items = items.len(), "edit session opened");
        Ok(EditSession::new(Arc::clone(&self.inner), session, items.to_vec()))
    }

    /// The holder of an item's lock.
    pub fn find_lock(&self, item: ItemId) -> Option<LockOwner> {
        self.inner.locks.find_lock(item)
    }

    /// The first locked item among `items`, with its holder.
    pub fn find_any_lock(&self, items: &[ItemId]) -> Option<(ItemId, LockOwner)> {
        self.inner.locks.find_any_lock(items)
    }

    /// Commits an edit that needs no session. Locked items cannot be
    /// changed by it.
    ///
    /// The handle yields whether the transaction changed anything.
    pub fn commit_edit<C: EditCommit>(&self, commit: C) -> TxHandle<bool, SyncError> {
        self.inner.commit(None, Finisher::default(), commit)
    }

    /// Locks `items` for the duration of one commit.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Locked`] if any item is already locked.
    pub fn commit_edit_items<C: EditCommit>(&self, items: &[ItemId], commit: C) -> SyncResult<TxHandle<bool, SyncError>> {
        let owner = LockOwner::Commit(self.inner.next_sequence());
        if let Err((item, holder)) = self.inner.locks.try_acquire(items, owner) {
            debug!(%item, %holder, "commit refused, item locked");
            return Err(SyncError::Locked { item, owner: holder });
        }
        let manager = Arc::clone(&self.inner);
        let release = Finisher::new(move |committed| {
            let released = manager.locks.release_owner(owner);
            if !committed {
                manager.merge_pending(&released);
            }
        });
        Ok(self.inner.commit(Some(owner), release, commit))
    }

    /// Writes downloaded server data.
    ///
    /// Items with local state or a lock receive the data as a pending
    /// download and are merged in the same transaction, or when their lock
    /// holder lets go.
    pub fn write_downloaded<F>(&self, procedure: F) -> TxHandle<MergeReport, SyncError>
    where
        F: FnOnce(&mut DownloadDrain<'_>) -> SyncResult<()> + Send + 'static,
    {
        let manager = Arc::clone(&self.inner);
        self.inner.store.write(move |writer: &mut Writer| -> SyncResult<MergeReport> {
            writer.skip_if_unchanged();
            let mut run = MergeRun::start(&manager, writer, None);
            let mut drain = DownloadDrain::new(writer, &manager);
            procedure(&mut drain)?;
            drain.finish(&mut run)?;
            Ok(run.finish())
        })
    }

    /// Runs merge resolution again for items with a pending download, for
    /// example after a strategy was added.
    pub fn request_auto_merge(&self, items: &[ItemId]) -> TxHandle<MergeReport, SyncError> {
        self.inner.request_auto_merge(items.to_vec())
    }

    /// Returns true if the item may be uploaded now.
    pub fn can_upload(&self, item: ItemId) -> bool {
        self.check_upload(item).is_ok()
    }

    /// Returns true if every item may be uploaded now.
    pub fn can_upload_all(&self, items: &[ItemId]) -> bool {
        let snapshot = self.inner.store.snapshot();
        items
            .iter()
            .all(|item| self.inner.check_upload(&snapshot, *item).is_ok())
    }

    /// Explains why an item may not be uploaded.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Locked`], [`SyncError::UploadNotAllowed`],
    /// [`SyncError::UnknownConnection`] or [`SyncError::CannotPerform`].
    pub fn check_upload(&self, item: ItemId) -> SyncResult<()> {
        self.inner.check_upload(&self.inner.store.snapshot(), item)
    }

    /// Runs one blocking upload pass.
    ///
    /// # Errors
    ///
    /// Returns the uploader's error, [`SyncError::Interrupted`] if
    /// `interrupt` was raised before the items were sent, or a store error.
    /// Upload markers and locks are cleaned up in every case.
    pub fn sync_upload(&self, uploader: &mut dyn ItemUploader, interrupt: &InterruptFlag) -> SyncResult<UploadReport> {
        self.inner.sync_upload(uploader, interrupt)
    }

    /// Settles an upload that a crash left unconfirmed. `uploaded` is the
    /// server version if the server received the upload, or `None` if it
    /// did not.
    pub fn resolve_interrupted_upload(&self, item: ItemId, uploaded: Option<AttrMap>) -> TxHandle<MergeOutcome, SyncError> {
        self.inner.resolve_interrupted_upload(item, uploaded)
    }

    /// Submits a read with a scheduling priority.
    pub fn enquire_read<T, F>(&self, priority: Priority, procedure: F) -> TxHandle<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&Snapshot) -> SyncResult<T> + Send + 'static,
    {
        self.inner.store.enquire_read(priority, procedure)
    }

    /// The item's state at the latest snapshot, or `None` if it does not
    /// exist.
    pub fn sync_state(&self, item: ItemId) -> Option<SyncState> {
        self.inner.sync_state(&self.inner.store.snapshot(), item)
    }

    /// Items with local changes, unconfirmed uploads, conflicts or
    /// pending downloads, ascending.
    pub fn pending_items(&self) -> Vec<(ItemId, SyncState)> {
        let snapshot = self.inner.store.snapshot();
        let mut pending = Vec::new();
        snapshot.for_each_item(&mut |item, row| {
            if [BASE.id(), CONFLICT.id(), DOWNLOAD.id(), UPLOAD_TASK.id()]
                .iter()
                .any(|id| row.contains_key(*id))
            {
                pending.push(item);
            }
        });
        pending.sort_unstable();
        pending
            .into_iter()
            .filter_map(|item| self.inner.sync_state(&snapshot, item).map(|state| (item, state)))
            .collect()
    }

    /// Calls `callback` with the report of every committed transaction
    /// that merged, deferred or wrote downloaded items.
    pub fn add_merge_listener(
        &self,
        lifetime: &Lifetime,
        gate: Arc<dyn Gate>,
        callback: impl Fn(&MergeReport) + Send + Sync + 'static,
    ) {
        self.inner.listeners.add(lifetime, gate, Arc::new(callback));
    }

    /// Calls `callback` whenever locks change.
    pub fn add_lock_listener(&self, lifetime: &Lifetime, gate: Arc<dyn Gate>, callback: impl Fn() + Send + Sync + 'static) {
        self.inner.locks.add_listener(lifetime, gate, callback);
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("locks", &self.inner.locks.len())
            .field("strategies", &self.inner.registry.len())
            .field("connections", &self.inner.connections.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::BASE;
    use crate::testing::{
        download_issue, edit_summary, manager, manager_with, status, summary, tag_set, tags,
    };
    use crate::{DownloadDrain, EditDrain};
    use itemdb_core::TxStatus;
    use std::sync::mpsc;
    use std::time::Duration;

    fn download_tags(manager: &SyncManager, item: ItemId, values: &[&str]) -> MergeReport {
        let values = tag_set(values);
        manager
            .write_downloaded(move |drain: &mut DownloadDrain<'_>| -> SyncResult<()> {
                drain.set_value(item, &tags(), Some(values))
            })
            .wait()
            .unwrap()
    }

    #[test]
    fn edits_record_a_base_and_reverting_synchronizes() {
        let manager = manager();
        let item = download_issue(&manager, "crash", &["b"]);
        assert_eq!(manager.sync_state(item), Some(SyncState::Synchronized));

        edit_summary(&manager, item, "crash on start");
        assert_eq!(manager.sync_state(item), Some(SyncState::Edited));
        let base = manager.store().snapshot().get(item, &*BASE).unwrap();
        assert_eq!(base.len(), 2);

        edit_summary(&manager, item, "crash");
        assert_eq!(manager.sync_state(item), Some(SyncState::Synchronized));
        assert_eq!(manager.store().snapshot().get(item, &*BASE), None);
    }

    #[test]
    fn commit_without_changes_is_skipped() {
        let manager = manager();
        let item = download_issue(&manager, "crash", &[]);
        let before = manager.store().last_icn();
        let changed = manager
            .commit_edit(move |drain: &mut EditDrain<'_>| -> SyncResult<()> {
                drain.set_value(item, &summary(), Some("crash".to_string()))
            })
            .wait()
            .unwrap();
        assert!(!changed);
        assert_eq!(manager.store().last_icn(), before);
    }

    #[test]
    fn cancelled_commit_leaves_no_trace() {
        let manager = manager();
        let item = download_issue(&manager, "crash", &[]);
        let before = manager.store().last_icn();
        let handle = manager.commit_edit(move |drain: &mut EditDrain<'_>| -> SyncResult<()> {
            drain.set_value(item, &status(), Some("done".to_string()))?;
            Err(SyncError::Cancelled)
        });
        assert_eq!(handle.wait_status(), TxStatus::Cancelled);
        assert!(matches!(handle.wait(), Err(SyncError::Cancelled)));

        let snapshot = manager.store().snapshot();
        assert_eq!(snapshot.get(item, &status()), None);
        assert_eq!(manager.store().last_icn(), before);
        assert_eq!(manager.sync_state(item), Some(SyncState::Synchronized));
    }

    struct Reporting {
        item: ItemId,
        finished: mpsc::Sender<bool>,
    }

    impl EditCommit for Reporting {
        fn perform_commit(&mut self, drain: &mut EditDrain<'_>) -> SyncResult<()> {
            drain.set_value(self.item, &status(), Some("done".to_string()))
        }

        fn on_commit_finished(&mut self, success: bool) {
            let _ = self.finished.send(success);
        }
    }

    #[test]
    fn commit_callback_sees_the_outcome() {
        let manager = manager();
        let item = download_issue(&manager, "crash", &[]);
        let (tx, rx) = mpsc::channel();
        manager
            .commit_edit(Reporting { item, finished: tx })
            .wait()
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));
    }

    #[test]
    fn edits_of_locked_items_are_refused() {
        let manager = manager();
        let item = download_issue(&manager, "crash", &[]);
        let session = manager.prepare_edit(&[item]).unwrap();

        let err = manager.prepare_edit(&[item]).unwrap_err();
        assert!(matches!(err, SyncError::Locked { owner, .. } if owner == session.owner()));
        let err = manager
            .commit_edit(move |drain: &mut EditDrain<'_>| -> SyncResult<()> {
                drain.set_value(item, &summary(), Some("other".to_string()))
            })
            .wait()
            .unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err, SyncError::Locked { .. }));

        session.discard();
        assert_eq!(manager.find_lock(item), None);
        assert!(manager.prepare_edit(&[item]).is_ok());
    }

    #[test]
    fn download_into_an_edited_item_merges() {
        let manager = manager();
        let item = download_issue(&manager, "crash", &["b"]);
        manager
            .commit_edit(move |drain: &mut EditDrain<'_>| -> SyncResult<()> {
                drain.set_value(item, &tags(), Some(tag_set(&["a", "b"])))
            })
            .wait()
            .unwrap();

        let report = download_tags(&manager, item, &["b", "c"]);
        assert_eq!(report.outcome(item), Some(&MergeOutcome::Edited));
        let snapshot = manager.store().snapshot();
        assert_eq!(snapshot.get(item, &tags()), Some(tag_set(&["a", "b", "c"])));
        assert_eq!(manager.sync_state(item), Some(SyncState::Edited));
        assert_eq!(manager.find_lock(item), None);
    }

    #[test]
    fn downloads_for_unedited_items_go_straight_to_trunk() {
        let manager = manager();
        let item = download_issue(&manager, "crash", &["b"]);
        let report = download_tags(&manager, item, &["c"]);
        assert_eq!(report.outcome(item), Some(&MergeOutcome::Synchronized));
        assert_eq!(manager.store().snapshot().get(item, &tags()), Some(tag_set(&["c"])));

        let report = manager
            .write_downloaded(move |drain: &mut DownloadDrain<'_>| -> SyncResult<()> { drain.delete_item(item) })
            .wait()
            .unwrap();
        assert_eq!(report.outcome(item), Some(&MergeOutcome::Deleted));
        assert!(!manager.store().snapshot().is_alive(item));
    }

    #[test]
    fn download_for_a_session_item_waits_for_the_commit() {
        let manager = manager();
        let item = download_issue(&manager, "crash", &["b"]);
        let session = manager.prepare_edit(&[item]).unwrap();

        let report = download_tags(&manager, item, &["b", "c"]);
        assert_eq!(report.deferred(), vec![item]);
        assert_eq!(manager.sync_state(item), Some(SyncState::DownloadPending));
        assert_eq!(manager.store().snapshot().get(item, &tags()), Some(tag_set(&["b"])));

        session
            .commit(move |drain: &mut EditDrain<'_>| -> SyncResult<()> {
                drain.set_value(item, &summary(), Some("crash on start".to_string()))
            })
            .wait()
            .unwrap();
        let snapshot = manager.store().snapshot();
        assert_eq!(snapshot.get(item, &tags()), Some(tag_set(&["b", "c"])));
        assert_eq!(snapshot.get(item, &summary()).as_deref(), Some("crash on start"));
        assert_eq!(manager.sync_state(item), Some(SyncState::Edited));
        assert_eq!(manager.find_lock(item), None);
    }

    #[test]
    fn discarding_a_session_merges_deferred_downloads() {
        let manager = manager();
        let item = download_issue(&manager, "crash", &["b"]);
        let session = manager.prepare_edit(&[item]).unwrap();
        download_tags(&manager, item, &["c"]);
        assert_eq!(manager.sync_state(item), Some(SyncState::DownloadPending));

        session.discard();
        // Writes run in submission order, so this one follows the merge.
        manager
            .commit_edit(|_: &mut EditDrain<'_>| -> SyncResult<()> { Ok(()) })
            .wait()
            .unwrap();
        assert_eq!(manager.sync_state(item), Some(SyncState::Synchronized));
        assert_eq!(manager.store().snapshot().get(item, &tags()), Some(tag_set(&["c"])));
    }

    #[test]
    fn missing_strategy_leaves_every_item_unresolved() {
        let manager = manager_with(MergeRegistry::empty(), SyncConfig::default());
        let first = download_issue(&manager, "first", &["b"]);
        let second = download_issue(&manager, "second", &["b"]);
        edit_summary(&manager, first, "first, edited");
        edit_summary(&manager, second, "second, edited");
        let bases: Vec<_> = [first, second]
            .iter()
            .map(|item| manager.store().snapshot().get(*item, &*BASE))
            .collect();

        let report = manager
            .write_downloaded(move |drain: &mut DownloadDrain<'_>| -> SyncResult<()> {
                drain.set_value(first, &tags(), Some(tag_set(&["c"])))?;
                drain.set_value(second, &tags(), Some(tag_set(&["c"])))
            })
            .wait()
            .unwrap();
        assert_eq!(report.unresolved(), vec![first, second]);

        let snapshot = manager.store().snapshot();
        for (item, base) in [first, second].iter().zip(bases) {
            assert_eq!(snapshot.get(*item, &*BASE), base);
            assert!(snapshot.get(*item, &*DOWNLOAD).is_some());
            assert_eq!(manager.sync_state(*item), Some(SyncState::DownloadPending));
            assert!(!manager.can_upload(*item));
            assert!(matches!(
                manager.check_upload(*item),
                Err(SyncError::UploadNotAllowed { .. })
            ));
        }
    }

    #[test]
    fn merge_listeners_receive_reports() {
        let manager = manager();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let lifetime = Lifetime::new();
        manager.add_merge_listener(&lifetime, straight(), move |report: &MergeReport| {
            let _ = tx.lock().send(report.len());
        });

        let item = download_issue(&manager, "crash", &["b"]);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(1));

        lifetime.end();
        download_tags(&manager, item, &["c"]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn commit_of_listed_items_holds_their_locks() {
        let manager = manager();
        let item = download_issue(&manager, "crash", &[]);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handle = manager
            .commit_edit_items(&[item], move |drain: &mut EditDrain<'_>| -> SyncResult<()> {
                let _ = tx.lock().send(());
                drain.set_value(item, &status(), Some("done".to_string()))
            })
            .unwrap();
        assert!(handle.wait().unwrap());
        assert_eq!(rx.try_recv(), Ok(()));
        assert_eq!(manager.find_lock(item), None);

        let session = manager.prepare_edit(&[item]).unwrap();
        let err = manager
            .commit_edit_items(&[item], |_: &mut EditDrain<'_>| -> SyncResult<()> { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, SyncError::Locked { .. }));
        drop(session);
        assert_eq!(manager.find_lock(item), None);
    }

    #[test]
    fn pending_items_lists_local_state() {
        let manager = manager();
        let clean = download_issue(&manager, "clean", &[]);
        let edited = download_issue(&manager, "edited", &[]);
        edit_summary(&manager, edited, "edited locally");
        let pending = manager.pending_items();
        assert_eq!(pending, vec![(edited, SyncState::Edited)]);
        assert!(!pending.iter().any(|(item, _)| *item == clean));
    }
}
