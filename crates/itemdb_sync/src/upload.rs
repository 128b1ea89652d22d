//! Upload pipeline.
//!
//! An upload pass has three steps:
//!
//! 1. **Prepare**: the [`ItemUploader`] picks items against a snapshot.
//!    Each pick checks eligibility and takes the item's upload lock.
//! 2. **Mark**: [`UPLOAD_TASK`] and [`UPLOADING`] are written, so a crash
//!    during remote I/O leaves the items `UploadUnconfirmed` instead of
//!    silently re-uploadable.
//! 3. **Upload and finish**: the uploader talks to the server; confirmed
//!    items advance their base to the returned server version, failed ones
//!    drop their markers. Items the server accepted without returning its
//!    version keep the sent version in [`DONE_UPLOAD`] until a download
//!    brings the server version.

use crate::error::{SyncError, SyncResult};
use crate::history::{self, HistoryRecord};
use crate::lock::LockOwner;
use crate::manager::{ManagerInner, MergeRun};
use crate::merge::{self, MergeOutcome};
use crate::schema::{self, BASE, DONE_UPLOAD, DONE_UPLOAD_HISTORY, DOWNLOAD, UPLOADING, UPLOAD_TASK};
use crate::state::SyncState;
use crate::version::ItemVersion;
use itemdb_core::{AttrMap, ItemId, Reader, Snapshot, TxHandle, Writer};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cooperative interruption of an upload pass.
///
/// Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    /// A flag that is not raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag.
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once raised.
    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fails with [`SyncError::Interrupted`] once raised.
    ///
    /// # Errors
    ///
    /// See above.
    pub fn check(&self) -> SyncResult<()> {
        if self.is_interrupted() {
            Err(SyncError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// One item to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadItem {
    /// The item.
    pub item: ItemId,
    /// Its connection, if it has one.
    pub connection: Option<String>,
    /// The local version to send.
    pub values: AttrMap,
    /// The server version the local edit started from.
    pub base: AttrMap,
    /// Edit steps to replay on the server, oldest first.
    pub history: Vec<HistoryRecord>,
}

impl UploadItem {
    /// Returns true if the item was never uploaded.
    pub fn is_new(&self) -> bool {
        ItemVersion::from_values(self.item, self.base.clone()).is_invisible()
    }

    /// Returns true if the upload deletes the item on the server.
    pub fn is_delete(&self) -> bool {
        ItemVersion::from_values(self.item, self.values.clone()).is_invisible()
    }
}

/// Server answer for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadResult {
    /// The server accepted the item and now holds `server`.
    Uploaded {
        /// The item.
        item: ItemId,
        /// The server version after the upload.
        server: AttrMap,
    },
    /// The server accepted the item but did not send its new version. The
    /// upload finishes when a download brings that version.
    Done {
        /// The item.
        item: ItemId,
    },
    /// The server rejected the item.
    Failed {
        /// The item.
        item: ItemId,
        /// Why.
        reason: String,
    },
}

impl UploadResult {
    /// The item this result is about.
    pub fn item(&self) -> ItemId {
        match self {
            UploadResult::Uploaded { item, .. } | UploadResult::Done { item } | UploadResult::Failed { item, .. } => {
                *item
            }
        }
    }
}

/// Per-item results of an upload pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Confirmed items and what became of them.
    pub uploaded: BTreeMap<ItemId, MergeOutcome>,
    /// Items that were not uploaded, with the reason.
    pub failed: BTreeMap<ItemId, String>,
}

impl UploadReport {
    /// Returns true if no item was attempted.
    pub fn is_empty(&self) -> bool {
        self.uploaded.is_empty() && self.failed.is_empty()
    }
}

/// Remote side of an upload pass.
pub trait ItemUploader {
    /// Selects the items to upload.
    ///
    /// # Errors
    ///
    /// Any error ends the pass before anything is sent.
    fn prepare(&mut self, prepare: &mut UploadPrepare<'_>) -> SyncResult<()>;

    /// Sends the items and reports a result per item. Items missing from
    /// the result count as failed. Long uploads should poll `interrupt`.
    ///
    /// # Errors
    ///
    /// An error means no item reached the server.
    fn upload(&mut self, items: &[UploadItem], interrupt: &InterruptFlag) -> SyncResult<Vec<UploadResult>>;
}

/// Item selection for an upload pass.
pub struct UploadPrepare<'a> {
    manager: &'a ManagerInner,
    snapshot: &'a Snapshot,
    owner: LockOwner,
    items: Vec<UploadItem>,
}

impl<'a> UploadPrepare<'a> {
    fn new(manager: &'a ManagerInner, snapshot: &'a Snapshot, owner: LockOwner) -> Self {
        Self {
            manager,
            snapshot,
            owner,
            items: Vec::new(),
        }
    }

    /// The snapshot items are selected from.
    pub fn snapshot(&self) -> &Snapshot {
        self.snapshot
    }

    /// Adds an item: checks that it may be uploaded and locks it.
    ///
    /// # Errors
    ///
    /// Returns the reason the item may not be uploaded; the pass itself
    /// goes on if the uploader ignores the error.
    pub fn add_item(&mut self, item: ItemId) -> SyncResult<()> {
        if self.items.iter().any(|upload| upload.item == item) {
            return Ok(());
        }
        self.manager.check_upload(self.snapshot, item)?;
        let (Some(trunk), Some(base)) = (
            ItemVersion::trunk(self.snapshot, item),
            ItemVersion::server(self.snapshot, item),
        ) else {
            return Err(SyncError::cannot_perform(format!("{item} does not exist")));
        };
        if let Err((item, holder)) = self.manager.locks.try_acquire(&[item], self.owner) {
            return Err(SyncError::Locked { item, owner: holder });
        }
        self.items.push(UploadItem {
            item,
            connection: schema::connection_id(self.snapshot, item),
            values: trunk.into_values(),
            base: base.into_values(),
            history: history::read_history(self.snapshot, item),
        });
        Ok(())
    }

    /// Adds every item with local changes that may be uploaded now.
    /// Returns how many were added.
    pub fn add_pending(&mut self) -> usize {
        let mut candidates = Vec::new();
        self.snapshot.for_each_item(&mut |item, row| {
            if row.contains_key(BASE.id()) {
                candidates.push(item);
            }
        });
        candidates.sort_unstable();
        let before = self.items.len();
        for item in candidates {
            if let Err(e) = self.add_item(item) {
                debug!(%item, reason = %e, "not uploading");
            }
        }
        self.items.len() - before
    }

    /// The items selected so far.
    pub fn items(&self) -> &[UploadItem] {
        &self.items
    }
}

impl ManagerInner {
    /// Explains why an item may not be uploaded.
    pub(crate) fn check_upload(&self, snapshot: &Snapshot, item: ItemId) -> SyncResult<()> {
        let Some(state) = self.sync_state(snapshot, item) else {
            return Err(SyncError::cannot_perform(format!("{item} does not exist")));
        };
        match state {
            SyncState::New | SyncState::Edited | SyncState::LocalDelete => {}
            other => return Err(SyncError::upload_not_allowed(item, format!("item is {other}"))),
        }
        if snapshot.get(item, &*DOWNLOAD).is_some() {
            return Err(SyncError::upload_not_allowed(item, "server version not merged yet"));
        }
        if snapshot.get(item, &*DONE_UPLOAD).is_some() {
            return Err(SyncError::upload_not_allowed(item, "last upload awaits the server version"));
        }
        if let Some(holder) = self.locks.find_lock(item) {
            return Err(SyncError::Locked { item, owner: holder });
        }
        if let Some(id) = schema::connection_id(snapshot, item) {
            let Some(connection) = self.connection(&id) else {
                return Err(SyncError::UnknownConnection { id });
            };
            let state = connection.state();
            if self.config.require_ready_connection && !state.is_ready() {
                return Err(SyncError::upload_not_allowed(item, format!("connection {id} is {state}")));
            }
            if !connection.is_upload_allowed(snapshot, item) {
                return Err(SyncError::upload_not_allowed(item, format!("refused by connection {id}")));
            }
        }
        Ok(())
    }

    pub(crate) fn sync_upload(
        self: &Arc<Self>,
        uploader: &mut dyn ItemUploader,
        interrupt: &InterruptFlag,
    ) -> SyncResult<UploadReport> {
        let task = Uuid::new_v4();
        self.active_uploads.lock().insert(task.to_string());
        let outcome = self.run_upload(task, uploader, interrupt);
        let released = self.locks.release_owner(LockOwner::Upload(task));
        self.active_uploads.lock().remove(&task.to_string());
        self.merge_pending(&released);
        match &outcome {
            Ok(report) => info!(
                %task,
                uploaded = report.uploaded.len(),
                failed = report.failed.len(),
                "upload pass finished"
            ),
            Err(e) => warn!(%task, error = %e, "upload pass failed"),
        }
        outcome
    }

    fn run_upload(
        self: &Arc<Self>,
        task: Uuid,
        uploader: &mut dyn ItemUploader,
        interrupt: &InterruptFlag,
    ) -> SyncResult<UploadReport> {
        let owner = LockOwner::Upload(task);
        let snapshot = self.store.snapshot();
        let selected = {
            let mut prepare = UploadPrepare::new(self, &snapshot, owner);
            uploader.prepare(&mut prepare)?;
            prepare.items
        };
        if selected.is_empty() {
            return Ok(UploadReport::default());
        }
        interrupt.check()?;

        let marker = task.to_string();
        let (sent, stale) = self
            .store
            .write(move |writer: &mut Writer| -> SyncResult<(Vec<UploadItem>, Vec<ItemId>)> {
                let mut sent = Vec::new();
                let mut stale = Vec::new();
                for upload in selected {
                    let current = ItemVersion::trunk(&*writer, upload.item);
                    if current.as_ref().map(ItemVersion::values) != Some(&upload.values)
                        || history::read_history(&*writer, upload.item) != upload.history
                    {
                        stale.push(upload.item);
                        continue;
                    }
                    writer.set_value(upload.item, &*UPLOAD_TASK, Some(marker.clone()))?;
                    writer.set_value(upload.item, &*UPLOADING, Some(upload.values.clone()))?;
                    if !upload.history.is_empty() {
                        let steps = i64::try_from(upload.history.len()).unwrap_or(i64::MAX);
                        writer.set_value(upload.item, &*DONE_UPLOAD_HISTORY, Some(steps))?;
                    }
                    sent.push(upload);
                }
                Ok((sent, stale))
            })
            .wait()?;
        self.locks.release(&stale, owner);
        let mut report = UploadReport::default();
        for item in stale {
            report.failed.insert(item, "changed while the upload was prepared".to_string());
        }
        if sent.is_empty() {
            return Ok(report);
        }
        debug!(%task, items = sent.len(), "upload marked");

        let results = match interrupt.check().and_then(|()| uploader.upload(&sent, interrupt)) {
            Ok(results) => results,
            Err(e) => {
                warn!(%task, error = %e, "upload interrupted, removing markers");
                let reason = e.to_string();
                if let Err(rollback) = self.finish_upload(task, sent, Vec::new(), reason).wait() {
                    warn!(%task, error = %rollback, "could not remove upload markers");
                }
                return Err(e);
            }
        };

        let finished = self
            .finish_upload(task, sent, results, "no result from uploader".to_string())
            .wait()?;
        report.uploaded.extend(finished.uploaded);
        report.failed.extend(finished.failed);
        Ok(report)
    }

    /// Applies the server's answers. Items without an answer are treated as
    /// failed with `missing`.
    fn finish_upload(
        self: &Arc<Self>,
        task: Uuid,
        sent: Vec<UploadItem>,
        results: Vec<UploadResult>,
        missing: String,
    ) -> TxHandle<UploadReport, SyncError> {
        let manager = Arc::clone(self);
        let owner = LockOwner::Upload(task);
        let task = task.to_string();
        self.store.write(move |writer: &mut Writer| -> SyncResult<UploadReport> {
            let mut run = MergeRun::start(&manager, writer, Some(owner));
            let mut answers: BTreeMap<ItemId, UploadResult> =
                results.into_iter().map(|result| (result.item(), result)).collect();
            let mut report = UploadReport::default();
            for upload in sent {
                let item = upload.item;
                match answers.remove(&item) {
                    Some(UploadResult::Uploaded { server, .. }) => {
                        let outcome = manager.confirm_upload(writer, &mut run, item, &task, server)?;
                        report.uploaded.insert(item, outcome);
                    }
                    Some(UploadResult::Done { .. }) => {
                        let outcome = manager.accept_upload(writer, &mut run, item, &task)?;
                        report.uploaded.insert(item, outcome);
                    }
                    Some(UploadResult::Failed { reason, .. }) => {
                        debug!(%item, %reason, "upload rejected");
                        manager.abandon_upload(writer, &mut run, item, &task)?;
                        report.failed.insert(item, reason);
                    }
                    None => {
                        manager.abandon_upload(writer, &mut run, item, &task)?;
                        report.failed.insert(item, missing.clone());
                    }
                }
            }
            for item in answers.keys() {
                warn!(%item, "uploader answered for an item it was not given");
            }
            run.finish();
            Ok(report)
        })
    }

    /// Installs the server's version of an uploaded item.
    fn confirm_upload(
        &self,
        writer: &mut Writer,
        run: &mut MergeRun,
        item: ItemId,
        task: &str,
        server: AttrMap,
    ) -> SyncResult<MergeOutcome> {
        if writer.get(item, &*UPLOAD_TASK).as_deref() != Some(task) {
            warn!(%item, %task, "upload marker changed, ignoring confirmation");
            return Ok(merge::settled(&*writer, item));
        }
        let sent = ItemVersion::shadow(&*writer, item, &*UPLOADING);
        writer.clear_value(item, &*UPLOAD_TASK)?;
        writer.clear_value(item, &*UPLOADING)?;
        if !merge::finish_upload(writer, item, sent, ItemVersion::from_values(item, server))? {
            debug!(%item, "delete uploaded");
            return Ok(MergeOutcome::Deleted);
        }
        if writer.get(item, &*DOWNLOAD).is_some() {
            return run.merge(self, writer, item);
        }
        merge::normalize(writer, item)?;
        let outcome = merge::settled(&*writer, item);
        debug!(%item, ?outcome, "upload confirmed");
        Ok(outcome)
    }

    /// Records an upload the server accepted without its new version.
    fn accept_upload(&self, writer: &mut Writer, run: &mut MergeRun, item: ItemId, task: &str) -> SyncResult<MergeOutcome> {
        if writer.get(item, &*UPLOAD_TASK).as_deref() != Some(task) {
            warn!(%item, %task, "upload marker changed, ignoring confirmation");
            return Ok(merge::settled(&*writer, item));
        }
        let sent = writer.get(item, &*UPLOADING).unwrap_or_default();
        writer.clear_value(item, &*UPLOAD_TASK)?;
        writer.clear_value(item, &*UPLOADING)?;
        writer.set_value(item, &*DONE_UPLOAD, Some(sent))?;
        if writer.get(item, &*DOWNLOAD).is_some() {
            return run.merge(self, writer, item);
        }
        debug!(%item, "upload accepted, waiting for the server version");
        Ok(merge::settled(&*writer, item))
    }

    /// Drops the upload markers of an item that was not uploaded.
    fn abandon_upload(&self, writer: &mut Writer, run: &mut MergeRun, item: ItemId, task: &str) -> SyncResult<()> {
        if writer.get(item, &*UPLOAD_TASK).as_deref() == Some(task) {
            writer.clear_value(item, &*UPLOAD_TASK)?;
            writer.clear_value(item, &*UPLOADING)?;
            writer.clear_value(item, &*DONE_UPLOAD_HISTORY)?;
        }
        if writer.get(item, &*DOWNLOAD).is_some() {
            run.merge(self, writer, item)?;
        }
        Ok(())
    }

    pub(crate) fn resolve_interrupted_upload(
        self: &Arc<Self>,
        item: ItemId,
        uploaded: Option<AttrMap>,
    ) -> TxHandle<MergeOutcome, SyncError> {
        let manager = Arc::clone(self);
        self.store.write(move |writer: &mut Writer| -> SyncResult<MergeOutcome> {
            let Some(task) = writer.get(item, &*UPLOAD_TASK) else {
                return Err(SyncError::cannot_perform(format!("{item} has no unconfirmed upload")));
            };
            if manager.active_uploads.lock().contains(&task) {
                return Err(SyncError::cannot_perform(format!("upload of {item} is still running")));
            }
            if let Some(holder) = manager.locks.find_lock(item) {
                return Err(SyncError::Locked { item, owner: holder });
            }
            let mut run = MergeRun::start(&manager, writer, None);
            let outcome = match uploaded {
                Some(server) => manager.confirm_upload(writer, &mut run, item, &task, server)?,
                None => {
                    manager.abandon_upload(writer, &mut run, item, &task)?;
                    merge::settled(&*writer, item)
                }
            };
            info!(%item, ?outcome, "unconfirmed upload resolved");
            run.record(item, outcome.clone());
            run.finish();
            Ok(outcome)
        })
    }
}
