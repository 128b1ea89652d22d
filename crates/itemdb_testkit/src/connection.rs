//! A scriptable remote side: connection and uploader.

use itemdb_core::{AttrMap, ItemId, Snapshot};
use itemdb_sync::{
    Connection, ConnectionState, InterruptFlag, ItemUploader, SyncError, SyncResult, UploadItem, UploadPrepare,
    UploadResult,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A connection whose state and upload policy tests control.
pub struct StubConnection {
    id: String,
    state: Mutex<ConnectionState>,
    refused: Mutex<BTreeSet<ItemId>>,
}

impl StubConnection {
    /// A ready connection.
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            state: Mutex::new(ConnectionState::Ready),
            refused: Mutex::new(BTreeSet::new()),
        })
    }

    /// Changes the state.
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Refuses uploads of `item`.
    pub fn refuse(&self, item: ItemId) {
        self.refused.lock().insert(item);
    }
}

impl Connection for StubConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn is_upload_allowed(&self, _snapshot: &Snapshot, item: ItemId) -> bool {
        !self.refused.lock().contains(&item)
    }
}

/// What a [`StubUploader`] does with the next upload.
#[derive(Debug, Clone, Default)]
pub enum UploadBehavior {
    /// The server takes every item as sent.
    #[default]
    Accept,
    /// The server rejects these items and takes the rest.
    Reject(BTreeSet<ItemId>),
    /// The server takes every item but sends no version back.
    Acknowledge,
    /// The server answers for none of the items.
    Silent,
    /// The request fails before any item reaches the server.
    Fail(String),
    /// The flag is raised while the request is in flight.
    Interrupt,
}

/// An uploader that selects every pending item and answers as scripted.
///
/// Server-side changes can be injected per item; they are applied on top of
/// the uploaded values, as a server that fills in fields would.
#[derive(Default)]
pub struct StubUploader {
    behavior: UploadBehavior,
    only: Option<Vec<ItemId>>,
    server_changes: BTreeMap<ItemId, AttrMap>,
    batches: Vec<Vec<UploadItem>>,
    during_upload: Option<Box<dyn FnOnce() + Send>>,
}

impl StubUploader {
    /// Accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the behavior for the following uploads.
    pub fn with_behavior(mut self, behavior: UploadBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Uploads only these items instead of everything pending.
    pub fn only(mut self, items: &[ItemId]) -> Self {
        self.only = Some(items.to_vec());
        self
    }

    /// Merges `values` into what the server returns for `item`.
    pub fn with_server_change(mut self, item: ItemId, values: AttrMap) -> Self {
        self.server_changes.insert(item, values);
        self
    }

    /// Runs `action` once, while the next request is in flight.
    pub fn during_upload(mut self, action: impl FnOnce() + Send + 'static) -> Self {
        self.during_upload = Some(Box::new(action));
        self
    }

    /// Every batch sent so far.
    pub fn batches(&self) -> &[Vec<UploadItem>] {
        &self.batches
    }

    /// Items sent so far, in order.
    pub fn sent_items(&self) -> Vec<ItemId> {
        self.batches.iter().flatten().map(|upload| upload.item).collect()
    }
}

impl ItemUploader for StubUploader {
    fn prepare(&mut self, prepare: &mut UploadPrepare<'_>) -> SyncResult<()> {
        match &self.only {
            Some(items) => {
                for item in items {
                    // Ineligible items are simply left out.
                    let _ = prepare.add_item(*item);
                }
            }
            None => {
                prepare.add_pending();
            }
        }
        Ok(())
    }

    fn upload(&mut self, items: &[UploadItem], interrupt: &InterruptFlag) -> SyncResult<Vec<UploadResult>> {
        if let Some(action) = self.during_upload.take() {
            action();
        }
        if let UploadBehavior::Interrupt = self.behavior {
            interrupt.interrupt();
        }
        interrupt.check()?;
        if let UploadBehavior::Fail(reason) = &self.behavior {
            return Err(SyncError::cannot_perform(reason.clone()));
        }
        self.batches.push(items.to_vec());
        if let UploadBehavior::Silent = self.behavior {
            return Ok(Vec::new());
        }
        Ok(items
            .iter()
            .map(|upload| match &self.behavior {
                UploadBehavior::Reject(rejected) if rejected.contains(&upload.item) => UploadResult::Failed {
                    item: upload.item,
                    reason: "rejected by server".to_string(),
                },
                UploadBehavior::Acknowledge => UploadResult::Done { item: upload.item },
                _ => {
                    let mut server = upload.values.clone();
                    if let Some(changes) = self.server_changes.get(&upload.item) {
                        server.extend(changes.iter().map(|(id, value)| (Arc::clone(id), value.clone())));
                    }
                    UploadResult::Uploaded {
                        item: upload.item,
                        server,
                    }
                }
            })
            .collect())
    }
}
