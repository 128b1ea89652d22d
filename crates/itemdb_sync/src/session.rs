//! Edit sessions.

use crate::drain::EditCommit;
use crate::error::{SyncError, SyncResult};
use crate::lock::{LockOwner, SessionId};
use crate::manager::{Finisher, ManagerInner};
use itemdb_core::{ItemId, TxHandle, Writer};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

struct SessionInner {
    id: SessionId,
    manager: Arc<ManagerInner>,
    items: Mutex<Vec<ItemId>>,
    /// Set by commit or discard.
    closed: AtomicBool,
    /// Set once the locks are gone.
    released: AtomicBool,
}

impl SessionInner {
    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let (released, deferred) = self.manager.locks.release_session(self.id);
        debug!(
            session = %self.id,
            items = released.len(),
            deferred = deferred.len(),
            "edit session released"
        );
        if !deferred.is_empty() {
            let _ = self.manager.request_auto_merge(deferred.into_iter().collect());
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Exclusive edit access to a set of items.
///
/// While the session is open, uploads and merges leave its items alone;
/// downloads for them wait in the download shadow and are merged when the
/// session is released. Dropping the last clone releases the session.
#[derive(Clone)]
pub struct EditSession {
    inner: Arc<SessionInner>,
}

impl EditSession {
    pub(crate) fn new(manager: Arc<ManagerInner>, id: SessionId, items: Vec<ItemId>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                manager,
                items: Mutex::new(items),
                closed: AtomicBool::new(false),
                released: AtomicBool::new(false),
            }),
        }
    }

    /// The session's identity.
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// The lock owner the session holds its items as.
    pub fn owner(&self) -> LockOwner {
        LockOwner::Edit(self.inner.id)
    }

    /// The locked items, in the order they were added.
    pub fn items(&self) -> Vec<ItemId> {
        self.inner.items.lock().clone()
    }

    /// Returns true once committed or discarded.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Locks more items, all or none.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SessionReleased`] for a closed session and
    /// [`SyncError::Locked`] if an item is held by someone else.
    pub fn include(&self, items: &[ItemId]) -> SyncResult<()> {
        if self.is_closed() {
            return Err(SyncError::SessionReleased);
        }
        if let Err((item, holder)) = self.inner.manager.locks.try_acquire(items, self.owner()) {
            debug!(%item, %holder, "edit refused, item locked");
            return Err(SyncError::Locked { item, owner: holder });
        }
        let mut held = self.inner.items.lock();
        for item in items {
            if !held.contains(item) {
                held.push(*item);
            }
        }
        Ok(())
    }

    /// Commits the edit and releases the session once the transaction
    /// finished, whatever its outcome.
    ///
    /// The handle yields whether anything changed. Committing a closed
    /// session fails with [`SyncError::SessionReleased`].
    pub fn commit<C: EditCommit>(&self, commit: C) -> TxHandle<bool, SyncError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return self
                .inner
                .manager
                .store
                .write(|_: &mut Writer| -> SyncResult<bool> { Err(SyncError::SessionReleased) });
        }
        let session = Arc::clone(&self.inner);
        let release = Finisher::new(move |_| session.release());
        self.inner.manager.commit(Some(self.owner()), release, commit)
    }

    /// Drops the session without writing anything.
    pub fn discard(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.release();
    }
}

impl std::fmt::Debug for EditSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditSession")
            .field("id", &self.inner.id)
            .field("items", &self.inner.items.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
