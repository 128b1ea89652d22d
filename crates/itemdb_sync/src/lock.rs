//! Item locks shared by edit sessions, uploads and merges.
//!
//! Every check-and-acquire happens under one mutex, so two holders can
//! never both pass the "is it free?" test for the same item.

use itemdb_core::{ItemId, Lifetime, SimpleModifiable, Gate};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Identity of an edit session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// A fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session:{}", self.0)
    }
}

/// Holder of an item lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockOwner {
    /// An edit session.
    Edit(SessionId),
    /// An upload task.
    Upload(Uuid),
    /// A merge transaction.
    Merge(u64),
    /// A commit of explicitly listed items.
    Commit(u64),
}

impl LockOwner {
    /// Returns true for edit session locks.
    pub const fn is_edit(&self) -> bool {
        matches!(self, LockOwner::Edit(_))
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockOwner::Edit(id) => write!(f, "edit {id}"),
            LockOwner::Upload(id) => write!(f, "upload {id}"),
            LockOwner::Merge(seq) => write!(f, "merge #{seq}"),
            LockOwner::Commit(seq) => write!(f, "commit #{seq}"),
        }
    }
}

#[derive(Default)]
struct LockState {
    holders: HashMap<ItemId, LockOwner>,
    deferred: HashMap<SessionId, BTreeSet<ItemId>>,
}

/// Table of item locks.
pub struct LockTable {
    state: Mutex<LockState>,
    modifiable: SimpleModifiable,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            modifiable: SimpleModifiable::new(),
        }
    }

    /// Locks all `items` for `owner`, or none of them.
    ///
    /// Items already held by `owner` are fine. On failure returns the first
    /// item held by someone else together with its holder.
    pub fn try_acquire(&self, items: &[ItemId], owner: LockOwner) -> Result<(), (ItemId, LockOwner)> {
        {
            let mut state = self.state.lock();
            for item in items {
                if let Some(holder) = state.holders.get(item) {
                    if *holder != owner {
                        return Err((*item, *holder));
                    }
                }
            }
            for item in items {
                state.holders.insert(*item, owner);
            }
        }
        if !items.is_empty() {
            self.modifiable.fire_changed();
        }
        Ok(())
    }

    /// Releases the given items if `owner` holds them.
    pub fn release(&self, items: &[ItemId], owner: LockOwner) {
        let released = {
            let mut state = self.state.lock();
            let mut released = false;
            for item in items {
                if state.holders.get(item) == Some(&owner) {
                    state.holders.remove(item);
                    released = true;
                }
            }
            released
        };
        if released {
            self.modifiable.fire_changed();
        }
    }

    /// Releases everything `owner` holds and returns the released items.
    pub fn release_owner(&self, owner: LockOwner) -> Vec<ItemId> {
        let released = {
            let mut state = self.state.lock();
            let released = Self::held_by(&state, owner);
            for item in &released {
                state.holders.remove(item);
            }
            released
        };
        if !released.is_empty() {
            self.modifiable.fire_changed();
        }
        released
    }

    /// Releases a session's locks. Returns the released items and the items
    /// whose merge was deferred until this release.
    pub fn release_session(&self, session: SessionId) -> (Vec<ItemId>, BTreeSet<ItemId>) {
        let (released, deferred) = {
            let mut state = self.state.lock();
            let released = Self::held_by(&state, LockOwner::Edit(session));
            for item in &released {
                state.holders.remove(item);
            }
            let deferred = state.deferred.remove(&session).unwrap_or_default();
            (released, deferred)
        };
        if !released.is_empty() {
            self.modifiable.fire_changed();
        }
        (released, deferred)
    }

    /// Remembers that `item` needs a merge once `session` releases it.
    ///
    /// Returns false if the session no longer holds the item, in which case
    /// the caller should retry the merge itself.
    pub fn defer_merge(&self, session: SessionId, item: ItemId) -> bool {
        self.defer_merge_behind(session, item, item)
    }

    /// Remembers that `item` needs a merge once `session` releases `held`,
    /// an item the merge of `item` has to lock as well.
    ///
    /// Returns false if the session no longer holds `held`.
    pub fn defer_merge_behind(&self, session: SessionId, held: ItemId, item: ItemId) -> bool {
        let mut state = self.state.lock();
        if state.holders.get(&held) != Some(&LockOwner::Edit(session)) {
            return false;
        }
        state.deferred.entry(session).or_default().insert(item);
        true
    }

    /// The holder of an item's lock.
    pub fn find_lock(&self, item: ItemId) -> Option<LockOwner> {
        self.state.lock().holders.get(&item).copied()
    }

    /// The first locked item among `items`, with its holder.
    pub fn find_any_lock(&self, items: &[ItemId]) -> Option<(ItemId, LockOwner)> {
        let state = self.state.lock();
        items
            .iter()
            .find_map(|item| state.holders.get(item).map(|owner| (*item, *owner)))
    }

    /// Items held by `owner`, ascending.
    pub fn items_of(&self, owner: LockOwner) -> Vec<ItemId> {
        Self::held_by(&self.state.lock(), owner)
    }

    /// Number of locked items.
    pub fn len(&self) -> usize {
        self.state.lock().holders.len()
    }

    /// Returns true if nothing is locked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a listener called whenever the set of locks changes.
    pub fn add_listener(
        &self,
        lifetime: &Lifetime,
        gate: Arc<dyn Gate>,
        listener: impl Fn() + Send + Sync + 'static,
    ) {
        self.modifiable.add_listener(lifetime, gate, listener);
    }

    fn held_by(state: &LockState, owner: LockOwner) -> Vec<ItemId> {
        let mut items: Vec<ItemId> = state
            .holders
            .iter()
            .filter(|(_, holder)| **holder == owner)
            .map(|(item, _)| *item)
            .collect();
        items.sort_unstable();
        items
    }
}
