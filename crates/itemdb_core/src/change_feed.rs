//! Change feed for observing commits.
//!
//! Every commit emits one [`CommitEvent`] listing the items it changed.
//! Events are published off the writer thread in ICN order, after live
//! queries have seen the commit.
//!
//! # Usage
//!
//! ```rust,ignore
//! use itemdb_core::ItemStore;
//!
//! let store = ItemStore::open_in_memory()?;
//! let receiver = store.subscribe();
//!
//! std::thread::spawn(move || {
//!     while let Ok(event) = receiver.recv() {
//!         println!("{} changed {} items", event.icn, event.items.len());
//!     }
//! });
//! ```

use crate::types::{Icn, ItemId};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// One committed write transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEvent {
    /// Change number of the commit.
    pub icn: Icn,
    /// Items whose values changed, ascending.
    pub items: Arc<[ItemId]>,
}

/// Distributes commit events to subscribers and keeps a bounded history
/// for polling.
pub struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<CommitEvent>>>,
    history: RwLock<VecDeque<CommitEvent>>,
    max_history: usize,
}

impl ChangeFeed {
    /// Creates a feed keeping up to `max_history` events.
    #[must_use]
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::new()),
            max_history,
        }
    }

    /// Subscribes to all future events.
    ///
    /// The receiver should be drained regularly; undelivered events are held
    /// in memory.
    pub fn subscribe(&self) -> Receiver<CommitEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Publishes an event. Disconnected subscribers are dropped.
    pub fn emit(&self, event: CommitEvent) {
        {
            let mut history = self.history.write();
            history.push_back(event.clone());
            while history.len() > self.max_history {
                history.pop_front();
            }
        }
        self.subscribers
            .write()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Events after `cursor`, oldest first, at most `limit`.
    pub fn poll(&self, cursor: Icn, limit: usize) -> Vec<CommitEvent> {
        self.history
            .read()
            .iter()
            .filter(|e| e.icn > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// ICN of the newest retained event.
    pub fn latest_icn(&self) -> Icn {
        self.history.read().back().map_or(Icn::ZERO, |e| e.icn)
    }

    /// Number of connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Number of retained events.
    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }

    /// Drops retained events below `min_icn`.
    pub fn truncate_history(&self, min_icn: Icn) {
        self.history.write().retain(|e| e.icn >= min_icn);
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::with_max_history(1024)
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("subscribers", &self.subscriber_count())
            .field("history", &self.history_len())
            .finish()
    }
}
