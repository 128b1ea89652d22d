//! Test stores and sync managers.
//!
//! Provides convenience functions for setting up test stores
//! and common test scenarios.

use crate::tracker::{define_comment_tree, tracker_registry};
use itemdb_core::{ItemStore, StoreConfig};
use itemdb_sync::{MergeRegistry, SyncConfig, SyncManager};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// A test store with automatic cleanup.
pub struct TestStore {
    /// The store instance.
    pub store: Arc<ItemStore>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Creates a new in-memory test store.
    pub fn memory() -> Self {
        Self {
            store: Arc::new(ItemStore::open_in_memory().expect("Failed to open in-memory store")),
            _temp_dir: None,
        }
    }

    /// Creates a new store in a temporary directory.
    pub fn file() -> Self {
        Self::file_with(StoreConfig::default())
    }

    /// Creates a new store in a temporary directory with a custom config.
    pub fn file_with(config: StoreConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = ItemStore::open(temp_dir.path().join("store"), config).expect("Failed to open file store");
        Self {
            store: Arc::new(store),
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the store directory if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir.as_ref().map(|d| d.path().join("store"))
    }

    /// A shared handle, as a [`SyncManager`] wants it.
    pub fn shared(&self) -> Arc<ItemStore> {
        Arc::clone(&self.store)
    }

    /// Closes the store and opens its directory again.
    ///
    /// Every other handle to the store must be dropped first, or the
    /// directory lock is still held.
    pub fn reopen(self) -> Self {
        let Self { store, _temp_dir } = self;
        let temp_dir = _temp_dir.expect("Only file stores can be reopened");
        store.close();
        drop(store);
        let store =
            ItemStore::open(temp_dir.path().join("store"), StoreConfig::default()).expect("Failed to reopen store");
        Self {
            store: Arc::new(store),
            _temp_dir: Some(temp_dir),
        }
    }
}

impl std::ops::Deref for TestStore {
    type Target = ItemStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Runs a test with a temporary in-memory store.
///
/// # Example
///
/// ```rust,ignore
/// use itemdb_testkit::with_temp_store;
///
/// #[test]
/// fn my_test() {
///     with_temp_store(|store| {
///         assert_eq!(store.last_icn().as_u64(), 0);
///     });
/// }
/// ```
pub fn with_temp_store<F, R>(f: F) -> R
where
    F: FnOnce(&ItemStore) -> R,
{
    let test_store = TestStore::memory();
    f(&test_store)
}

/// Runs a test with a store in a temporary directory.
pub fn with_file_store<F, R>(f: F) -> R
where
    F: FnOnce(&ItemStore, &Path) -> R,
{
    let test_store = TestStore::file();
    let path = test_store.path().expect("File store should have a path");
    f(&test_store, &path)
}

/// A sync manager over a test store.
pub fn sync_manager(store: &TestStore, registry: MergeRegistry) -> SyncManager {
    SyncManager::new(store.shared(), registry, SyncConfig::default()).expect("Failed to start sync manager")
}

/// An in-memory store with a sync manager using [`tracker_registry`].
pub fn tracker_sync() -> (TestStore, SyncManager) {
    let store = TestStore::memory();
    let manager = sync_manager(&store, tracker_registry());
    define_comment_tree(&manager);
    (store, manager)
}
