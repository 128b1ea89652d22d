//! Store directory management.
//!
//! ```text
//! <store_path>/
//! ├─ LOCK       # Advisory lock for single-process access
//! └─ journal    # Commit journal
//! ```

use crate::error::{DbError, DbResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const JOURNAL_FILE: &str = "journal";

/// An opened store directory. Holds the exclusive lock until dropped.
#[derive(Debug)]
pub(crate) struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    /// Opens or creates a store directory and locks it.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidStore`] when the directory is missing (and
    /// may not be created) or already exists when it must not,
    /// [`DbError::StoreLocked`] when another process holds it, and I/O
    /// errors.
    pub(crate) fn open(path: &Path, create_if_missing: bool, error_if_exists: bool) -> DbResult<Self> {
        if path.exists() {
            if error_if_exists && Self::journal_path_in(path).exists() {
                return Err(DbError::invalid_store(format!(
                    "store already exists: {}",
                    path.display()
                )));
            }
        } else if create_if_missing {
            fs::create_dir_all(path)?;
        } else {
            return Err(DbError::invalid_store(format!(
                "store directory does not exist: {}",
                path.display()
            )));
        }

        if !path.is_dir() {
            return Err(DbError::invalid_store(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(DbError::StoreLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn journal_path(&self) -> PathBuf {
        Self::journal_path_in(&self.path)
    }

    /// Journal location inside a store directory, for tools that read it
    /// without opening the store.
    pub(crate) fn journal_path_in(path: &Path) -> PathBuf {
        path.join(JOURNAL_FILE)
    }
}

impl Drop for StoreDir {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self._lock_file);
    }
}
