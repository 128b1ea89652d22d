//! # itemdb storage
//!
//! Append-only byte stores that hold the itemdb commit journal.
//!
//! Backends know nothing about journal framing or item data. The core crate
//! writes framed records with [`StorageBackend::append`] and reads them back
//! during replay; everything else is its business.
//!
//! - [`InMemoryBackend`] keeps bytes in a shared buffer. Clones see the same
//!   bytes, which lets tests "reopen" an in-memory store.
//! - [`FileBackend`] keeps bytes in a single file.
//!
//! ```rust
//! use itemdb_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let at = backend.append(b"commit").unwrap();
//! assert_eq!(backend.read_at(at, 6).unwrap(), b"commit");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
