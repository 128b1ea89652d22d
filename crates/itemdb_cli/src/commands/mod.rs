//! CLI command implementations.

pub mod inspect;
pub mod items;
pub mod journal;
pub mod verify;

use clap::ValueEnum;
use itemdb_core::{journal_path, DbError, ItemStore, StoreConfig, ValueKind};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// How a command prints its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Errors reported by the commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// The directory holds no journal.
    #[error("no item store found at {}", .0.display())]
    NoStore(PathBuf),

    /// The requested item type was never materialized.
    #[error("unknown item type: {0}")]
    UnknownType(String),

    /// Verification found problems.
    #[error("verification failed with {0} problem(s)")]
    VerificationFailed(usize),

    /// Store error.
    #[error(transparent)]
    Store(#[from] DbError),

    /// Storage error.
    #[error(transparent)]
    Storage(#[from] itemdb_storage::StorageError),

    /// JSON output error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type for the commands.
pub type CliResult<T> = Result<T, CliError>;

/// Opens an existing store without creating anything.
fn open_store(dir: &Path) -> CliResult<ItemStore> {
    if !journal_path(dir).exists() {
        return Err(CliError::NoStore(dir.to_path_buf()));
    }
    let config = StoreConfig::new().create_if_missing(false).reader_threads(1);
    Ok(ItemStore::open(dir, config)?)
}

/// Renders a value kind as `composition<scalar>`, e.g. `set<text>`.
fn kind_name(kind: ValueKind) -> String {
    match kind.scalar_type() {
        Some(scalar) => format!("{}<{}>", kind.composition().name(), scalar.name()),
        None => kind.composition().name().to_string(),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
