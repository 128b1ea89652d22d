//! Verify command implementation.

use super::{CliError, CliResult};
use itemdb_core::{journal_path, read_journal, Icn, ItemStore, Reader, StoreConfig};
use itemdb_storage::{FileBackend, InMemoryBackend, StorageBackend};
use std::path::Path;
use tracing::{debug, warn};

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyReport {
    /// Number of complete records checked.
    pub records_checked: usize,
    /// Offset of a trailing partial record. Recovery drops it on open.
    pub torn_tail: Option<u64>,
    /// Change number reached by the replay.
    pub last_icn: Option<u64>,
    /// Live items after the replay.
    pub live_items: Option<usize>,
    /// Problems found.
    pub problems: Vec<String>,
}

impl VerifyReport {
    /// Returns true if no problem was found.
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> CliResult<()> {
    println!("Verifying item store at {}", path.display());
    println!();

    let report = verify(path)?;
    println!("Records checked: {}", report.records_checked);
    if let Some(offset) = report.torn_tail {
        println!("Torn tail:       offset {offset} (dropped on next open)");
    }
    if let (Some(icn), Some(items)) = (report.last_icn, report.live_items) {
        println!("Replayed to ICN: {icn}");
        println!("Live items:      {items}");
    }
    for problem in &report.problems {
        println!("  - {problem}");
    }

    println!();
    if report.is_ok() {
        println!("✓ Store verification passed");
        Ok(())
    } else {
        println!("✗ Store verification failed");
        Err(CliError::VerificationFailed(report.problems.len()))
    }
}

/// Checks framing, checksums and change number continuity, then replays
/// the journal into a scratch store. The journal file is only read.
pub fn verify(path: &Path) -> CliResult<VerifyReport> {
    let file = journal_path(path);
    if !file.exists() {
        return Err(CliError::NoStore(path.to_path_buf()));
    }
    let bytes = FileBackend::open_existing(&file)?.read_from(0)?;
    let journal = InMemoryBackend::with_data(bytes);
    let mut report = VerifyReport::default();

    let scan = match read_journal(&journal) {
        Ok(scan) => scan,
        Err(e) => {
            warn!(error = %e, "journal unreadable");
            report.problems.push(e.to_string());
            return Ok(report);
        }
    };
    report.records_checked = scan.records.len();
    report.torn_tail = scan.torn_tail;

    let mut expected = Icn::ZERO.next();
    for scanned in &scan.records {
        if scanned.record.icn != expected {
            report.problems.push(format!(
                "record at offset {}: expected {expected}, found {}",
                scanned.offset, scanned.record.icn
            ));
        }
        expected = scanned.record.icn.next();
    }
    if !report.is_ok() {
        return Ok(report);
    }

    let config = StoreConfig::new().reader_threads(1).sync_on_commit(false);
    match ItemStore::open_with_backend(config, Box::new(journal)) {
        Ok(store) => {
            let snapshot = store.snapshot();
            report.last_icn = Some(snapshot.icn().as_u64());
            report.live_items = Some(snapshot.all_items().len());
            drop(snapshot);
            store.close();
        }
        Err(e) => report.problems.push(format!("replay failed: {e}")),
    }
    debug!(records = report.records_checked, problems = report.problems.len(), "journal verified");
    Ok(report)
}
