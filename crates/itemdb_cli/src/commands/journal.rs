//! Journal dump command implementation.
//!
//! Reads the journal file directly, so it works next to a running store and
//! never truncates a torn tail.

use super::{print_json, CliError, CliResult, OutputFormat};
use itemdb_core::{journal_path, read_journal, JournalScan};
use itemdb_storage::FileBackend;
use serde::Serialize;
use std::path::Path;

/// Journal record representation for output.
#[derive(Debug, Serialize)]
pub struct JournalRecordInfo {
    /// Byte offset in the journal.
    pub offset: u64,
    /// Framed record size in bytes.
    pub size: u64,
    /// Change number of the commit.
    pub icn: u64,
    /// Next unallocated item id after the commit.
    pub next_item: u64,
    /// Items written by the commit.
    pub written: Vec<u64>,
    /// Items cleared by the commit.
    pub cleared: Vec<u64>,
}

/// Journal dump result.
#[derive(Debug, Serialize)]
pub struct JournalDump {
    /// Journal size in bytes.
    pub size: u64,
    /// Number of complete records in the journal.
    pub total_records: usize,
    /// The dumped records.
    pub records: Vec<JournalRecordInfo>,
    /// Offset of a trailing partial record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub torn_tail: Option<u64>,
}

/// Runs the journal command.
pub fn run(path: &Path, limit: Option<usize>, format: OutputFormat) -> CliResult<()> {
    let dump = dump_journal(path, limit)?;
    match format {
        OutputFormat::Json => print_json(&dump)?,
        OutputFormat::Text => print_text_output(&dump),
    }
    Ok(())
}

/// Scans the journal of the store at `path` without taking the store lock.
pub(crate) fn scan(path: &Path) -> CliResult<JournalScan> {
    let file = journal_path(path);
    if !file.exists() {
        return Err(CliError::NoStore(path.to_path_buf()));
    }
    let backend = FileBackend::open_existing(&file)?;
    Ok(read_journal(&backend)?)
}

/// Decodes up to `limit` records.
pub fn dump_journal(path: &Path, limit: Option<usize>) -> CliResult<JournalDump> {
    let scan = scan(path)?;
    let total_records = scan.records.len();
    let records = scan
        .records
        .into_iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(|scanned| {
            let (written, cleared): (Vec<_>, Vec<_>) =
                scanned.record.rows.iter().partition(|change| change.row.is_some());
            JournalRecordInfo {
                offset: scanned.offset,
                size: scanned.size,
                icn: scanned.record.icn.as_u64(),
                next_item: scanned.record.next_item,
                written: written.iter().map(|c| c.item.get()).collect(),
                cleared: cleared.iter().map(|c| c.item.get()).collect(),
            }
        })
        .collect();
    Ok(JournalDump {
        size: scan.size,
        total_records,
        records,
        torn_tail: scan.torn_tail,
    })
}

fn print_text_output(dump: &JournalDump) {
    println!(
        "Journal: {} bytes, {} record(s)",
        dump.size, dump.total_records
    );
    println!();
    for record in &dump.records {
        println!(
            "@{:<10} icn {:<8} {:>6} bytes  next item {:<6} written {:?} cleared {:?}",
            record.offset, record.icn, record.size, record.next_item, record.written, record.cleared
        );
    }
    if dump.records.len() < dump.total_records {
        println!("... {} more", dump.total_records - dump.records.len());
    }
    if let Some(offset) = dump.torn_tail {
        println!();
        println!("Torn tail at offset {offset} ({} bytes)", dump.size - offset);
    }
}
