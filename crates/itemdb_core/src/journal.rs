//! Commit journal.
//!
//! Each commit is appended as one framed record before it becomes visible:
//!
//! ```text
//! | magic "IJNL" (4) | version (2) | kind (1) | length (4) | payload | crc32 (4) |
//! ```
//!
//! The payload is a CBOR-encoded [`CommitRecord`]. The checksum covers
//! everything before it. On replay a record cut short at the end of the
//! journal (a crash during append) is dropped; a damaged record anywhere is
//! an error.

use crate::error::{DbError, DbResult};
use crate::table::RowChange;
use crate::types::Icn;
use itemdb_storage::StorageBackend;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Magic bytes opening every record.
pub const JOURNAL_MAGIC: [u8; 4] = *b"IJNL";

/// Current record format version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + kind (1) + length (4)
const HEADER_SIZE: usize = 11;

const CRC_SIZE: usize = 4;

/// Kind of journal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// One committed write transaction.
    Commit = 1,
}

impl RecordKind {
    /// Converts a byte to a record kind.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Commit),
            _ => None,
        }
    }

    /// Converts the record kind to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// The durable form of one commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Change number assigned to the commit.
    pub icn: Icn,
    /// Next unallocated item id after the commit.
    pub next_item: u64,
    /// New state of every changed item.
    pub rows: Vec<RowChange>,
}

impl CommitRecord {
    /// Encodes the record into a framed journal entry.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the payload cannot be encoded or is too large.
    pub fn encode(&self) -> DbResult<Vec<u8>> {
        let mut payload = Vec::new();
        ciborium::ser::into_writer(self, &mut payload).map_err(|e| DbError::codec(e.to_string()))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| DbError::codec("journal record payload too large"))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&JOURNAL_MAGIC);
        data.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        data.push(RecordKind::Commit.as_byte());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    fn decode_payload(payload: &[u8], offset: u64) -> DbResult<Self> {
        ciborium::de::from_reader(payload)
            .map_err(|e| DbError::journal_corruption(offset, format!("undecodable payload: {e}")))
    }
}

/// One record located in a journal.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedRecord {
    /// Byte offset of the record.
    pub offset: u64,
    /// Framed size in bytes.
    pub size: u64,
    /// The decoded commit.
    pub record: CommitRecord,
}

/// Result of reading a journal front to back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JournalScan {
    /// Complete, checksummed records in order.
    pub records: Vec<ScannedRecord>,
    /// Offset of a trailing partial record, if the journal ends in one.
    pub torn_tail: Option<u64>,
    /// Total journal size in bytes.
    pub size: u64,
}

/// Reads every record of a journal without modifying it.
///
/// # Errors
///
/// Returns [`DbError::ChecksumMismatch`] or [`DbError::JournalCorruption`]
/// for a damaged record and storage errors from the backend.
pub fn read_journal(backend: &dyn StorageBackend) -> DbResult<JournalScan> {
    let bytes = backend.read_from(0)?;
    let size = bytes.len() as u64;
    let mut scan = JournalScan {
        size,
        ..JournalScan::default()
    };
    let mut pos = 0usize;
    while pos < bytes.len() {
        let offset = pos as u64;
        let rest = &bytes[pos..];
        if rest.len() < HEADER_SIZE {
            scan.torn_tail = Some(offset);
            break;
        }
        if rest[0..4] != JOURNAL_MAGIC {
            return Err(DbError::journal_corruption(offset, "bad magic"));
        }
        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version != JOURNAL_VERSION {
            return Err(DbError::journal_corruption(
                offset,
                format!("unsupported record version {version}"),
            ));
        }
        if RecordKind::from_byte(rest[6]).is_none() {
            return Err(DbError::journal_corruption(
                offset,
                format!("unknown record kind {}", rest[6]),
            ));
        }
        let len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;
        let total = HEADER_SIZE + len + CRC_SIZE;
        if rest.len() < total {
            scan.torn_tail = Some(offset);
            break;
        }
        let body = &rest[..HEADER_SIZE + len];
        let stored = u32::from_le_bytes([
            rest[HEADER_SIZE + len],
            rest[HEADER_SIZE + len + 1],
            rest[HEADER_SIZE + len + 2],
            rest[HEADER_SIZE + len + 3],
        ]);
        let actual = compute_crc32(body);
        if stored != actual {
            return Err(DbError::ChecksumMismatch {
                offset,
                expected: stored,
                actual,
            });
        }
        let record = CommitRecord::decode_payload(&body[HEADER_SIZE..], offset)?;
        scan.records.push(ScannedRecord {
            offset,
            size: total as u64,
            record,
        });
        pos += total;
    }
    Ok(scan)
}

/// Append-only journal of commits.
pub(crate) struct Journal {
    backend: Mutex<Box<dyn StorageBackend>>,
    sync_on_commit: bool,
}

impl Journal {
    pub(crate) fn new(backend: Box<dyn StorageBackend>, sync_on_commit: bool) -> Self {
        Self {
            backend: Mutex::new(backend),
            sync_on_commit,
        }
    }

    /// Appends one commit and makes it durable.
    pub(crate) fn append(&self, record: &CommitRecord) -> DbResult<u64> {
        let data = record.encode()?;
        let mut backend = self.backend.lock();
        let offset = backend.append(&data)?;
        if self.sync_on_commit {
            backend.sync()?;
        } else {
            backend.flush()?;
        }
        Ok(offset)
    }

    /// Reads all commits for recovery, cutting off a torn tail so the next
    /// append starts on a record boundary.
    ///
    /// ICNs must run 1, 2, 3... without gaps.
    pub(crate) fn replay(&self) -> DbResult<Vec<CommitRecord>> {
        let mut backend = self.backend.lock();
        let scan = read_journal(&**backend)?;
        if let Some(offset) = scan.torn_tail {
            warn!(offset, size = scan.size, "dropping torn journal tail");
            backend.truncate(offset)?;
            backend.sync()?;
        }
        let mut expected = Icn::ZERO.next();
        let mut records = Vec::with_capacity(scan.records.len());
        for scanned in scan.records {
            if scanned.record.icn != expected {
                return Err(DbError::journal_corruption(
                    scanned.offset,
                    format!("expected {expected}, found {}", scanned.record.icn),
                ));
            }
            expected = expected.next();
            records.push(scanned.record);
        }
        debug!(records = records.len(), "journal replayed");
        Ok(records)
    }

    pub(crate) fn size(&self) -> DbResult<u64> {
        Ok(self.backend.lock().size()?)
    }
}

/// Computes the IEEE CRC32 of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
