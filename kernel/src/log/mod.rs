// Transaction Ledger
//
// Append-only log of every transaction assigned to a table. Data commits,
// structure changes and the drop marker share one txn counter, so the ledger
// order is the replay order.
//
// Layout (little-endian):
//
//   header, 16 bytes
//     int32  format version
//     int64  max txn            offset 4; the commit point of an append
//     int32  flags              offset 12; bit 0 = suspended
//   record n (txn n, 1-based) at 16 + (n - 1) * 32
//     int64  structure version
//     int32  wal id             -1 structure change, -2 table drop
//     int32  segment id
//     int64  segment txn
//     int64  commit timestamp   micros
//
// A record is written and flushed before `max txn` moves past it. Anything
// beyond `max txn` is left over from an interrupted append and is ignored.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Result, SequencerError};

pub mod changes;
pub mod wal_index;

pub use changes::{MetadataChange, MetadataChangeCursor, MetadataChangeLog};
pub use wal_index::WalIdAllocator;

/// Transaction number. 0 means "nothing committed yet".
pub type Txn = u64;

pub const TXNLOG_FORMAT_VERSION: i32 = 1;
pub const MAX_TXN_OFFSET: u64 = 4;
const FLAGS_OFFSET: u64 = 12;
const HEADER_SIZE: u64 = 16;
const RECORD_SIZE: u64 = 32;

pub const STRUCTURAL_CHANGE_WAL_ID: i32 = -1;
pub const DROP_TABLE_WAL_ID: i32 = -2;

const FLAG_SUSPENDED: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransactionKind {
    /// Rows committed to a WAL segment.
    Data {
        wal_id: u32,
        segment_id: u32,
        segment_txn: u64,
    },
    /// Schema change; the payload lives in the metadata change log.
    StructureChange,
    /// The table was dropped. Nothing follows this record.
    DropTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransactionRecord {
    pub txn: Txn,
    /// Version the data was written against, or for a structure change the
    /// version it produced.
    pub structure_version: u64,
    #[serde(flatten)]
    pub kind: TransactionKind,
    pub commit_timestamp: u64,
}

impl TransactionRecord {
    pub fn is_structure_change(&self) -> bool {
        self.kind == TransactionKind::StructureChange
    }

    pub fn is_drop(&self) -> bool {
        self.kind == TransactionKind::DropTable
    }

    /// Fails for a data reference that does not fit the on-disk widths.
    fn encode(&self) -> Result<[u8; RECORD_SIZE as usize]> {
        let (wal_id, segment_id, segment_txn) = match self.kind {
            TransactionKind::Data {
                wal_id,
                segment_id,
                segment_txn,
            } => {
                let out_of_range = || SequencerError::WalReferenceOutOfRange {
                    wal_id,
                    segment_id,
                    segment_txn,
                };
                (
                    i32::try_from(wal_id).map_err(|_| out_of_range())?,
                    i32::try_from(segment_id).map_err(|_| out_of_range())?,
                    i64::try_from(segment_txn).map_err(|_| out_of_range())?,
                )
            }
            TransactionKind::StructureChange => (STRUCTURAL_CHANGE_WAL_ID, -1, -1),
            TransactionKind::DropTable => (DROP_TABLE_WAL_ID, -1, -1),
        };

        let mut buf = [0u8; RECORD_SIZE as usize];
        buf[0..8].copy_from_slice(&(self.structure_version as i64).to_le_bytes());
        buf[8..12].copy_from_slice(&wal_id.to_le_bytes());
        buf[12..16].copy_from_slice(&segment_id.to_le_bytes());
        buf[16..24].copy_from_slice(&segment_txn.to_le_bytes());
        buf[24..32].copy_from_slice(&(self.commit_timestamp as i64).to_le_bytes());
        Ok(buf)
    }

    fn decode(txn: Txn, buf: &[u8; RECORD_SIZE as usize], path: &Path) -> Result<Self> {
        let i32_at = |at: usize| i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let i64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            i64::from_le_bytes(b)
        };

        let structure_version = i64_at(0);
        let wal_id = i32_at(8);
        let segment_id = i32_at(12);
        let segment_txn = i64_at(16);
        let commit_timestamp = i64_at(24);
        if structure_version < 0 || commit_timestamp < 0 {
            return Err(SequencerError::corrupt(
                path,
                format!("txn {txn} has negative version or timestamp"),
            ));
        }

        let kind = match wal_id {
            STRUCTURAL_CHANGE_WAL_ID => TransactionKind::StructureChange,
            DROP_TABLE_WAL_ID => TransactionKind::DropTable,
            id if id >= 0 && segment_id >= 0 && segment_txn >= 0 => TransactionKind::Data {
                wal_id: id as u32,
                segment_id: segment_id as u32,
                segment_txn: segment_txn as u64,
            },
            _ => {
                return Err(SequencerError::corrupt(
                    path,
                    format!("txn {txn} has invalid wal reference {wal_id}/{segment_id}/{segment_txn}"),
                ))
            }
        };

        Ok(Self {
            txn,
            structure_version: structure_version as u64,
            kind,
            commit_timestamp: commit_timestamp as u64,
        })
    }
}

fn record_offset(txn: Txn) -> u64 {
    HEADER_SIZE + (txn - 1) * RECORD_SIZE
}

fn read_record(file: &mut File, path: &Path, txn: Txn) -> Result<TransactionRecord> {
    let mut buf = [0u8; RECORD_SIZE as usize];
    file.seek(SeekFrom::Start(record_offset(txn)))
        .and_then(|_| file.read_exact(&mut buf))
        .map_err(|e| SequencerError::io(path, e))?;
    TransactionRecord::decode(txn, &buf, path)
}

/// Racy read of the committed max txn, for housekeeping scans.
pub fn read_max_txn(path: &Path) -> Result<i64> {
    let mut file = File::open(path).map_err(|e| SequencerError::io(path, e))?;
    let mut buf = [0u8; 8];
    file.seek(SeekFrom::Start(MAX_TXN_OFFSET))
        .and_then(|_| file.read_exact(&mut buf))
        .map_err(|e| SequencerError::io(path, e))?;
    Ok(i64::from_le_bytes(buf))
}

/// Writable handle on a table's `_txnlog`.
#[derive(Debug)]
pub struct TransactionLog {
    file: File,
    path: PathBuf,
    max_txn: Txn,
    flags: i32,
}

impl TransactionLog {
    /// Create an empty ledger. Fails if the file already exists.
    pub fn create(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => SequencerError::AlreadyExists {
                    path: path.to_path_buf(),
                },
                _ => SequencerError::io(path, e),
            })?;

        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&TXNLOG_FORMAT_VERSION.to_le_bytes());
        file.write_all(&header)
            .and_then(|_| file.sync_all())
            .map_err(|e| SequencerError::io(path, e))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            max_txn: 0,
            flags: 0,
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| SequencerError::io(path, e))?;

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => SequencerError::corrupt(path, "truncated header"),
            _ => SequencerError::io(path, e),
        })?;

        let format_version = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if format_version != TXNLOG_FORMAT_VERSION {
            return Err(SequencerError::corrupt(
                path,
                format!("unsupported format version {format_version}"),
            ));
        }
        let mut max_txn = [0u8; 8];
        max_txn.copy_from_slice(&header[4..12]);
        let max_txn = i64::from_le_bytes(max_txn);
        let flags = i32::from_le_bytes([header[12], header[13], header[14], header[15]]);
        if max_txn < 0 {
            return Err(SequencerError::corrupt(path, format!("negative max txn {max_txn}")));
        }

        let len = file
            .metadata()
            .map_err(|e| SequencerError::io(path, e))?
            .len();
        let max_txn = max_txn as u64;
        if max_txn > 0 && len < record_offset(max_txn) + RECORD_SIZE {
            return Err(SequencerError::corrupt(
                path,
                format!("max txn {max_txn} is past the end of the file ({len} bytes)"),
            ));
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            max_txn,
            flags,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_txn(&self) -> Txn {
        self.max_txn
    }

    /// Append a record under the next txn number and make it durable.
    pub fn append(
        &mut self,
        structure_version: u64,
        kind: TransactionKind,
        commit_timestamp: u64,
    ) -> Result<Txn> {
        let txn = self.max_txn + 1;
        let record = TransactionRecord {
            txn,
            structure_version,
            kind,
            commit_timestamp,
        };

        let encoded = record.encode()?;

        let path = &self.path;
        let file = &mut self.file;
        file.seek(SeekFrom::Start(record_offset(txn)))
            .and_then(|_| file.write_all(&encoded))
            .and_then(|_| file.sync_data())
            .map_err(|e| SequencerError::io(path, e))?;

        // commit point
        file.seek(SeekFrom::Start(MAX_TXN_OFFSET))
            .and_then(|_| file.write_all(&(txn as i64).to_le_bytes()))
            .and_then(|_| file.sync_data())
            .map_err(|e| SequencerError::io(path, e))?;

        self.max_txn = txn;
        Ok(txn)
    }

    pub fn last_record(&mut self) -> Result<Option<TransactionRecord>> {
        if self.max_txn == 0 {
            return Ok(None);
        }
        read_record(&mut self.file, &self.path, self.max_txn).map(Some)
    }

    pub fn is_suspended(&self) -> bool {
        self.flags & FLAG_SUSPENDED != 0
    }

    pub fn set_suspended(&mut self, suspended: bool) -> Result<()> {
        let flags = if suspended {
            self.flags | FLAG_SUSPENDED
        } else {
            self.flags & !FLAG_SUSPENDED
        };

        let path = &self.path;
        let file = &mut self.file;
        file.seek(SeekFrom::Start(FLAGS_OFFSET))
            .and_then(|_| file.write_all(&flags.to_le_bytes()))
            .and_then(|_| file.sync_data())
            .map_err(|e| SequencerError::io(path, e))?;

        self.flags = flags;
        Ok(())
    }

    /// Cursor over records committed at the time of the call, starting at
    /// `from` (inclusive).
    pub fn cursor(&self, from: Txn) -> Result<TransactionLogCursor> {
        let file = File::open(&self.path).map_err(|e| SequencerError::io(&self.path, e))?;
        let from = from.max(1);
        Ok(TransactionLogCursor {
            file,
            path: self.path.clone(),
            from,
            next: from,
            max_txn: self.max_txn,
        })
    }
}

/// Forward-only cursor over a snapshot of the ledger. Reads lazily through
/// its own file handle.
#[derive(Debug)]
pub struct TransactionLogCursor {
    file: File,
    path: PathBuf,
    from: Txn,
    next: Txn,
    max_txn: Txn,
}

impl TransactionLogCursor {
    /// Last txn visible to this cursor.
    pub fn max_txn(&self) -> Txn {
        self.max_txn
    }

    /// Rewind to the cursor's starting txn.
    pub fn to_top(&mut self) {
        self.next = self.from;
    }
}

impl Iterator for TransactionLogCursor {
    type Item = Result<TransactionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.max_txn {
            return None;
        }
        let txn = self.next;
        self.next += 1;
        Some(read_record(&mut self.file, &self.path, txn))
    }
}
