// WAL id allocation. Ids are persisted before they are handed out, so an id
// is never reused across restarts. Guarded by its own mutex so allocation can
// run under a shared sequencer lock.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{Result, SequencerError};

#[derive(Debug)]
struct WalIndexFile {
    file: File,
    last_id: u32,
}

#[derive(Debug)]
pub struct WalIdAllocator {
    path: PathBuf,
    inner: Mutex<WalIndexFile>,
}

impl WalIdAllocator {
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
        file.write_all(&0i64.to_le_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| SequencerError::io(path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(WalIndexFile { file, last_id: 0 }),
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| SequencerError::io(path, e))?;
        let mut buf = [0u8; 8];
        file.read_exact(&mut buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => SequencerError::corrupt(path, "truncated wal index"),
            _ => SequencerError::io(path, e),
        })?;
        let last_id = i64::from_le_bytes(buf);
        if !(0..=i32::MAX as i64).contains(&last_id) {
            return Err(SequencerError::corrupt(path, format!("wal id {last_id} out of range")));
        }

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(WalIndexFile {
                file,
                last_id: last_id as u32,
            }),
        })
    }

    pub fn last_id(&self) -> u32 {
        self.inner.lock().last_id
    }

    /// Allocate the next WAL id. Ids start at 1 and stop at `i32::MAX`, the
    /// widest id a ledger record holds.
    pub fn next_id(&self) -> Result<u32> {
        let mut inner = self.inner.lock();
        let id = inner
            .last_id
            .checked_add(1)
            .filter(|&id| id <= i32::MAX as u32)
            .ok_or(SequencerError::WalReferenceOutOfRange {
                wal_id: inner.last_id,
                segment_id: 0,
                segment_txn: 0,
            })?;
        let file = &mut inner.file;
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(&(id as i64).to_le_bytes()))
            .and_then(|_| file.sync_data())
            .map_err(|e| SequencerError::io(&self.path, e))?;
        inner.last_id = id;
        Ok(id)
    }
}
