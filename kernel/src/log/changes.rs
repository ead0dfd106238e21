// Metadata Change Log
//
// Payloads of structure changes, keyed by the structure version each one
// produced. Readers replay it to catch a cached schema up to the sequencer.
//
// Layout (little-endian):
//
//   int64  committed size      entries past it are ignored
//   repeat:
//     int64  structure version
//     int32  payload length, then the payload bytes

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Result, SequencerError};
use crate::schema::SchemaChange;

const COMMITTED_SIZE_OFFSET: u64 = 0;
const HEADER_SIZE: u64 = 8;
const ENTRY_HEADER_SIZE: u64 = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataChange {
    /// Version the table has after this change.
    pub structure_version: u64,
    pub change: SchemaChange,
}

#[derive(Debug)]
pub struct MetadataChangeLog {
    file: File,
    path: PathBuf,
    committed_size: u64,
    last_version: Option<u64>,
}

impl MetadataChangeLog {
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
        file.write_all(&(HEADER_SIZE as i64).to_le_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| SequencerError::io(path, e))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            committed_size: HEADER_SIZE,
            last_version: None,
        })
    }

    /// Open an existing log, dropping any uncommitted tail.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| SequencerError::io(path, e))?;
        let len = file
            .metadata()
            .map_err(|e| SequencerError::io(path, e))?
            .len();

        let mut buf = [0u8; 8];
        file.read_exact(&mut buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => SequencerError::corrupt(path, "truncated header"),
            _ => SequencerError::io(path, e),
        })?;
        let committed_size = i64::from_le_bytes(buf);
        if committed_size < HEADER_SIZE as i64 || committed_size as u64 > len {
            return Err(SequencerError::corrupt(
                path,
                format!("committed size {committed_size} outside file of {len} bytes"),
            ));
        }
        let committed_size = committed_size as u64;
        file.set_len(committed_size)
            .map_err(|e| SequencerError::io(path, e))?;

        let mut log = Self {
            file,
            path: path.to_path_buf(),
            committed_size,
            last_version: None,
        };
        for entry in log.cursor(0)? {
            let entry = entry?;
            if matches!(log.last_version, Some(last) if entry.structure_version <= last) {
                return Err(SequencerError::corrupt(
                    path,
                    format!("structure version {} is out of order", entry.structure_version),
                ));
            }
            log.last_version = Some(entry.structure_version);
        }
        Ok(log)
    }

    pub fn last_version(&self) -> Option<u64> {
        self.last_version
    }

    pub fn append(&mut self, structure_version: u64, change: &SchemaChange) -> Result<()> {
        let payload = change.to_payload()?;
        let mut entry = Vec::with_capacity(ENTRY_HEADER_SIZE as usize + payload.len());
        entry.extend_from_slice(&(structure_version as i64).to_le_bytes());
        entry.extend_from_slice(&(payload.len() as i32).to_le_bytes());
        entry.extend_from_slice(&payload);

        let new_size = self.committed_size + entry.len() as u64;
        let path = &self.path;
        let file = &mut self.file;
        file.seek(SeekFrom::Start(self.committed_size))
            .and_then(|_| file.write_all(&entry))
            .and_then(|_| file.sync_data())
            .map_err(|e| SequencerError::io(path, e))?;

        file.seek(SeekFrom::Start(COMMITTED_SIZE_OFFSET))
            .and_then(|_| file.write_all(&(new_size as i64).to_le_bytes()))
            .and_then(|_| file.sync_data())
            .map_err(|e| SequencerError::io(path, e))?;

        self.committed_size = new_size;
        self.last_version = Some(structure_version);
        Ok(())
    }

    /// Changes that produced `from` or any later version.
    pub fn cursor(&self, from: u64) -> Result<MetadataChangeCursor> {
        let file = File::open(&self.path).map_err(|e| SequencerError::io(&self.path, e))?;
        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(HEADER_SIZE))
            .map_err(|e| SequencerError::io(&self.path, e))?;
        Ok(MetadataChangeCursor {
            reader,
            path: self.path.clone(),
            pos: HEADER_SIZE,
            end: self.committed_size,
            from,
        })
    }
}

#[derive(Debug)]
pub struct MetadataChangeCursor {
    reader: BufReader<File>,
    path: PathBuf,
    pos: u64,
    end: u64,
    from: u64,
}

impl MetadataChangeCursor {
    fn read_entry(&mut self) -> Result<MetadataChange> {
        if self.pos + ENTRY_HEADER_SIZE > self.end {
            return Err(SequencerError::corrupt(&self.path, "entry header past committed size"));
        }
        let mut header = [0u8; ENTRY_HEADER_SIZE as usize];
        self.reader
            .read_exact(&mut header)
            .map_err(|e| SequencerError::io(&self.path, e))?;

        let mut version = [0u8; 8];
        version.copy_from_slice(&header[0..8]);
        let structure_version = i64::from_le_bytes(version);
        let len = i32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if structure_version < 0 || len < 0 || self.pos + ENTRY_HEADER_SIZE + len as u64 > self.end {
            return Err(SequencerError::corrupt(
                &self.path,
                format!("malformed entry at offset {}", self.pos),
            ));
        }

        let mut payload = vec![0u8; len as usize];
        self.reader
            .read_exact(&mut payload)
            .map_err(|e| SequencerError::io(&self.path, e))?;
        self.pos += ENTRY_HEADER_SIZE + len as u64;

        let change = SchemaChange::from_payload(&payload)
            .map_err(|e| SequencerError::corrupt(&self.path, e.to_string()))?;
        Ok(MetadataChange {
            structure_version: structure_version as u64,
            change,
        })
    }
}

impl Iterator for MetadataChangeCursor {
    type Item = Result<MetadataChange>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.end {
            match self.read_entry() {
                Ok(entry) if entry.structure_version < self.from => continue,
                Ok(entry) => return Some(Ok(entry)),
                Err(e) => {
                    // stop after the first bad entry
                    self.pos = self.end;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
