// Metadata File Codec
//
// Layout (little-endian):
//
//   int32  size               written last; 0 while a write is in flight
//   int32  format version
//   int64  structure version
//   int32  column count       tombstones included
//   int32  timestamp index    -1 if none
//   int32  table id
//   repeat column count:
//     int32  type code        negative for a removed column
//     int32  name length, then UTF-8 name bytes
//
// A declared size of 0, or a file shorter than its declared size, means the
// writer has not committed yet. Bytes past the declared size are stale.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use super::SequencerMetadata;
use crate::error::{Result, SequencerError};
use crate::schema::ColumnType;

pub const META_FORMAT_VERSION: i32 = 1;

const SIZE_OFFSET: u64 = 0;
pub const META_TABLE_ID_OFFSET: u64 = 24;
const HEADER_SIZE: usize = 28;
const MIN_COLUMN_SIZE: usize = 8;

const NOT_COMMITTED_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Keep the handle for later syncs; stale tail bytes are truncated.
    ReadWrite,
    /// One-shot read; the handle is closed before returning.
    ReadOnly,
}

/// Open read-write handle on a `_meta` file.
#[derive(Debug)]
pub struct MetaFile {
    file: File,
    path: PathBuf,
}

impl MetaFile {
    /// Create a new metadata file. Fails if one already exists.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
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
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the file from `metadata` and flush it to disk. The body is
    /// durable before the size that commits it is written.
    pub fn sync(&mut self, metadata: &SequencerMetadata) -> Result<()> {
        let path = &self.path;
        let file = &mut self.file;

        let mut out = BufWriter::new(&mut *file);
        let size = write_body(metadata, &mut out)
            .and_then(|size| out.flush().map(|_| size))
            .map_err(|e| SequencerError::io(path, e))?;
        drop(out);

        file.sync_data()
            .and_then(|_| write_size(file, size))
            .and_then(|_| file.set_len(size))
            .and_then(|_| file.sync_data())
            .map_err(|e| SequencerError::io(path, e))
    }
}

impl SequencerMetadata {
    /// Write this snapshot to `path`, keeping the handle for later syncs.
    pub fn dump_to(&self, path: &Path) -> Result<MetaFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| SequencerError::io(path, e))?;
        let mut meta_file = MetaFile {
            file,
            path: path.to_path_buf(),
        };
        meta_file.sync(self)?;
        Ok(meta_file)
    }

    /// Load a snapshot. In `ReadWrite` mode the file is first truncated to
    /// its declared size and the open handle is returned alongside.
    pub fn open(path: &Path, mode: OpenMode) -> Result<(SequencerMetadata, Option<MetaFile>)> {
        match mode {
            OpenMode::ReadOnly => {
                let bytes = fs::read(path).map_err(|e| SequencerError::io(path, e))?;
                Ok((decode(&bytes, path)?, None))
            }
            OpenMode::ReadWrite => {
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(|e| SequencerError::io(path, e))?;
                let size = committed_size(&mut file, path)?;
                file.set_len(size)
                    .map_err(|e| SequencerError::io(path, e))?;

                let mut bytes = Vec::with_capacity(size as usize);
                file.seek(SeekFrom::Start(0))
                    .and_then(|_| file.read_to_end(&mut bytes))
                    .map_err(|e| SequencerError::io(path, e))?;
                let metadata = decode(&bytes, path)?;
                Ok((
                    metadata,
                    Some(MetaFile {
                        file,
                        path: path.to_path_buf(),
                    }),
                ))
            }
        }
    }

    /// Read-only load that waits out an in-flight write, up to `attempts`
    /// tries. Only `NotCommitted` is retried.
    pub fn read_committed(path: &Path, attempts: u32) -> Result<SequencerMetadata> {
        let mut attempt = 1;
        loop {
            match SequencerMetadata::open(path, OpenMode::ReadOnly) {
                Err(SequencerError::NotCommitted { .. }) if attempt < attempts => {
                    attempt += 1;
                    thread::sleep(NOT_COMMITTED_BACKOFF);
                }
                other => return other.map(|(metadata, _)| metadata),
            }
        }
    }
}

/// Racy read of the table id, without parsing the rest of the file.
pub fn read_table_id(path: &Path) -> Result<i32> {
    let mut file = File::open(path).map_err(|e| SequencerError::io(path, e))?;
    let mut buf = [0u8; 4];
    file.seek(SeekFrom::Start(META_TABLE_ID_OFFSET))
        .and_then(|_| file.read_exact(&mut buf))
        .map_err(|e| SequencerError::io(path, e))?;
    Ok(i32::from_le_bytes(buf))
}

fn committed_size(file: &mut File, path: &Path) -> Result<u64> {
    let len = file
        .metadata()
        .map_err(|e| SequencerError::io(path, e))?
        .len();
    if len < 4 {
        return Err(SequencerError::NotCommitted {
            path: path.to_path_buf(),
        });
    }
    let mut buf = [0u8; 4];
    file.seek(SeekFrom::Start(SIZE_OFFSET))
        .and_then(|_| file.read_exact(&mut buf))
        .map_err(|e| SequencerError::io(path, e))?;
    let size = i32::from_le_bytes(buf);
    if size <= 0 || size as u64 > len {
        return Err(SequencerError::NotCommitted {
            path: path.to_path_buf(),
        });
    }
    Ok(size as u64)
}

/// Write the header and columns behind a zero size. Returns the payload size.
pub(crate) fn write_body<W: Write + Seek>(metadata: &SequencerMetadata, out: &mut W) -> io::Result<u64> {
    let timestamp_index = metadata.timestamp_index().map_or(-1, |i| i as i32);

    out.seek(SeekFrom::Start(SIZE_OFFSET))?;
    // placeholder until the payload is complete
    out.write_all(&0i32.to_le_bytes())?;
    out.write_all(&META_FORMAT_VERSION.to_le_bytes())?;
    out.write_all(&(metadata.structure_version() as i64).to_le_bytes())?;
    out.write_all(&(metadata.column_count() as i32).to_le_bytes())?;
    out.write_all(&timestamp_index.to_le_bytes())?;
    out.write_all(&metadata.table_id().to_le_bytes())?;
    for column in metadata.columns() {
        out.write_all(&column.stored_type().to_le_bytes())?;
        let name = column.name().as_bytes();
        out.write_all(&(name.len() as i32).to_le_bytes())?;
        out.write_all(name)?;
    }
    out.stream_position()
}

/// Commit a body written by `write_body`.
pub(crate) fn write_size<W: Write + Seek>(out: &mut W, size: u64) -> io::Result<()> {
    out.seek(SeekFrom::Start(SIZE_OFFSET))?;
    out.write_all(&(size as i32).to_le_bytes())?;
    out.seek(SeekFrom::Start(size))?;
    Ok(())
}

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
    path: &'a Path,
}

impl<'a> ByteReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.buf.len());
        match end {
            Some(end) => {
                let bytes = &self.buf[self.pos..end];
                self.pos = end;
                Ok(bytes)
            }
            None => Err(SequencerError::corrupt(
                self.path,
                format!("record at offset {} runs past the declared size", self.pos),
            )),
        }
    }

    fn i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes(bytes.try_into().unwrap_or([0; 4])))
    }

    fn i64(&mut self) -> Result<i64> {
        let bytes = self.take(8)?;
        Ok(i64::from_le_bytes(bytes.try_into().unwrap_or([0; 8])))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.i32()?;
        if len < 0 {
            return Err(SequencerError::corrupt(
                self.path,
                format!("negative string length {len}"),
            ));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| SequencerError::corrupt(self.path, "column name is not UTF-8"))
    }
}

pub(crate) fn decode(bytes: &[u8], path: &Path) -> Result<SequencerMetadata> {
    if bytes.len() < 4 {
        return Err(SequencerError::NotCommitted {
            path: path.to_path_buf(),
        });
    }
    let size = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if size <= 0 || size as usize > bytes.len() {
        return Err(SequencerError::NotCommitted {
            path: path.to_path_buf(),
        });
    }
    if (size as usize) < HEADER_SIZE {
        return Err(SequencerError::corrupt(
            path,
            format!("declared size {size} is smaller than the header"),
        ));
    }

    let mut reader = ByteReader {
        buf: &bytes[..size as usize],
        pos: 4,
        path,
    };
    let format_version = reader.i32()?;
    if format_version != META_FORMAT_VERSION {
        return Err(SequencerError::corrupt(
            path,
            format!("unsupported format version {format_version}"),
        ));
    }
    let structure_version = reader.i64()?;
    let column_count = reader.i32()?;
    let timestamp_index = reader.i32()?;
    let table_id = reader.i32()?;
    let timestamp_in_range = timestamp_index == -1 || (0..column_count).contains(&timestamp_index);
    if structure_version < 0 || column_count < 0 || !timestamp_in_range {
        return Err(SequencerError::corrupt(path, "header values out of range"));
    }

    // each column takes at least a type code and a name length
    let column_room = (size as usize - HEADER_SIZE) / MIN_COLUMN_SIZE;
    if column_count as usize > column_room {
        return Err(SequencerError::corrupt(
            path,
            format!("{column_count} columns do not fit in {size} bytes"),
        ));
    }

    let mut columns = Vec::with_capacity(column_count as usize);
    for _ in 0..column_count {
        let stored_type = reader.i32()?;
        let name = reader.string()?;
        let code = stored_type.checked_abs().unwrap_or(i32::MAX);
        let column_type = ColumnType::from_code(code).ok_or_else(|| {
            SequencerError::corrupt(path, format!("unknown column type {stored_type}"))
        })?;
        columns.push((name, column_type, stored_type < 0));
    }

    let timestamp_index = (timestamp_index >= 0).then_some(timestamp_index as usize);
    SequencerMetadata::from_parts(table_id, structure_version as u64, timestamp_index, columns)
        .map_err(|reason| SequencerError::corrupt(path, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TableSchema;
    use std::io::Cursor;

    fn sample() -> SequencerMetadata {
        let schema = TableSchema::new()
            .column("a", ColumnType::Int)
            .column("b", ColumnType::Symbol)
            .timestamp("c");
        let mut metadata = SequencerMetadata::new();
        metadata.copy_from(&schema, "t", 11, 0).unwrap();
        metadata
    }

    #[test]
    fn size_is_written_last_and_covers_payload() {
        let mut out = Cursor::new(Vec::new());
        let size = write_body(&sample(), &mut out).unwrap();
        assert_eq!(&out.get_ref()[0..4], &[0; 4]);

        write_size(&mut out, size).unwrap();
        let bytes = out.into_inner();
        assert_eq!(bytes.len() as u64, size);
        assert_eq!(i32::from_le_bytes(bytes[0..4].try_into().unwrap()) as u64, size);
        assert_eq!(i32::from_le_bytes(bytes[24..28].try_into().unwrap()), 11);
    }

    #[test]
    fn dump_and_open_reproduce_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_meta");

        let mut metadata = sample();
        metadata.remove_column("b").unwrap();
        metadata.add_column("d", ColumnType::Double).unwrap();
        metadata.dump_to(&path).unwrap();

        let (loaded, handle) = SequencerMetadata::open(&path, OpenMode::ReadOnly).unwrap();
        assert!(handle.is_none());
        assert_eq!(loaded.columns(), metadata.columns());
        assert_eq!(loaded.timestamp_index(), Some(2));
        assert_eq!(loaded.table_id(), 11);
        assert_eq!(loaded.structure_version(), 2);
        assert_eq!(loaded.column_index("b"), None);
        assert_eq!(loaded.column_index("d"), Some(3));
    }

    #[test]
    fn zero_size_means_not_committed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_meta");
        sample().dump_to(&path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[0..4].copy_from_slice(&0i32.to_le_bytes());
        fs::write(&path, &bytes).unwrap();

        let err = SequencerMetadata::open(&path, OpenMode::ReadOnly).unwrap_err();
        assert!(matches!(err, SequencerError::NotCommitted { .. }));
        let err = SequencerMetadata::read_committed(&path, 3).unwrap_err();
        assert!(matches!(err, SequencerError::NotCommitted { .. }));
    }

    #[test]
    fn short_file_means_not_committed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_meta");
        sample().dump_to(&path).unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let err = SequencerMetadata::open(&path, OpenMode::ReadWrite).unwrap_err();
        assert!(matches!(err, SequencerError::NotCommitted { .. }));
    }

    #[test]
    fn read_write_open_truncates_stale_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_meta");
        sample().dump_to(&path).unwrap();
        let committed = fs::metadata(&path).unwrap().len();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"half-written garbage").unwrap();
        drop(file);

        let (loaded, handle) = SequencerMetadata::open(&path, OpenMode::ReadWrite).unwrap();
        assert!(handle.is_some());
        assert_eq!(loaded.column_count(), 3);
        assert_eq!(fs::metadata(&path).unwrap().len(), committed);
    }

    #[test]
    fn shrinking_rewrite_is_bounded_by_declared_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_meta");
        let mut metadata = sample();
        metadata.rename_column("a", "a_much_longer_name").unwrap();
        let mut file = metadata.dump_to(&path).unwrap();

        metadata.rename_column("a_much_longer_name", "a").unwrap();
        file.sync(&metadata).unwrap();

        let loaded = SequencerMetadata::read_committed(&path, 1).unwrap();
        assert_eq!(loaded.column(0).unwrap().name(), "a");
        assert_eq!(loaded.structure_version(), 2);
    }

    #[test]
    fn unknown_type_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_meta");
        sample().dump_to(&path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&77i32.to_le_bytes());
        fs::write(&path, &bytes).unwrap();

        let err = SequencerMetadata::open(&path, OpenMode::ReadOnly).unwrap_err();
        assert!(matches!(err, SequencerError::Corrupt { .. }));
    }

    #[test]
    fn column_count_larger_than_the_file_is_corrupt() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(HEADER_SIZE as i32).to_le_bytes());
        bytes.extend_from_slice(&META_FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&0i64.to_le_bytes());
        bytes.extend_from_slice(&i32::MAX.to_le_bytes());
        bytes.extend_from_slice(&(-1i32).to_le_bytes());
        bytes.extend_from_slice(&7i32.to_le_bytes());

        let err = decode(&bytes, Path::new("_meta")).unwrap_err();
        assert!(matches!(err, SequencerError::Corrupt { .. }));

        // one column short of what the header claims
        let mut out = Cursor::new(Vec::new());
        let size = write_body(&sample(), &mut out).unwrap();
        write_size(&mut out, size).unwrap();
        let mut bytes = out.into_inner();
        bytes[16..20].copy_from_slice(&4i32.to_le_bytes());
        let err = decode(&bytes, Path::new("_meta")).unwrap_err();
        assert!(matches!(err, SequencerError::Corrupt { .. }));
    }

    #[test]
    fn most_negative_type_code_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_meta");
        sample().dump_to(&path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&i32::MIN.to_le_bytes());
        fs::write(&path, &bytes).unwrap();

        let err = SequencerMetadata::open(&path, OpenMode::ReadOnly).unwrap_err();
        assert!(matches!(err, SequencerError::Corrupt { .. }));
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_meta");
        MetaFile::create(&path).unwrap();

        let err = MetaFile::create(&path).unwrap_err();
        assert!(matches!(err, SequencerError::AlreadyExists { .. }));
    }

    #[test]
    fn table_id_is_readable_without_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_meta");
        sample().dump_to(&path).unwrap();

        assert_eq!(read_table_id(&path).unwrap(), 11);
    }
}
