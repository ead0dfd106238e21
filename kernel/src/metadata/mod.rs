// Sequencer Metadata
//
// In-memory schema snapshot of a WAL table. Removed columns stay in place as
// tombstones so ordinals referenced by already-written WAL segments remain
// valid; only `to_reader_indexes` compacts them away.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{Result, SequencerError};
use crate::schema::{ColumnType, TableStructure};

mod file;

pub use file::{read_table_id, MetaFile, OpenMode, META_FORMAT_VERSION, META_TABLE_ID_OFFSET};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    name: String,
    column_type: ColumnType,
    deleted: bool,
}

impl Column {
    fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            deleted: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Type code as written to disk, negative for a removed column.
    pub fn stored_type(&self) -> i32 {
        if self.deleted {
            -self.column_type.code()
        } else {
            self.column_type.code()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SequencerMetadata {
    table_name: String,
    table_id: i32,
    structure_version: u64,
    timestamp_index: Option<usize>,
    columns: Vec<Column>,
    // lower-cased live column name -> ordinal
    #[serde(skip)]
    name_index: HashMap<String, usize>,
}

fn index_key(name: &str) -> String {
    name.to_lowercase()
}

impl SequencerMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn set_table_name(&mut self, table_name: impl Into<String>) {
        self.table_name = table_name.into();
    }

    pub fn table_id(&self) -> i32 {
        self.table_id
    }

    pub fn structure_version(&self) -> u64 {
        self.structure_version
    }

    pub fn timestamp_index(&self) -> Option<usize> {
        self.timestamp_index
    }

    /// All columns, tombstones included.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn live_column_count(&self) -> usize {
        self.name_index.len()
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    /// Ordinal of a live column, matched case-insensitively.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.name_index.get(&index_key(name)).copied()
    }

    pub fn add_column(&mut self, name: &str, column_type: ColumnType) -> Result<()> {
        self.add_column0(name, column_type)?;
        self.structure_version += 1;
        Ok(())
    }

    pub fn remove_column(&mut self, name: &str) -> Result<()> {
        let index = self.column_index(name).ok_or_else(|| SequencerError::ColumnNotFound {
            name: name.to_string(),
        })?;
        let column = &mut self.columns[index];
        column.deleted = true;
        let key = index_key(&column.name);
        self.name_index.remove(&key);
        self.structure_version += 1;
        Ok(())
    }

    pub fn rename_column(&mut self, name: &str, new_name: &str) -> Result<()> {
        let index = self.column_index(name).ok_or_else(|| SequencerError::ColumnNotFound {
            name: name.to_string(),
        })?;
        let new_key = index_key(new_name);
        if matches!(self.name_index.get(&new_key), Some(&other) if other != index) {
            return Err(SequencerError::DuplicateColumn {
                name: new_name.to_string(),
            });
        }

        let column_type = self.columns[index].column_type;
        self.name_index.remove(&index_key(name));
        self.columns[index] = Column::new(new_name, column_type);
        self.name_index.insert(new_key, index);
        self.structure_version += 1;
        Ok(())
    }

    /// Rebuild the whole column list from a descriptor. On error `self` is
    /// left as it was.
    pub fn copy_from(
        &mut self,
        structure: &dyn TableStructure,
        table_name: &str,
        table_id: i32,
        structure_version: u64,
    ) -> Result<()> {
        let mut fresh = SequencerMetadata {
            table_name: table_name.to_string(),
            table_id,
            timestamp_index: structure.timestamp_index(),
            ..SequencerMetadata::default()
        };
        for i in 0..structure.column_count() {
            fresh.add_column0(structure.column_name(i), structure.column_type(i))?;
        }
        if let Some(ts) = fresh.timestamp_index {
            if ts >= fresh.columns.len() {
                return Err(SequencerError::ColumnNotFound {
                    name: format!("timestamp column #{ts}"),
                });
            }
        }
        fresh.structure_version = structure_version;
        *self = fresh;
        Ok(())
    }

    /// Copy another snapshot wholesale, tombstones included.
    pub fn copy_from_metadata(&mut self, other: &SequencerMetadata) {
        self.clone_from(other);
    }

    /// Drop tombstoned columns, producing the dense view handed to readers.
    pub fn to_reader_indexes(&mut self) {
        let mut timestamp_index = None;
        let mut live = Vec::with_capacity(self.name_index.len());
        for (i, column) in self.columns.drain(..).enumerate() {
            if column.deleted {
                continue;
            }
            if self.timestamp_index == Some(i) {
                timestamp_index = Some(live.len());
            }
            live.push(column);
        }

        self.name_index = live
            .iter()
            .enumerate()
            .map(|(i, c)| (index_key(&c.name), i))
            .collect();
        self.columns = live;
        self.timestamp_index = timestamp_index;
    }

    /// Compacted copy of this snapshot.
    pub fn reader_view(&self) -> SequencerMetadata {
        let mut view = self.clone();
        view.to_reader_indexes();
        view
    }

    fn add_column0(&mut self, name: &str, column_type: ColumnType) -> Result<()> {
        let key = index_key(name);
        if self.name_index.contains_key(&key) {
            return Err(SequencerError::DuplicateColumn {
                name: name.to_string(),
            });
        }
        self.name_index.insert(key, self.columns.len());
        self.columns.push(Column::new(name, column_type));
        Ok(())
    }

    // Used by the decoder, which already validated the stored layout.
    pub(crate) fn from_parts(
        table_id: i32,
        structure_version: u64,
        timestamp_index: Option<usize>,
        columns: Vec<(String, ColumnType, bool)>,
    ) -> std::result::Result<Self, String> {
        let mut metadata = SequencerMetadata {
            table_id,
            structure_version,
            timestamp_index,
            ..SequencerMetadata::default()
        };
        for (i, (name, column_type, deleted)) in columns.into_iter().enumerate() {
            if !deleted {
                let previous = metadata.name_index.insert(index_key(&name), i);
                if previous.is_some() {
                    return Err(format!("duplicate live column name {name}"));
                }
            }
            metadata.columns.push(Column {
                name,
                column_type,
                deleted,
            });
        }
        Ok(metadata)
    }
}
