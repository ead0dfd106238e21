// Table Schema Descriptors
//
// Column types, the descriptor a table is created from, and the schema-change
// payload produced by the DDL layer.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::metadata::SequencerMetadata;

/// Column type with its stable on-disk code. Codes are always positive; the
/// metadata file stores the negated code for a removed column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Boolean,
    Byte,
    Short,
    Char,
    Int,
    Long,
    Date,
    Timestamp,
    Float,
    Double,
    String,
    Symbol,
    Long256,
    Binary,
    Uuid,
}

impl ColumnType {
    pub fn code(self) -> i32 {
        match self {
            ColumnType::Boolean => 1,
            ColumnType::Byte => 2,
            ColumnType::Short => 3,
            ColumnType::Char => 4,
            ColumnType::Int => 5,
            ColumnType::Long => 6,
            ColumnType::Date => 7,
            ColumnType::Timestamp => 8,
            ColumnType::Float => 9,
            ColumnType::Double => 10,
            ColumnType::String => 11,
            ColumnType::Symbol => 12,
            ColumnType::Long256 => 13,
            ColumnType::Binary => 18,
            ColumnType::Uuid => 19,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let column_type = match code {
            1 => ColumnType::Boolean,
            2 => ColumnType::Byte,
            3 => ColumnType::Short,
            4 => ColumnType::Char,
            5 => ColumnType::Int,
            6 => ColumnType::Long,
            7 => ColumnType::Date,
            8 => ColumnType::Timestamp,
            9 => ColumnType::Float,
            10 => ColumnType::Double,
            11 => ColumnType::String,
            12 => ColumnType::Symbol,
            13 => ColumnType::Long256,
            18 => ColumnType::Binary,
            19 => ColumnType::Uuid,
            _ => return None,
        };
        Some(column_type)
    }

    /// Parse the lower-case type name, as used by the CLI.
    pub fn parse(name: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(name.to_ascii_lowercase())).ok()
    }
}

/// Source of a full column list, used when a table is created or reloaded.
pub trait TableStructure {
    fn column_count(&self) -> usize;

    fn column_name(&self, index: usize) -> &str;

    fn column_type(&self, index: usize) -> ColumnType;

    /// Ordinal of the designated timestamp column, if any.
    fn timestamp_index(&self) -> Option<usize>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
}

/// Plain owned table descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
    pub timestamp_index: Option<usize>,
}

impl TableSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            column_type,
        });
        self
    }

    /// Add a column and mark it as the designated timestamp.
    pub fn timestamp(mut self, name: impl Into<String>) -> Self {
        self.timestamp_index = Some(self.columns.len());
        self.column(name, ColumnType::Timestamp)
    }
}

impl TableStructure for TableSchema {
    fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn column_name(&self, index: usize) -> &str {
        &self.columns[index].name
    }

    fn column_type(&self, index: usize) -> ColumnType {
        self.columns[index].column_type
    }

    fn timestamp_index(&self) -> Option<usize> {
        self.timestamp_index
    }
}

/// A structural change produced by the DDL layer. The sequencer applies it to
/// its metadata and stores it opaquely for replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaChange {
    AddColumn {
        name: String,
        column_type: ColumnType,
    },
    RemoveColumn {
        name: String,
    },
    RenameColumn {
        name: String,
        new_name: String,
    },
}

impl SchemaChange {
    /// Apply the change, bumping the structure version by one on success.
    pub fn apply_to(&self, metadata: &mut SequencerMetadata) -> Result<()> {
        match self {
            SchemaChange::AddColumn { name, column_type } => metadata.add_column(name, *column_type),
            SchemaChange::RemoveColumn { name } => metadata.remove_column(name),
            SchemaChange::RenameColumn { name, new_name } => metadata.rename_column(name, new_name),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
