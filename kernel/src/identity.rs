// Table Identity
//
// Immutable handle for a table. The numeric id and physical directory
// identify the table; the logical name is display-only and follows renames.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Identity of a WAL table.
///
/// Hashing uses only `table_id`. Equality requires both `table_id` and
/// `dir_name`, so two tables that happen to share an id still compare
/// unequal. The logical name takes part in neither, which keeps hash-keyed
/// containers valid across renames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableIdentity {
    logical_name: String,
    dir_name: String,
    table_id: i32,
    wal_enabled: bool,
}

impl TableIdentity {
    pub fn new(
        logical_name: impl Into<String>,
        dir_name: impl Into<String>,
        table_id: i32,
        wal_enabled: bool,
    ) -> Self {
        Self {
            logical_name: logical_name.into(),
            dir_name: dir_name.into(),
            table_id,
            wal_enabled,
        }
    }

    /// Name for logs and display. Never use it as a key.
    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    /// Directory the table lives in. Stable across renames.
    pub fn dir_name(&self) -> &str {
        &self.dir_name
    }

    pub fn table_id(&self) -> i32 {
        self.table_id
    }

    pub fn is_wal(&self) -> bool {
        self.wal_enabled
    }

    /// Replace the display name, leaving identity untouched.
    pub fn rename(&mut self, logical_name: impl Into<String>) {
        self.logical_name = logical_name.into();
    }

    /// Copy of this identity under a new display name.
    pub fn renamed(&self, logical_name: impl Into<String>) -> Self {
        let mut identity = self.clone();
        identity.rename(logical_name);
        identity
    }

    /// Same table, regardless of display name.
    pub fn same_table(&self, other: &TableIdentity) -> bool {
        self.table_id == other.table_id && self.dir_name == other.dir_name
    }
}

impl PartialEq for TableIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.same_table(other)
    }
}

impl Eq for TableIdentity {}

impl Hash for TableIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.table_id.hash(state);
    }
}

impl fmt::Display for TableIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.logical_name, self.table_id)
    }
}
