// Table Registry
//
// The host's catalogue of tables, consulted by fleet-wide scans.

use std::collections::HashSet;

use parking_lot::RwLock;

use crate::identity::TableIdentity;

/// Source of table identities for `SequencerPool::for_all_wal_tables`.
pub trait TableRegistry: Send + Sync {
    fn table_identities(&self) -> Vec<TableIdentity>;

    /// Dropped tables are still scanned so their ledgers can be purged.
    fn is_table_dropped(&self, identity: &TableIdentity) -> bool;
}

/// Registry kept in memory, used by the CLI and in tests.
#[derive(Debug, Default)]
pub struct InMemoryTableRegistry {
    tables: RwLock<Vec<TableIdentity>>,
    dropped: RwLock<HashSet<TableIdentity>>,
}

impl InMemoryTableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, identity: TableIdentity) {
        let mut tables = self.tables.write();
        match tables.iter_mut().find(|t| t.same_table(&identity)) {
            Some(existing) => *existing = identity,
            None => tables.push(identity),
        }
    }

    pub fn mark_dropped(&self, identity: &TableIdentity) {
        self.dropped.write().insert(identity.clone());
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }
}

impl TableRegistry for InMemoryTableRegistry {
    fn table_identities(&self) -> Vec<TableIdentity> {
        self.tables.read().clone()
    }

    fn is_table_dropped(&self, identity: &TableIdentity) -> bool {
        self.dropped.read().contains(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_replaces_renamed_table() {
        let registry = InMemoryTableRegistry::new();
        let trades = TableIdentity::new("trades", "trades~1", 1, true);
        registry.register(trades.clone());
        registry.register(trades.renamed("fills"));

        let tables = registry.table_identities();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].logical_name(), "fills");
    }

    #[test]
    fn dropped_flag_follows_identity_not_name() {
        let registry = InMemoryTableRegistry::new();
        let trades = TableIdentity::new("trades", "trades~1", 1, true);
        registry.register(trades.clone());
        registry.mark_dropped(&trades);

        assert!(registry.is_table_dropped(&trades.renamed("fills")));
        assert!(!registry.is_table_dropped(&TableIdentity::new("trades", "trades~2", 2, true)));
    }
}
