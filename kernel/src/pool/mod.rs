// Sequencer Pool
//
// Process-wide registry of table sequencers. Lookups create or open the
// sequencer on first use, replace distressed instances, and hand out read,
// write or unlocked leases. Idle instances are closed by `release_inactive`.

pub mod config;
mod entry;
pub mod registry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, error, info};

use crate::clock::MicrosecondClock;
use crate::error::{Result, SequencerError};
use crate::identity::TableIdentity;
use crate::log::{read_max_txn, MetadataChangeCursor, TransactionLogCursor, Txn};
use crate::metadata::{read_table_id, SequencerMetadata};
use crate::schema::{SchemaChange, TableStructure};
use crate::sequencer::{sequencer_dir, TableSequencer, META_FILE_NAME, TXNLOG_FILE_NAME};

pub use config::PoolConfig;
pub use entry::{SequencerReadHandle, SequencerSnapshot, SequencerWriteHandle};
pub use registry::{InMemoryTableRegistry, TableRegistry};

use entry::{Lease, LeaseGuard, ReadGuard, SequencerEntry, Unlocked, WriteGuard};

pub struct SequencerPool {
    config: PoolConfig,
    clock: Arc<dyn MicrosecondClock>,
    registry: DashMap<TableIdentity, Arc<SequencerEntry>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SequencerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequencerPool")
            .field("root", &self.config.root)
            .field("resident", &self.registry.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SequencerPool {
    /// Empty pool. Sequencers are opened lazily on first lookup.
    pub fn new(config: PoolConfig, clock: Arc<dyn MicrosecondClock>) -> Self {
        Self {
            config,
            clock,
            registry: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Create the sequencer files for a new table and keep the instance
    /// resident.
    pub fn register_table(
        &self,
        table_id: i32,
        structure: &dyn TableStructure,
        identity: &TableIdentity,
    ) -> Result<()> {
        let (guard, lease) = self.acquire::<WriteGuard>(identity, Some((table_id, structure)))?;
        drop(SequencerWriteHandle::new(guard, lease));
        info!(table = %identity, table_id, "registered wal table");
        Ok(())
    }

    /// Shared access. Several readers may hold the same table at once.
    pub fn read(&self, identity: &TableIdentity) -> Result<SequencerReadHandle<'_>> {
        let (guard, lease) = self.acquire::<ReadGuard>(identity, None)?;
        Ok(SequencerReadHandle::new(guard, lease))
    }

    /// Exclusive access.
    pub fn write(&self, identity: &TableIdentity) -> Result<SequencerWriteHandle<'_>> {
        let (guard, lease) = self.acquire::<WriteGuard>(identity, None)?;
        Ok(SequencerWriteHandle::new(guard, lease))
    }

    /// Last published counters, read without locking the sequencer.
    pub fn peek(&self, identity: &TableIdentity) -> Result<SequencerSnapshot> {
        let (_, lease) = self.acquire::<Unlocked>(identity, None)?;
        Ok(lease.entry.snapshot())
    }

    /// Commit a data txn under the table's write lock.
    pub fn next_txn(
        &self,
        identity: &TableIdentity,
        expected_structure_version: u64,
        wal_id: u32,
        segment_id: u32,
        segment_txn: u64,
    ) -> Result<Txn> {
        self.write(identity)?
            .next_txn(expected_structure_version, wal_id, segment_id, segment_txn)
    }

    /// Commit a schema change under the table's write lock.
    pub fn next_structure_txn(
        &self,
        identity: &TableIdentity,
        expected_structure_version: u64,
        change: &SchemaChange,
    ) -> Result<Txn> {
        self.write(identity)?
            .next_structure_txn(expected_structure_version, change)
    }

    /// Last committed txn, read under a shared lock.
    pub fn last_txn(&self, identity: &TableIdentity) -> Result<Txn> {
        Ok(self.read(identity)?.last_txn())
    }

    /// Allocate a WAL id under a shared lock.
    pub fn next_wal_id(&self, identity: &TableIdentity) -> Result<u32> {
        self.read(identity)?.next_wal_id()
    }

    pub fn transaction_log_cursor(
        &self,
        identity: &TableIdentity,
        from: Txn,
    ) -> Result<TransactionLogCursor> {
        self.read(identity)?.transaction_log_cursor(from)
    }

    pub fn metadata_change_log_cursor(
        &self,
        identity: &TableIdentity,
        from_structure_version: u64,
    ) -> Result<MetadataChangeCursor> {
        self.read(identity)?
            .metadata_change_log_cursor(from_structure_version)
    }

    /// Copy the table's reader metadata into `sink`. Returns the last txn.
    pub fn table_metadata(
        &self,
        identity: &TableIdentity,
        sink: &mut SequencerMetadata,
    ) -> Result<Txn> {
        Ok(self.read(identity)?.table_metadata(sink))
    }

    /// Refresh `sink` only when the sequencer has moved past
    /// `expected_structure_version`. Returns true if `sink` was refreshed.
    pub fn reload_metadata_conditionally(
        &self,
        identity: &TableIdentity,
        expected_structure_version: u64,
        sink: &mut SequencerMetadata,
    ) -> Result<bool> {
        let sequencer = self.read(identity)?;
        if sequencer.structure_version() == expected_structure_version {
            return Ok(false);
        }
        sequencer.table_metadata(sink);
        Ok(true)
    }

    /// Append the drop marker. When cleaning up after a failed create, a
    /// failure is logged and swallowed.
    pub fn drop_table(&self, identity: &TableIdentity, failed_create: bool) -> Result<()> {
        info!(table = %identity, failed_create, "dropping wal table");
        let result = self
            .write(identity)
            .and_then(|mut sequencer| sequencer.drop_table());
        match result {
            Ok(txn) => {
                info!(table = %identity, txn, "dropped wal table");
                Ok(())
            }
            Err(e) if failed_create => {
                info!(table = %identity, error = %e, "could not drop table after failed create");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Point the resident sequencer at a new display name.
    pub fn rename_table(&self, identity: &TableIdentity, new_identity: &TableIdentity) -> Result<()> {
        self.write(identity)?.rename(new_identity)?;
        info!(from = identity.logical_name(), to = new_identity.logical_name(), "renamed wal table");
        Ok(())
    }

    /// Suspend a table; new txns fail with `Suspended` until resumed.
    pub fn suspend_table(&self, identity: &TableIdentity) -> Result<()> {
        self.write(identity)?.suspend_table()
    }

    /// Resume a suspended table.
    pub fn resume_table(&self, identity: &TableIdentity) -> Result<()> {
        self.write(identity)?.resume_table()
    }

    /// Whether the table is suspended. Opens the sequencer if needed.
    pub fn is_suspended(&self, identity: &TableIdentity) -> Result<bool> {
        Ok(self.read(identity)?.is_suspended())
    }

    /// Mark the table's instance as unusable. The next lookup opens a fresh
    /// one from disk.
    pub fn set_distressed(&self, identity: &TableIdentity) -> Result<()> {
        self.write(identity)?.set_distressed();
        Ok(())
    }

    /// Number of sequencers currently held in memory.
    pub fn resident_count(&self) -> usize {
        self.registry.len()
    }

    /// Whether a sequencer for the table is currently in the registry.
    pub fn is_resident(&self, identity: &TableIdentity) -> bool {
        self.registry.contains_key(identity)
    }

    /// Close sequencers idle for longer than the configured TTL. Returns true
    /// if anything was closed.
    pub fn release_inactive(&self) -> bool {
        let deadline = self.clock.ticks().saturating_sub(self.config.inactive_ttl_us());
        self.release_entries(deadline)
    }

    /// Close every sequencer that nobody holds.
    pub fn release_all(&self) -> bool {
        self.release_entries(u64::MAX)
    }

    fn release_entries(&self, deadline: u64) -> bool {
        let candidates: Vec<(TableIdentity, Arc<SequencerEntry>)> = self
            .registry
            .iter()
            .map(|r| (r.key().clone(), Arc::clone(r.value())))
            .collect();

        let mut removed = false;
        for (identity, entry) in candidates {
            if entry.release_time() <= deadline && entry.check_close() {
                self.registry
                    .remove_if(&identity, |_, v| Arc::ptr_eq(v, &entry));
                info!(table = %identity, "released inactive table sequencer");
                removed = true;
            }
        }
        removed
    }

    /// Stop serving lookups and close everything not currently held. Held
    /// sequencers close when their last handle is dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.release_all();
        info!(resident = self.registry.len(), "sequencer pool closed");
    }

    /// True after `close`.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Visit every WAL table (and every dropped table) known to `tables`
    /// with its id and last txn. Tables that are not resident are read from
    /// their files without being opened. A table that cannot be read, or
    /// whose callback fails, is logged and skipped.
    pub fn for_all_wal_tables<F>(&self, tables: &dyn TableRegistry, mut callback: F)
    where
        F: FnMut(i32, &TableIdentity, Txn) -> Result<()>,
    {
        for identity in tables.table_identities() {
            if !identity.is_wal() && !tables.is_table_dropped(&identity) {
                continue;
            }

            let counters = if self.is_resident(&identity) {
                self.peek(&identity)
                    .map(|s| (i64::from(s.table_id), s.last_txn as i64))
            } else {
                self.read_counters_from_files(&identity)
            };
            let (table_id, last_txn) = match counters {
                Ok(counters) => counters,
                Err(e) => {
                    error!(table = %identity, error = %e, "could not read table sequencer");
                    continue;
                }
            };
            if table_id < 0 || last_txn < 0 {
                error!(table = %identity, table_id, last_txn, "table sequencer files are not readable");
                continue;
            }

            if let Err(e) = callback(table_id as i32, &identity, last_txn as Txn) {
                error!(table = %identity, error = %e, "could not process wal table");
            }
        }
    }

    // Both values sit at fixed offsets; no lock is taken and no instance is
    // opened.
    fn read_counters_from_files(&self, identity: &TableIdentity) -> Result<(i64, i64)> {
        let dir = sequencer_dir(&self.config.root, identity);
        let table_id = read_table_id(&dir.join(META_FILE_NAME))?;
        let last_txn = read_max_txn(&dir.join(TXNLOG_FILE_NAME))?;
        Ok((i64::from(table_id), last_txn))
    }

    fn acquire<G: LeaseGuard>(
        &self,
        identity: &TableIdentity,
        create: Option<(i32, &dyn TableStructure)>,
    ) -> Result<(G, Lease<'_>)> {
        let max_attempts = self.config.recreate_distressed_attempts.max(1);
        let mut attempts = 0;
        loop {
            if self.is_closed() {
                return Err(SequencerError::PoolClosed);
            }

            let entry = self.entry_for(identity, create)?;
            let mut lease = Lease::new(self, identity, entry);
            let guard = G::lock(&lease.entry);

            if lease.entry.is_closed() {
                drop(guard);
                self.registry
                    .remove_if(identity, |_, v| Arc::ptr_eq(v, &lease.entry));
                drop(lease);
                thread::yield_now();
                continue;
            }

            if lease.entry.is_distressed() {
                drop(guard);
                self.registry
                    .remove_if(identity, |_, v| Arc::ptr_eq(v, &lease.entry));
                lease.retire = true;
                drop(lease);

                attempts += 1;
                if attempts >= max_attempts {
                    error!(table = %identity, attempts, "giving up on distressed table sequencer");
                    return Err(SequencerError::DistressedRetriesExhausted {
                        table: identity.dir_name().to_string(),
                        attempts,
                    });
                }
                debug!(table = %identity, attempts, "replacing distressed table sequencer");
                continue;
            }

            return Ok((guard, lease));
        }
    }

    // The registry shard stays locked while the sequencer is created or
    // opened, so only one instance per table is ever built at a time.
    fn entry_for(
        &self,
        identity: &TableIdentity,
        create: Option<(i32, &dyn TableStructure)>,
    ) -> Result<Arc<SequencerEntry>> {
        match self.registry.entry(identity.clone()) {
            Entry::Occupied(occupied) => {
                if create.is_some() {
                    return Err(SequencerError::AlreadyExists {
                        path: sequencer_dir(&self.config.root, identity),
                    });
                }
                Ok(Arc::clone(occupied.get()))
            }
            Entry::Vacant(vacant) => {
                let mut sequencer =
                    TableSequencer::new(identity.clone(), &self.config.root, Arc::clone(&self.clock));
                match create {
                    Some((table_id, structure)) => sequencer.create(table_id, structure)?,
                    // failure is logged and leaves the instance distressed
                    None => {
                        let _ = sequencer.open();
                    }
                }
                let entry = Arc::new(SequencerEntry::new(sequencer));
                vacant.insert(Arc::clone(&entry));
                Ok(entry)
            }
        }
    }

    fn release(&self, identity: &TableIdentity, entry: &Arc<SequencerEntry>, retire: bool) {
        if !retire && !self.is_closed() {
            entry.mark_released(self.clock.ticks());
            return;
        }
        if entry.check_close() {
            self.registry
                .remove_if(identity, |_, v| Arc::ptr_eq(v, entry));
            info!(table = %identity, "closed table sequencer");
        }
    }
}
