// Table Sequencer
//
// Per-table owner of the ledger and metadata files. Assigns txn numbers to
// data commits and structure changes from one counter.
//
// The sequencer does no locking of its own: mutating calls take `&mut self`
// and the pool hands out `&mut` only under the table's exclusive lock.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::clock::MicrosecondClock;
use crate::error::{Result, SequencerError};
use crate::identity::TableIdentity;
use crate::log::{
    MetadataChangeCursor, MetadataChangeLog, TransactionKind, TransactionLog,
    TransactionLogCursor, Txn, WalIdAllocator,
};
use crate::metadata::{MetaFile, OpenMode, SequencerMetadata};
use crate::replay::replay_metadata;
use crate::schema::{SchemaChange, TableStructure};
use crate::state::{SequencerState, SequencerStateMachine, StateEvent};

pub const SEQ_DIR: &str = "txn_seq";
pub const META_FILE_NAME: &str = "_meta";
pub const TXNLOG_FILE_NAME: &str = "_txnlog";
pub const META_CHANGES_FILE_NAME: &str = "_meta.changes";
/// Metadata as created, at structure version 0. Never rewritten.
pub const META_INIT_FILE_NAME: &str = "_meta.init";
pub const WAL_INDEX_FILE_NAME: &str = "_wal_index.d";

/// Directory holding a table's sequencer files.
pub fn sequencer_dir(root: &Path, identity: &TableIdentity) -> PathBuf {
    root.join(identity.dir_name()).join(SEQ_DIR)
}

#[derive(Debug)]
struct SequencerFiles {
    meta: MetaFile,
    ledger: TransactionLog,
    changes: MetadataChangeLog,
    wal_ids: WalIdAllocator,
}

pub struct TableSequencer {
    identity: TableIdentity,
    dir: PathBuf,
    clock: Arc<dyn MicrosecondClock>,
    metadata: SequencerMetadata,
    files: Option<SequencerFiles>,
    state: SequencerStateMachine,
}

impl std::fmt::Debug for TableSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableSequencer")
            .field("identity", &self.identity)
            .field("dir", &self.dir)
            .field("state", &self.state.current_state())
            .field("structure_version", &self.metadata.structure_version())
            .field("last_txn", &self.last_txn())
            .finish()
    }
}

impl TableSequencer {
    /// Unopened instance. Call `create` or `open` before use.
    pub fn new(identity: TableIdentity, root: &Path, clock: Arc<dyn MicrosecondClock>) -> Self {
        let dir = sequencer_dir(root, &identity);
        Self {
            identity,
            dir,
            clock,
            metadata: SequencerMetadata::new(),
            files: None,
            state: SequencerStateMachine::new(),
        }
    }

    /// Initialise a fresh sequencer directory at structure version 0.
    pub fn create(&mut self, table_id: i32, structure: &dyn TableStructure) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| SequencerError::io(&self.dir, e))?;
        for name in [
            META_FILE_NAME,
            META_INIT_FILE_NAME,
            TXNLOG_FILE_NAME,
            META_CHANGES_FILE_NAME,
            WAL_INDEX_FILE_NAME,
        ] {
            let path = self.dir.join(name);
            if path.exists() {
                return Err(SequencerError::AlreadyExists { path });
            }
        }

        let mut metadata = SequencerMetadata::new();
        metadata.copy_from(structure, self.identity.logical_name(), table_id, 0)?;

        MetaFile::create(&self.dir.join(META_INIT_FILE_NAME))?.sync(&metadata)?;
        let mut meta = MetaFile::create(&self.dir.join(META_FILE_NAME))?;
        meta.sync(&metadata)?;
        let files = SequencerFiles {
            meta,
            ledger: TransactionLog::create(&self.dir.join(TXNLOG_FILE_NAME))?,
            changes: MetadataChangeLog::create(&self.dir.join(META_CHANGES_FILE_NAME))?,
            wal_ids: WalIdAllocator::create(&self.dir.join(WAL_INDEX_FILE_NAME))?,
        };

        info!(table = %self.identity, table_id, columns = metadata.column_count(), "created table sequencer");
        self.metadata = metadata;
        self.files = Some(files);
        Ok(())
    }

    /// Load metadata and ledger from disk. Any failure leaves the instance
    /// distressed.
    pub fn open(&mut self) -> Result<()> {
        match self.open0() {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(table = %self.identity, error = %e, "could not open table sequencer");
                self.files = None;
                self.state.apply(StateEvent::Distress)?;
                Err(e)
            }
        }
    }

    fn open0(&mut self) -> Result<()> {
        let mut ledger = TransactionLog::open(&self.dir.join(TXNLOG_FILE_NAME))?;
        let changes = MetadataChangeLog::open(&self.dir.join(META_CHANGES_FILE_NAME))?;
        let wal_ids = WalIdAllocator::open(&self.dir.join(WAL_INDEX_FILE_NAME))?;

        let meta_path = self.dir.join(META_FILE_NAME);
        let (mut metadata, meta) = match SequencerMetadata::open(&meta_path, OpenMode::ReadWrite) {
            Ok((metadata, Some(meta))) => (metadata, meta),
            Ok((_, None)) => {
                return Err(SequencerError::corrupt(meta_path, "metadata handle not retained"))
            }
            // nobody else writes `_meta`: this is a crash mid-sync
            Err(SequencerError::NotCommitted { .. }) => {
                self.rebuild_metadata(&mut ledger, &changes)?
            }
            Err(e) => return Err(e),
        };
        metadata.set_table_name(self.identity.logical_name());

        let mut files = SequencerFiles {
            meta,
            ledger,
            changes,
            wal_ids,
        };
        self.recover(&mut files, &mut metadata)?;

        let last = files.ledger.last_record()?;
        if last.map_or(false, |r| r.is_drop()) {
            self.state.apply(StateEvent::Drop)?;
        } else if files.ledger.is_suspended() {
            self.state.apply(StateEvent::Suspend)?;
        }

        debug!(
            table = %self.identity,
            last_txn = files.ledger.max_txn(),
            structure_version = metadata.structure_version(),
            "opened table sequencer"
        );
        self.metadata = metadata;
        self.files = Some(files);
        Ok(())
    }

    // Replay the change log over the creation snapshot, up to the version
    // the ledger has committed, and rewrite `_meta` from the result.
    fn rebuild_metadata(
        &self,
        ledger: &mut TransactionLog,
        changes: &MetadataChangeLog,
    ) -> Result<(SequencerMetadata, MetaFile)> {
        let (mut metadata, _) =
            SequencerMetadata::open(&self.dir.join(META_INIT_FILE_NAME), OpenMode::ReadOnly)?;
        let committed = ledger.last_record()?.map_or(0, |r| r.structure_version);

        let pending = changes
            .cursor(1)?
            .take_while(|c| c.as_ref().map_or(true, |c| c.structure_version <= committed));
        replay_metadata(&mut metadata, pending)
            .map_err(|e| SequencerError::corrupt(&self.dir, e.to_string()))?;
        if metadata.structure_version() != committed {
            return Err(SequencerError::corrupt(
                &self.dir,
                format!(
                    "change log reaches version {}, ledger is at {committed}",
                    metadata.structure_version()
                ),
            ));
        }

        let meta = metadata.dump_to(&self.dir.join(META_FILE_NAME))?;
        warn!(
            table = %self.identity,
            structure_version = committed,
            "rebuilt uncommitted metadata from change log"
        );
        Ok((metadata, meta))
    }

    // A structure change is written to the change log, then the ledger, then
    // the metadata file. A crash in between leaves the change log one version
    // ahead of `_meta`; roll it forward.
    fn recover(&self, files: &mut SequencerFiles, metadata: &mut SequencerMetadata) -> Result<()> {
        let meta_version = metadata.structure_version();
        let change_version = files.changes.last_version().unwrap_or(meta_version);
        if change_version == meta_version {
            return Ok(());
        }
        if change_version != meta_version + 1 {
            return Err(SequencerError::corrupt(
                &self.dir,
                format!("change log at version {change_version}, metadata at {meta_version}"),
            ));
        }

        let pending = files.changes.cursor(change_version)?.next().ok_or_else(|| {
            SequencerError::corrupt(&self.dir, "last structure change is unreadable")
        })??;
        pending
            .change
            .apply_to(metadata)
            .map_err(|e| SequencerError::corrupt(&self.dir, e.to_string()))?;

        let ledger_has_it = files
            .ledger
            .last_record()?
            .map_or(false, |r| r.is_structure_change() && r.structure_version == change_version);
        if !ledger_has_it {
            files.ledger.append(
                change_version,
                TransactionKind::StructureChange,
                self.clock.ticks(),
            )?;
        }
        files.meta.sync(metadata)?;

        warn!(
            table = %self.identity,
            structure_version = change_version,
            "rolled forward interrupted structure change"
        );
        Ok(())
    }

    /// Commit a data transaction written to WAL segment `segment_id` of WAL
    /// `wal_id`. Returns the assigned txn.
    pub fn next_txn(
        &mut self,
        expected_structure_version: u64,
        wal_id: u32,
        segment_id: u32,
        segment_txn: u64,
    ) -> Result<Txn> {
        self.check_writable()?;
        self.check_structure_version(expected_structure_version)?;

        let structure_version = self.metadata.structure_version();
        let now = self.clock.ticks();
        let kind = TransactionKind::Data {
            wal_id,
            segment_id,
            segment_txn,
        };
        let result = self.files_mut()?.ledger.append(structure_version, kind, now);
        let txn = self.escalate(result)?;

        debug!(table = %self.identity, txn, wal_id, segment_id, segment_txn, "committed data txn");
        Ok(txn)
    }

    /// Apply a schema change and commit it as the next txn. Schema errors
    /// leave the sequencer untouched.
    pub fn next_structure_txn(
        &mut self,
        expected_structure_version: u64,
        change: &SchemaChange,
    ) -> Result<Txn> {
        self.check_writable()?;
        self.check_structure_version(expected_structure_version)?;

        let mut next = self.metadata.clone();
        change.apply_to(&mut next)?;

        let now = self.clock.ticks();
        let result = self
            .files_mut()
            .and_then(|files| commit_structure_change(files, &next, change, now));
        let txn = self.escalate(result)?;

        debug!(
            table = %self.identity,
            txn,
            structure_version = next.structure_version(),
            "committed structure txn"
        );
        self.metadata = next;
        Ok(txn)
    }

    /// Append the drop marker. The table stops accepting transactions.
    pub fn drop_table(&mut self) -> Result<Txn> {
        match self.state() {
            SequencerState::Dropped => return Err(self.dropped_error()),
            SequencerState::Distressed | SequencerState::Closed => {
                return Err(self.distressed_error())
            }
            SequencerState::Active | SequencerState::Suspended => {}
        }

        let structure_version = self.metadata.structure_version();
        let now = self.clock.ticks();
        let result = self
            .files_mut()?
            .ledger
            .append(structure_version, TransactionKind::DropTable, now);
        let txn = self.escalate(result)?;
        self.state.apply(StateEvent::Drop)?;

        info!(table = %self.identity, txn, "dropped table sequencer");
        Ok(txn)
    }

    /// Pause allocation. Persisted in the ledger header.
    pub fn suspend_table(&mut self) -> Result<()> {
        self.set_suspended(true)
    }

    /// Lift a suspension.
    pub fn resume_table(&mut self) -> Result<()> {
        self.set_suspended(false)
    }

    fn set_suspended(&mut self, suspended: bool) -> Result<()> {
        match self.state() {
            SequencerState::Dropped => return Err(self.dropped_error()),
            SequencerState::Distressed | SequencerState::Closed => {
                return Err(self.distressed_error())
            }
            SequencerState::Active | SequencerState::Suspended => {}
        }

        let result = self.files_mut()?.ledger.set_suspended(suspended);
        self.escalate(result)?;
        let event = if suspended {
            StateEvent::Suspend
        } else {
            StateEvent::Resume
        };
        self.state.apply(event)?;

        info!(table = %self.identity, suspended, "table suspension changed");
        Ok(())
    }

    /// True while suspended.
    pub fn is_suspended(&self) -> bool {
        self.state() == SequencerState::Suspended
    }

    /// Mark this instance unusable so the pool replaces it. No-op once
    /// dropped or closed.
    pub fn set_distressed(&mut self) {
        if !matches!(self.state(), SequencerState::Dropped | SequencerState::Closed) {
            // Active, Suspended and Distressed all accept Distress
            let _ = self.state.apply(StateEvent::Distress);
        }
    }

    /// True once distressed. A distressed instance refuses all work.
    pub fn is_distressed(&self) -> bool {
        self.state() == SequencerState::Distressed
    }

    /// True after the drop marker was written or read back.
    pub fn is_dropped(&self) -> bool {
        self.state() == SequencerState::Dropped
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SequencerState::Closed
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SequencerState {
        self.state.current_state()
    }

    /// Release all file handles.
    pub fn close(&mut self) {
        self.files = None;
        let _ = self.state.apply(StateEvent::Close);
    }

    /// Adopt a new display name. The new identity must name the same table.
    pub fn rename(&mut self, new_identity: &TableIdentity) -> Result<()> {
        if !self.identity.same_table(new_identity) {
            return Err(SequencerError::IdentityMismatch(format!(
                "cannot rename {} to {}",
                self.identity, new_identity
            )));
        }
        self.identity.rename(new_identity.logical_name());
        self.metadata.set_table_name(new_identity.logical_name());
        Ok(())
    }

    /// Identity, carrying the latest display name.
    pub fn identity(&self) -> &TableIdentity {
        &self.identity
    }

    pub fn table_id(&self) -> i32 {
        self.metadata.table_id()
    }

    pub fn structure_version(&self) -> u64 {
        self.metadata.structure_version()
    }

    /// Full metadata, tombstones included.
    pub fn metadata(&self) -> &SequencerMetadata {
        &self.metadata
    }

    /// Last committed txn; 0 before the first commit.
    pub fn last_txn(&self) -> Txn {
        self.files.as_ref().map_or(0, |f| f.ledger.max_txn())
    }

    /// Allocate a fresh WAL id. Safe under a shared lock.
    pub fn next_wal_id(&self) -> Result<u32> {
        if self.is_distressed() {
            return Err(self.distressed_error());
        }
        let id = self.files()?.wal_ids.next_id();
        if let Err(e) = &id {
            error!(table = %self.identity, error = %e, "could not allocate wal id");
        }
        id
    }

    /// Copy the reader view of the metadata into `sink`; returns the last
    /// committed txn.
    pub fn table_metadata(&self, sink: &mut SequencerMetadata) -> Txn {
        sink.copy_from_metadata(&self.metadata);
        sink.to_reader_indexes();
        self.last_txn()
    }

    /// Ledger records from `from` (inclusive) up to the current last txn.
    pub fn transaction_log_cursor(&self, from: Txn) -> Result<TransactionLogCursor> {
        self.files()?.ledger.cursor(from)
    }

    /// Schema changes that produced `from_structure_version` and later.
    pub fn metadata_change_log_cursor(&self, from_structure_version: u64) -> Result<MetadataChangeCursor> {
        self.files()?.changes.cursor(from_structure_version)
    }

    fn files(&self) -> Result<&SequencerFiles> {
        match &self.files {
            Some(files) => Ok(files),
            None => Err(self.distressed_error()),
        }
    }

    fn files_mut(&mut self) -> Result<&mut SequencerFiles> {
        match self.files.as_mut() {
            Some(files) => Ok(files),
            None => Err(SequencerError::Distressed {
                table: self.identity.dir_name().to_string(),
            }),
        }
    }

    fn check_writable(&self) -> Result<()> {
        match self.state() {
            SequencerState::Active => Ok(()),
            SequencerState::Suspended => Err(SequencerError::Suspended {
                table: self.identity.dir_name().to_string(),
            }),
            SequencerState::Dropped => Err(self.dropped_error()),
            SequencerState::Distressed | SequencerState::Closed => Err(self.distressed_error()),
        }
    }

    fn check_structure_version(&self, expected: u64) -> Result<()> {
        let actual = self.metadata.structure_version();
        if expected != actual {
            return Err(SequencerError::StructureVersionMismatch {
                table: self.identity.dir_name().to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    fn escalate<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.escalates_to_distress() {
                error!(table = %self.identity, error = %e, "table sequencer is distressed");
                self.set_distressed();
            }
        }
        result
    }

    fn dropped_error(&self) -> SequencerError {
        SequencerError::TableDropped {
            table: self.identity.dir_name().to_string(),
        }
    }

    fn distressed_error(&self) -> SequencerError {
        SequencerError::Distressed {
            table: self.identity.dir_name().to_string(),
        }
    }
}

fn commit_structure_change(
    files: &mut SequencerFiles,
    next: &SequencerMetadata,
    change: &SchemaChange,
    now: u64,
) -> Result<Txn> {
    let structure_version = next.structure_version();
    files.changes.append(structure_version, change)?;
    let txn = files
        .ledger
        .append(structure_version, TransactionKind::StructureChange, now)?;
    files.meta.sync(next)?;
    Ok(txn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::schema::{ColumnType, TableSchema};

    fn identity() -> TableIdentity {
        TableIdentity::new("trades", "trades~1", 1, true)
    }

    fn schema() -> TableSchema {
        TableSchema::new().column("a", ColumnType::Int).timestamp("ts")
    }

    fn create(root: &Path) -> TableSequencer {
        let mut seq = TableSequencer::new(identity(), root, Arc::new(ManualClock::new(1_000)));
        seq.create(1, &schema()).unwrap();
        seq
    }

    fn reopen(root: &Path) -> TableSequencer {
        let mut seq = TableSequencer::new(identity(), root, Arc::new(ManualClock::new(2_000)));
        seq.open().unwrap();
        seq
    }

    fn add(name: &str) -> SchemaChange {
        SchemaChange::AddColumn {
            name: name.into(),
            column_type: ColumnType::Long,
        }
    }

    #[test]
    fn data_txns_are_consecutive() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = create(dir.path());

        assert_eq!(seq.last_txn(), 0);
        assert_eq!(seq.next_txn(0, 1, 0, 0).unwrap(), 1);
        assert_eq!(seq.next_txn(0, 1, 0, 1).unwrap(), 2);
        assert_eq!(seq.next_txn(0, 2, 0, 0).unwrap(), 3);
        assert_eq!(seq.last_txn(), 3);

        drop(seq);
        let seq = reopen(dir.path());
        assert_eq!(seq.last_txn(), 3);
        assert_eq!(seq.state(), SequencerState::Active);
    }

    #[test]
    fn out_of_range_wal_reference_leaves_sequencer_active() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = create(dir.path());

        let err = seq.next_txn(0, u32::MAX, 0, 0).unwrap_err();
        assert!(matches!(err, SequencerError::WalReferenceOutOfRange { .. }));
        assert_eq!(seq.state(), SequencerState::Active);
        assert_eq!(seq.last_txn(), 0);
        drop(seq);

        let mut seq = reopen(dir.path());
        assert_eq!(seq.next_txn(0, 1, 0, 0).unwrap(), 1);
    }

    #[test]
    fn stale_structure_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = create(dir.path());
        seq.next_structure_txn(0, &add("b")).unwrap();

        let err = seq.next_txn(0, 1, 0, 0).unwrap_err();
        assert!(matches!(
            err,
            SequencerError::StructureVersionMismatch { expected: 0, actual: 1, .. }
        ));
        assert!(err.is_recoverable());
        assert_eq!(seq.state(), SequencerState::Active);
        assert_eq!(seq.next_txn(1, 1, 0, 0).unwrap(), 2);
    }

    #[test]
    fn structure_and_data_txns_share_one_counter() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = create(dir.path());

        assert_eq!(seq.next_txn(0, 1, 0, 0).unwrap(), 1);
        assert_eq!(seq.next_structure_txn(0, &add("b")).unwrap(), 2);
        assert_eq!(seq.next_txn(1, 1, 0, 1).unwrap(), 3);
        assert_eq!(seq.structure_version(), 1);

        let kinds: Vec<_> = seq
            .transaction_log_cursor(1)
            .unwrap()
            .map(|r| r.unwrap())
            .map(|r| (r.txn, r.is_structure_change(), r.structure_version))
            .collect();
        assert_eq!(kinds, vec![(1, false, 0), (2, true, 1), (3, false, 1)]);

        let changes: Vec<_> = seq
            .metadata_change_log_cursor(1)
            .unwrap()
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change, add("b"));
    }

    #[test]
    fn failed_schema_change_consumes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = create(dir.path());

        let err = seq
            .next_structure_txn(0, &SchemaChange::RemoveColumn { name: "nope".into() })
            .unwrap_err();
        assert!(matches!(err, SequencerError::ColumnNotFound { .. }));
        assert_eq!(seq.last_txn(), 0);
        assert_eq!(seq.structure_version(), 0);
        assert_eq!(seq.state(), SequencerState::Active);
    }

    #[test]
    fn metadata_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = create(dir.path());
        seq.next_structure_txn(0, &add("b")).unwrap();
        seq.next_structure_txn(
            1,
            &SchemaChange::RenameColumn {
                name: "a".into(),
                new_name: "z".into(),
            },
        )
        .unwrap();
        drop(seq);

        let seq = reopen(dir.path());
        assert_eq!(seq.structure_version(), 2);
        assert_eq!(seq.metadata().column_index("z"), Some(0));
        assert_eq!(seq.metadata().column_index("b"), Some(2));
        assert_eq!(seq.metadata().table_name(), "trades");
    }

    #[test]
    fn create_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let _seq = create(dir.path());

        let mut again = TableSequencer::new(identity(), dir.path(), Arc::new(ManualClock::new(0)));
        let err = again.create(1, &schema()).unwrap_err();
        assert!(matches!(err, SequencerError::AlreadyExists { .. }));
    }

    #[test]
    fn open_of_missing_table_is_distressed() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = TableSequencer::new(identity(), dir.path(), Arc::new(ManualClock::new(0)));

        assert!(seq.open().is_err());
        assert!(seq.is_distressed());
        assert!(matches!(
            seq.next_txn(0, 1, 0, 0).unwrap_err(),
            SequencerError::Distressed { .. }
        ));
    }

    #[test]
    fn suspension_blocks_allocation_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = create(dir.path());
        seq.suspend_table().unwrap();

        let err = seq.next_txn(0, 1, 0, 0).unwrap_err();
        assert!(matches!(err, SequencerError::Suspended { .. }));
        assert!(matches!(
            seq.next_structure_txn(0, &add("b")).unwrap_err(),
            SequencerError::Suspended { .. }
        ));
        drop(seq);

        let mut seq = reopen(dir.path());
        assert!(seq.is_suspended());
        seq.resume_table().unwrap();
        assert_eq!(seq.next_txn(0, 1, 0, 0).unwrap(), 1);
    }

    #[test]
    fn drop_appends_marker_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = create(dir.path());
        seq.next_txn(0, 1, 0, 0).unwrap();

        assert_eq!(seq.drop_table().unwrap(), 2);
        assert!(seq.is_dropped());
        assert!(matches!(
            seq.next_txn(0, 1, 0, 1).unwrap_err(),
            SequencerError::TableDropped { .. }
        ));
        drop(seq);

        let seq = reopen(dir.path());
        assert!(seq.is_dropped());
        let last = seq.transaction_log_cursor(2).unwrap().next().unwrap().unwrap();
        assert!(last.is_drop());
    }

    #[test]
    fn rename_keeps_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = create(dir.path());

        seq.rename(&identity().renamed("fills")).unwrap();
        assert_eq!(seq.identity().logical_name(), "fills");
        assert_eq!(seq.identity(), &identity());
        assert_eq!(seq.identity().table_id(), 1);

        let other = TableIdentity::new("fills", "fills~2", 2, true);
        assert!(matches!(
            seq.rename(&other).unwrap_err(),
            SequencerError::IdentityMismatch(_)
        ));
    }

    #[test]
    fn reader_metadata_hides_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = create(dir.path());
        seq.next_structure_txn(0, &SchemaChange::RemoveColumn { name: "a".into() })
            .unwrap();

        let mut sink = SequencerMetadata::new();
        assert_eq!(seq.table_metadata(&mut sink), 1);
        assert_eq!(sink.column_count(), 1);
        assert_eq!(sink.timestamp_index(), Some(0));
        assert_eq!(seq.metadata().column_count(), 2);
    }

    #[test]
    fn interrupted_structure_change_rolls_forward() {
        let dir = tempfile::tempdir().unwrap();
        let seq = create(dir.path());
        let seq_dir = sequencer_dir(dir.path(), &identity());
        drop(seq);

        // change log written, crash before ledger and metadata
        let mut changes = MetadataChangeLog::open(&seq_dir.join(META_CHANGES_FILE_NAME)).unwrap();
        changes.append(1, &add("b")).unwrap();
        drop(changes);

        let seq = reopen(dir.path());
        assert_eq!(seq.structure_version(), 1);
        assert_eq!(seq.metadata().column_index("b"), Some(2));
        assert_eq!(seq.last_txn(), 1);
        let record = seq.transaction_log_cursor(1).unwrap().next().unwrap().unwrap();
        assert!(record.is_structure_change());
        drop(seq);

        // recovery is idempotent
        let seq = reopen(dir.path());
        assert_eq!(seq.last_txn(), 1);
        assert_eq!(seq.structure_version(), 1);
    }

    #[test]
    fn uncommitted_metadata_is_rebuilt_from_change_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = create(dir.path());
        seq.next_structure_txn(0, &add("b")).unwrap();
        seq.next_txn(1, 1, 0, 0).unwrap();
        seq.next_structure_txn(
            1,
            &SchemaChange::RenameColumn {
                name: "a".into(),
                new_name: "z".into(),
            },
        )
        .unwrap();
        let expected = seq.metadata().columns().to_vec();
        drop(seq);

        // crash between the size placeholder and the real size
        let meta_path = sequencer_dir(dir.path(), &identity()).join(META_FILE_NAME);
        let mut bytes = fs::read(&meta_path).unwrap();
        bytes[0..4].copy_from_slice(&0i32.to_le_bytes());
        fs::write(&meta_path, &bytes).unwrap();

        let mut seq = reopen(dir.path());
        assert_eq!(seq.state(), SequencerState::Active);
        assert_eq!(seq.structure_version(), 2);
        assert_eq!(seq.last_txn(), 3);
        assert_eq!(seq.metadata().columns(), expected.as_slice());
        assert_eq!(seq.metadata().table_id(), 1);
        assert_eq!(seq.next_txn(2, 1, 0, 1).unwrap(), 4);

        let on_disk = SequencerMetadata::read_committed(&meta_path, 1).unwrap();
        assert_eq!(on_disk.structure_version(), 2);
        assert_eq!(on_disk.column_index("z"), Some(0));
    }

    #[test]
    fn rebuild_stops_at_the_ledger_version() {
        let dir = tempfile::tempdir().unwrap();
        let seq = create(dir.path());
        let seq_dir = sequencer_dir(dir.path(), &identity());
        drop(seq);

        // change log ahead of the ledger, and `_meta` torn
        let mut changes = MetadataChangeLog::open(&seq_dir.join(META_CHANGES_FILE_NAME)).unwrap();
        changes.append(1, &add("b")).unwrap();
        drop(changes);
        fs::write(seq_dir.join(META_FILE_NAME), [0u8; 4]).unwrap();

        let seq = reopen(dir.path());
        assert_eq!(seq.structure_version(), 1);
        assert_eq!(seq.last_txn(), 1);
        assert_eq!(seq.metadata().column_index("b"), Some(2));
    }

    #[test]
    fn uncommitted_metadata_without_creation_snapshot_is_distressed() {
        let dir = tempfile::tempdir().unwrap();
        let seq = create(dir.path());
        let seq_dir = sequencer_dir(dir.path(), &identity());
        drop(seq);

        fs::remove_file(seq_dir.join(META_INIT_FILE_NAME)).unwrap();
        fs::write(seq_dir.join(META_FILE_NAME), [0u8; 4]).unwrap();

        let mut seq = TableSequencer::new(identity(), dir.path(), Arc::new(ManualClock::new(0)));
        assert!(seq.open().is_err());
        assert!(seq.is_distressed());
    }

    #[test]
    fn wal_ids_are_allocated_under_shared_access() {
        let dir = tempfile::tempdir().unwrap();
        let seq = create(dir.path());

        assert_eq!(seq.next_wal_id().unwrap(), 1);
        assert_eq!(seq.next_wal_id().unwrap(), 2);
    }
}
