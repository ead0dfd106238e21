// Pool Entries and Handles
//
// A registry slot owns one sequencer behind a reader-writer lock, plus a
// few atomics mirrored from it so that lock-free peeks and idle eviction
// never have to take the lock.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use serde::Serialize;

use super::SequencerPool;
use crate::identity::TableIdentity;
use crate::log::Txn;
use crate::sequencer::TableSequencer;

pub(crate) type ReadGuard = ArcRwLockReadGuard<RawRwLock, TableSequencer>;
pub(crate) type WriteGuard = ArcRwLockWriteGuard<RawRwLock, TableSequencer>;

/// Counters published by the last writer, readable without locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequencerSnapshot {
    pub table_id: i32,
    pub last_txn: Txn,
    pub structure_version: u64,
}

#[derive(Debug)]
pub(crate) struct SequencerEntry {
    sequencer: Arc<RwLock<TableSequencer>>,
    release_time: AtomicU64,
    holders: AtomicUsize,
    closed: AtomicBool,
    distressed: AtomicBool,
    table_id: AtomicI32,
    last_txn: AtomicU64,
    structure_version: AtomicU64,
}

impl SequencerEntry {
    pub(crate) fn new(sequencer: TableSequencer) -> Self {
        Self {
            release_time: AtomicU64::new(u64::MAX),
            holders: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            distressed: AtomicBool::new(sequencer.is_distressed()),
            table_id: AtomicI32::new(sequencer.table_id()),
            last_txn: AtomicU64::new(sequencer.last_txn()),
            structure_version: AtomicU64::new(sequencer.structure_version()),
            sequencer: Arc::new(RwLock::new(sequencer)),
        }
    }

    /// Mirror the sequencer's counters. Called with the write lock held.
    pub(crate) fn publish(&self, sequencer: &TableSequencer) {
        self.table_id.store(sequencer.table_id(), Ordering::Release);
        self.last_txn.store(sequencer.last_txn(), Ordering::Release);
        self.structure_version
            .store(sequencer.structure_version(), Ordering::Release);
        self.distressed
            .store(sequencer.is_distressed(), Ordering::Release);
    }

    pub(crate) fn snapshot(&self) -> SequencerSnapshot {
        SequencerSnapshot {
            table_id: self.table_id.load(Ordering::Acquire),
            last_txn: self.last_txn.load(Ordering::Acquire),
            structure_version: self.structure_version.load(Ordering::Acquire),
        }
    }

    pub(crate) fn is_distressed(&self) -> bool {
        self.distressed.load(Ordering::Acquire)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn release_time(&self) -> u64 {
        self.release_time.load(Ordering::Acquire)
    }

    pub(crate) fn mark_released(&self, now: u64) {
        self.release_time.store(now, Ordering::Release);
    }

    /// Close the sequencer if nobody holds or waits on it. Returns true when
    /// this call closed it; the caller then owns removing the slot.
    pub(crate) fn check_close(&self) -> bool {
        if self.holders.load(Ordering::Acquire) != 0 {
            return false;
        }
        let Some(mut sequencer) = self.sequencer.try_write() else {
            return false;
        };
        if self.holders.load(Ordering::Acquire) != 0 || self.is_closed() {
            return false;
        }
        sequencer.close();
        self.closed.store(true, Ordering::Release);
        true
    }
}

/// How a lease locks its entry.
pub(crate) trait LeaseGuard: Sized {
    fn lock(entry: &SequencerEntry) -> Self;
}

impl LeaseGuard for ReadGuard {
    fn lock(entry: &SequencerEntry) -> Self {
        entry.sequencer.read_arc()
    }
}

impl LeaseGuard for WriteGuard {
    fn lock(entry: &SequencerEntry) -> Self {
        entry.sequencer.write_arc()
    }
}

/// Hold the entry without locking it; only the published atomics are read.
pub(crate) struct Unlocked;

impl LeaseGuard for Unlocked {
    fn lock(_: &SequencerEntry) -> Self {
        Unlocked
    }
}

/// Pins an entry in the registry. Dropping it hands the entry back to the
/// pool, which either stamps the release time or retires the entry.
pub(crate) struct Lease<'a> {
    pool: &'a SequencerPool,
    identity: TableIdentity,
    pub(crate) entry: Arc<SequencerEntry>,
    pub(crate) retire: bool,
}

impl<'a> Lease<'a> {
    pub(crate) fn new(
        pool: &'a SequencerPool,
        identity: &TableIdentity,
        entry: Arc<SequencerEntry>,
    ) -> Self {
        entry.holders.fetch_add(1, Ordering::AcqRel);
        Self {
            pool,
            identity: identity.clone(),
            entry,
            retire: false,
        }
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.entry.holders.fetch_sub(1, Ordering::AcqRel);
        self.pool.release(&self.identity, &self.entry, self.retire);
    }
}

/// Shared access to a pooled sequencer.
pub struct SequencerReadHandle<'a> {
    // unlock before the lease is returned
    guard: ReadGuard,
    lease: Lease<'a>,
}

impl<'a> SequencerReadHandle<'a> {
    pub(crate) fn new(guard: ReadGuard, lease: Lease<'a>) -> Self {
        Self { guard, lease }
    }
}

impl Deref for SequencerReadHandle<'_> {
    type Target = TableSequencer;

    fn deref(&self) -> &TableSequencer {
        &self.guard
    }
}

impl Drop for SequencerReadHandle<'_> {
    fn drop(&mut self) {
        self.lease.retire = self.guard.is_distressed() || self.guard.is_dropped();
    }
}

/// Exclusive access to a pooled sequencer. Counters are published to the
/// pool when the handle is dropped.
pub struct SequencerWriteHandle<'a> {
    guard: WriteGuard,
    lease: Lease<'a>,
}

impl<'a> SequencerWriteHandle<'a> {
    pub(crate) fn new(guard: WriteGuard, lease: Lease<'a>) -> Self {
        Self { guard, lease }
    }
}

impl Deref for SequencerWriteHandle<'_> {
    type Target = TableSequencer;

    fn deref(&self) -> &TableSequencer {
        &self.guard
    }
}

impl DerefMut for SequencerWriteHandle<'_> {
    fn deref_mut(&mut self) -> &mut TableSequencer {
        &mut self.guard
    }
}

impl Drop for SequencerWriteHandle<'_> {
    fn drop(&mut self) {
        self.lease.entry.publish(&self.guard);
        self.lease.retire = self.guard.is_distressed() || self.guard.is_dropped();
    }
}
