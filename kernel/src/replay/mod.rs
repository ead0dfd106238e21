// Deterministic Replay
//
// Rebuilds derived state from the sequencer's logs: a reader's metadata from
// the change log, and a ledger summary from the `_txnlog` with every
// invariant enforced along the way.

use serde::Serialize;

use crate::error::{Result, SequencerError};
use crate::invariants::{InvariantEngine, InvariantViolation};
use crate::log::{MetadataChange, TransactionRecord, Txn};
use crate::metadata::SequencerMetadata;

/// Errors that can occur during replay.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("sequencer error: {0}")]
    Sequencer(#[from] SequencerError),

    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error("structure version gap: expected {expected}, found {actual}")]
    VersionGap { expected: u64, actual: u64 },
}

/// Apply metadata changes to `metadata`, each one exactly one version past
/// the last. Changes the metadata already contains are skipped. Returns the
/// resulting structure version.
pub fn replay_metadata<I>(
    metadata: &mut SequencerMetadata,
    changes: I,
) -> std::result::Result<u64, ReplayError>
where
    I: IntoIterator<Item = Result<MetadataChange>>,
{
    for change in changes {
        let change = change?;
        let current = metadata.structure_version();
        if change.structure_version <= current {
            continue;
        }
        if change.structure_version != current + 1 {
            return Err(ReplayError::VersionGap {
                expected: current + 1,
                actual: change.structure_version,
            });
        }
        change.change.apply_to(metadata)?;
    }
    Ok(metadata.structure_version())
}

/// Totals over a verified ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub last_txn: Txn,
    pub structure_version: u64,
    pub data_txns: u64,
    pub structure_txns: u64,
    pub dropped: bool,
}

/// Walk ledger records in order, enforcing `invariants` between neighbours.
pub fn replay_ledger<I>(
    records: I,
    invariants: &InvariantEngine,
) -> std::result::Result<LedgerSummary, ReplayError>
where
    I: IntoIterator<Item = Result<TransactionRecord>>,
{
    let mut summary = LedgerSummary::default();
    let mut previous: Option<TransactionRecord> = None;

    for record in records {
        let record = record?;
        invariants.evaluate(previous.as_ref(), &record)?;

        if record.is_structure_change() {
            summary.structure_txns += 1;
        } else if record.is_drop() {
            summary.dropped = true;
        } else {
            summary.data_txns += 1;
        }
        summary.last_txn = record.txn;
        summary.structure_version = record.structure_version;
        previous = Some(record);
    }

    Ok(summary)
}
