// Sequencer Errors
//
// One error type for the whole kernel. Every variant belongs to exactly one
// `ErrorKind`, which is what callers branch on when deciding between retry,
// refresh-and-retry, and abort.

use std::io;
use std::path::PathBuf;

use crate::state::StateError;

/// Convenience alias for `Result<T, SequencerError>`.
pub type Result<T> = std::result::Result<T, SequencerError>;

/// Error classification for retry/escalation decisions.
///
/// - `Schema`:         malformed request (column misuse, wal reference out of range)
/// - `Conflict`:       optimistic-concurrency conflict; refresh metadata and retry
/// - `Administrative`: table suspended, dropped or misaddressed; needs an operator
/// - `Distress`:       the sequencer instance is unusable; the pool replaces it
/// - `Fatal`:          pool closed or distressed retries exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Schema,
    Conflict,
    Administrative,
    Distress,
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum SequencerError {
    #[error("column not found: {name}")]
    ColumnNotFound { name: String },

    #[error("duplicate column: {name}")]
    DuplicateColumn { name: String },

    #[error("wal reference out of range [wal_id={wal_id}, segment_id={segment_id}, segment_txn={segment_txn}]")]
    WalReferenceOutOfRange {
        wal_id: u32,
        segment_id: u32,
        segment_txn: u64,
    },

    #[error("structure version mismatch [table={table}, expected={expected}, actual={actual}]")]
    StructureVersionMismatch {
        table: String,
        expected: u64,
        actual: u64,
    },

    #[error("table is suspended [table={table}]")]
    Suspended { table: String },

    #[error("table is dropped [table={table}]")]
    TableDropped { table: String },

    #[error("sequencer instance is distressed [table={table}]")]
    Distressed { table: String },

    #[error("sequencer is distressed [table={table}, attempts={attempts}]")]
    DistressedRetriesExhausted { table: String, attempts: u32 },

    #[error("sequencer pool is closed")]
    PoolClosed,

    #[error("sequencer files already exist: {}", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("metadata is not committed yet: {}", path.display())]
    NotCommitted { path: PathBuf },

    #[error("corrupt sequencer file {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("table identity mismatch: {0}")]
    IdentityMismatch(String),

    #[error("invalid schema change payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("state machine error: {0}")]
    State(#[from] StateError),
}

impl SequencerError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SequencerError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        SequencerError::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        use SequencerError::*;

        match self {
            ColumnNotFound { .. }
            | DuplicateColumn { .. }
            | WalReferenceOutOfRange { .. }
            | Payload(_) => ErrorKind::Schema,
            StructureVersionMismatch { .. } => ErrorKind::Conflict,
            Suspended { .. } | TableDropped { .. } | AlreadyExists { .. } | IdentityMismatch(_) => {
                ErrorKind::Administrative
            }
            Distressed { .. } | NotCommitted { .. } | Corrupt { .. } | Io { .. } | State(_) => {
                ErrorKind::Distress
            }
            DistressedRetriesExhausted { .. } | PoolClosed => ErrorKind::Fatal,
        }
    }

    /// True for failures of the sequencer's own files. These always move the
    /// owning instance to `Distressed`.
    pub fn escalates_to_distress(&self) -> bool {
        matches!(
            self,
            SequencerError::Io { .. }
                | SequencerError::Corrupt { .. }
                | SequencerError::NotCommitted { .. }
        )
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Schema | ErrorKind::Conflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_mismatch_is_recoverable_conflict() {
        let err = SequencerError::StructureVersionMismatch {
            table: "trades".into(),
            expected: 1,
            actual: 2,
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.is_recoverable());
        assert!(!err.escalates_to_distress());
    }

    #[test]
    fn io_failures_escalate() {
        let err = SequencerError::io("/tmp/x", io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(err.escalates_to_distress());
        assert_eq!(err.kind(), ErrorKind::Distress);
        assert!(err.to_string().contains("/tmp/x"));
    }

    #[test]
    fn exhausted_retries_name_the_table() {
        let err = SequencerError::DistressedRetriesExhausted {
            table: "trades~7".into(),
            attempts: 3,
        };
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(err.to_string().contains("sequencer is distressed"));
        assert!(err.to_string().contains("trades~7"));
    }
}
