// Walseq Kernel
//
// Transaction sequencing for WAL tables: per-table ledgers, structure
// metadata, and the process-wide sequencer pool.

pub mod clock;
pub mod error;
pub mod identity;
pub mod invariants;
pub mod log;
pub mod metadata;
pub mod pool;
pub mod replay;
pub mod schema;
pub mod sequencer;
pub mod state;

pub use clock::{ManualClock, MicrosecondClock, SystemClock};
pub use error::{ErrorKind, Result, SequencerError};
pub use identity::TableIdentity;
pub use pool::{PoolConfig, SequencerPool};
pub use sequencer::TableSequencer;
