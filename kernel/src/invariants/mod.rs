// Ledger Invariants
//
// Pure rules over consecutive ledger records. The replay engine runs them
// over a whole `_txnlog` to verify it before trusting it.

use crate::log::TransactionRecord;

/// Result of invariant evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantResult {
    Pass,
    Fail(String),
}

/// Trait implemented by all ledger invariants.
///
/// Invariants must be:
/// - Pure
/// - Deterministic
/// - Side-effect free
pub trait Invariant: Send + Sync {
    fn name(&self) -> &'static str;

    /// `previous` is `None` for the first record visited.
    fn validate(
        &self,
        previous: Option<&TransactionRecord>,
        record: &TransactionRecord,
    ) -> InvariantResult;
}

/// Txns are consecutive.
pub struct GapFreeTxns;

impl Invariant for GapFreeTxns {
    fn name(&self) -> &'static str {
        "gap-free-txns"
    }

    fn validate(
        &self,
        previous: Option<&TransactionRecord>,
        record: &TransactionRecord,
    ) -> InvariantResult {
        match previous {
            Some(prev) if record.txn != prev.txn + 1 => {
                InvariantResult::Fail(format!("txn {} follows txn {}", record.txn, prev.txn))
            }
            _ => InvariantResult::Pass,
        }
    }
}

/// Data txns keep the structure version; a structure change moves it up by
/// exactly one.
pub struct StructureVersionSteps;

impl Invariant for StructureVersionSteps {
    fn name(&self) -> &'static str {
        "structure-version-steps"
    }

    fn validate(
        &self,
        previous: Option<&TransactionRecord>,
        record: &TransactionRecord,
    ) -> InvariantResult {
        let Some(prev) = previous else {
            return InvariantResult::Pass;
        };
        let expected = if record.is_structure_change() {
            prev.structure_version + 1
        } else {
            prev.structure_version
        };
        if record.structure_version == expected {
            InvariantResult::Pass
        } else {
            InvariantResult::Fail(format!(
                "txn {} has structure version {}, expected {}",
                record.txn, record.structure_version, expected
            ))
        }
    }
}

/// The drop marker is the last record.
pub struct NothingAfterDrop;

impl Invariant for NothingAfterDrop {
    fn name(&self) -> &'static str {
        "nothing-after-drop"
    }

    fn validate(
        &self,
        previous: Option<&TransactionRecord>,
        record: &TransactionRecord,
    ) -> InvariantResult {
        match previous {
            Some(prev) if prev.is_drop() => {
                InvariantResult::Fail(format!("txn {} follows the drop marker", record.txn))
            }
            _ => InvariantResult::Pass,
        }
    }
}

/// Invariant engine that evaluates a set of invariants.
#[derive(Default)]
pub struct InvariantEngine {
    invariants: Vec<Box<dyn Invariant>>,
}

impl InvariantEngine {
    pub fn new() -> Self {
        Self {
            invariants: Vec::new(),
        }
    }

    /// Engine with every rule a well-formed ledger satisfies.
    pub fn ledger_rules() -> Self {
        let mut engine = Self::new();
        engine.register(GapFreeTxns);
        engine.register(StructureVersionSteps);
        engine.register(NothingAfterDrop);
        engine
    }

    pub fn register<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Stops at the first failure.
    pub fn evaluate(
        &self,
        previous: Option<&TransactionRecord>,
        record: &TransactionRecord,
    ) -> Result<(), InvariantViolation> {
        for invariant in &self.invariants {
            match invariant.validate(previous, record) {
                InvariantResult::Pass => continue,
                InvariantResult::Fail(reason) => {
                    return Err(InvariantViolation {
                        invariant: invariant.name(),
                        txn: record.txn,
                        reason,
                    })
                }
            }
        }
        Ok(())
    }
}

/// Returned when an invariant is violated.
#[derive(Debug, thiserror::Error)]
#[error("invariant `{invariant}` violated at txn {txn}: {reason}")]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub txn: u64,
    pub reason: String,
}
