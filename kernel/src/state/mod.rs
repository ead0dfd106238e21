// Sequencer State Machine
//
// Lifecycle of one in-memory sequencer instance. Suspension is an
// administrative pause; distress, drop and close are terminal for the
// instance.

use serde::Serialize;

/// Lifecycle state of a sequencer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SequencerState {
    /// Serving data and structure transactions.
    Active,

    /// Paused by an operator; allocation is rejected until resumed.
    Suspended,

    /// File I/O failed mid-operation. The pool replaces the instance.
    Distressed,

    /// Table dropped; the drop marker is in the ledger.
    Dropped,

    /// Files released. Eligible for removal from the pool.
    Closed,
}

impl SequencerState {
    /// No further transactions can ever be served by this instance.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SequencerState::Distressed | SequencerState::Dropped | SequencerState::Closed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    Suspend,
    Resume,
    Distress,
    Drop,
    Close,
}

/// Errors produced during state transitions.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("illegal state transition: {0}")]
    IllegalTransition(String),
}

#[derive(Debug)]
pub struct SequencerStateMachine {
    state: SequencerState,
}

impl Default for SequencerStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SequencerStateMachine {
    pub fn new() -> Self {
        Self {
            state: SequencerState::Active,
        }
    }

    pub fn apply(&mut self, event: StateEvent) -> Result<SequencerState, StateError> {
        use SequencerState::{Active, Closed, Distressed, Dropped, Suspended};

        self.state = match (self.state, event) {
            (Active | Suspended, StateEvent::Suspend) => Suspended,
            (Active | Suspended, StateEvent::Resume) => Active,

            // distress may hit a suspended table too
            (Active | Suspended | Distressed, StateEvent::Distress) => Distressed,

            (Active | Suspended, StateEvent::Drop) => Dropped,

            (_, StateEvent::Close) => Closed,

            (state, event) => {
                return Err(StateError::IllegalTransition(format!(
                    "cannot apply {:?} while {:?}",
                    event, state
                )))
            }
        };

        Ok(self.state)
    }

    pub fn current_state(&self) -> SequencerState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspend_and_resume() {
        let mut sm = SequencerStateMachine::new();

        assert_eq!(sm.apply(StateEvent::Suspend).unwrap(), SequencerState::Suspended);
        assert_eq!(sm.apply(StateEvent::Suspend).unwrap(), SequencerState::Suspended);
        assert_eq!(sm.apply(StateEvent::Resume).unwrap(), SequencerState::Active);
    }

    #[test]
    fn suspended_table_can_become_distressed() {
        let mut sm = SequencerStateMachine::new();
        sm.apply(StateEvent::Suspend).unwrap();

        assert_eq!(sm.apply(StateEvent::Distress).unwrap(), SequencerState::Distressed);
        assert!(sm.current_state().is_terminal());
    }

    #[test]
    fn dropped_table_cannot_resume() {
        let mut sm = SequencerStateMachine::new();
        sm.apply(StateEvent::Drop).unwrap();

        let err = sm.apply(StateEvent::Resume).unwrap_err();
        assert!(matches!(err, StateError::IllegalTransition(_)));
        assert_eq!(sm.current_state(), SequencerState::Dropped);
    }

    #[test]
    fn close_is_always_allowed() {
        let mut sm = SequencerStateMachine::new();
        sm.apply(StateEvent::Distress).unwrap();

        assert_eq!(sm.apply(StateEvent::Close).unwrap(), SequencerState::Closed);
        assert_eq!(sm.apply(StateEvent::Close).unwrap(), SequencerState::Closed);
    }
}
