//! Per-execution state machine.
//!
//! Every isolated or background execution walks
//! `Created -> Ready -> Running -> {Completed | Failed | TimedOut}`.
//! Transitions are validated centrally; with the `strict-debug` feature an
//! illegal transition panics instead of returning an error.

use crate::error::StateError;
use serde::{Deserialize, Serialize};

/// Lifecycle state of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    /// An isolated context has been allocated (fresh or pooled).
    Created,
    /// The context answered the liveness handshake.
    Ready,
    /// The payload has been dispatched.
    Running,
    /// A well-formed success reply arrived.
    Completed,
    /// A well-formed error reply arrived, or a limit was breached.
    Failed,
    /// No correlated reply arrived within the budget.
    TimedOut,
}

impl ExecutionState {
    /// Whether the state admits no further transitions.
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::TimedOut
        )
    }
}

/// The transitions allowed out of `from`.
#[must_use]
pub fn allowed_transitions(from: ExecutionState) -> Vec<ExecutionState> {
    use ExecutionState::*;
    match from {
        Created => vec![Ready, Failed, TimedOut],
        Ready => vec![Running, Failed, TimedOut],
        Running => vec![Completed, Failed, TimedOut],
        Completed | Failed | TimedOut => vec![],
    }
}

/// Validates a state transition.
///
/// Illegal transitions panic in debug runs when the `strict-debug` feature
/// is enabled; otherwise they return an error so callers can audit and drop.
pub fn validate_transition(from: ExecutionState, to: ExecutionState) -> Result<(), StateError> {
    if allowed(from, to) {
        Ok(())
    } else {
        #[cfg(feature = "strict-debug")]
        panic!("Illegal state transition attempted: {:?} -> {:?}", from, to);

        #[cfg(not(feature = "strict-debug"))]
        Err(StateError::IllegalTransition { from, to })
    }
}

fn allowed(from: ExecutionState, to: ExecutionState) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}
