//! Kernel error types.
//!
//! These are internal mechanism errors. User-visible failures are always
//! folded into `ExecutionFailure` with a `FailureKind` before leaving the
//! kernel; nothing here crosses the sandbox boundary directly.

use crate::state::ExecutionState;
use cellbox_types::{Capability, RequestId};

/// State machine violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// Attempted transition outside the allowed set.
    #[error("illegal state transition: {from:?} -> {to:?}")]
    IllegalTransition {
        /// State the execution was in.
        from: ExecutionState,
        /// State the transition aimed for.
        to: ExecutionState,
    },
}

/// Context communication failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// The context task is gone; its channel is closed.
    #[error("context channel closed")]
    ChannelClosed,
}

/// Correlation table failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// No pending entry for the request.
    #[error("unknown or already-resolved request: {0}")]
    UnknownRequest(RequestId),

    /// A pending entry already exists for the request.
    #[error("request already registered: {0}")]
    DuplicateRegistration(RequestId),
}

/// Failures reported by host-service collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    /// The collaborator failed to perform the operation.
    #[error("host operation failed: {0}")]
    Failed(String),

    /// The collaborator does not implement the operation.
    #[error("host operation unsupported: {0}")]
    Unsupported(&'static str),
}

/// Failures surfaced by the capability-filtered facade.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FacadeError {
    /// The capability check failed. Returned to the cell; by itself it does
    /// not abort the execution.
    #[error("permission denied: {operation} requires {capability}")]
    PermissionDenied {
        /// The missing capability.
        capability: Capability,
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// The mediating channel to the host is gone (context torn down).
    #[error("host detached")]
    Detached,

    /// The collaborator behind the facade failed.
    #[error(transparent)]
    Host(#[from] HostError),
}

/// Failures raised by cell programs or their resolution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgramError {
    /// No program could be instantiated for the descriptor.
    #[error("unresolvable cell program: {0}")]
    Unresolvable(String),

    /// The cell's own code raised an error.
    #[error("{0}")]
    Faulted(String),
}

/// Audit chain verification failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("audit log integrity violation at index {index}")]
pub struct AuditIntegrityError {
    /// Index of the first event whose chain link does not verify.
    pub index: usize,
}
