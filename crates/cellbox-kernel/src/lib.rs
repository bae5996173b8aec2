//! Cellbox kernel.
//!
//! Execution machinery for the sandbox, built around two hard boundaries:
//!
//! 1. **Authorization happens in one place.** Every host-facing operation
//!    passes through the capability-filtered facade, which consults the
//!    policy table and appends the check to the audit stream.
//! 2. **Untrusted code is reachable only by message.** Isolated contexts
//!    and background workers own nothing but channel endpoints; the broker
//!    validates identity, protocol shape and state transitions before any
//!    inbound message is acted upon.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use cellbox_kernel::prelude::*;
//!
//! let broker = MessageBroker::spawn(monitor, audit.clone());
//! let executor = IsolatedExecutor::new(limits, broker, audit, resolver, host_calls);
//! let result = executor.execute(&request, &descriptor).await;
//! ```

pub mod audit;
pub mod background;
pub mod broker;
pub mod context;
pub mod error;
pub mod facade;
pub mod inprocess;
pub mod isolated;
pub mod monitor;
pub mod program;
pub mod state;

pub use audit::{AuditAction, AuditEvent, AuditLog};
pub use broker::{CorrelationTicket, InboundMessage, MessageBroker};
pub use context::{ContextHandle, ContextPool, PoolStats};
pub use error::{
    AuditIntegrityError, BrokerError, ContextError, FacadeError, HostError, ProgramError,
    StateError,
};
pub use facade::{spawn_host_mediator, HostCall, HostFacade, HostOp, HostPort, HostServices};
pub use inprocess::{BuiltinRegistry, BuiltinWidget, InProcessExecutor};
pub use monitor::{LimitBreach, ResourceMonitor, UsageSnapshot};
pub use program::{CellProgram, ExecutePayload, LogSink, ProgramIo, ProgramResolver};
pub use state::ExecutionState;

/// Commonly used kernel types.
pub mod prelude {
    pub use crate::audit::{AuditAction, AuditEvent, AuditLog};
    pub use crate::background::BackgroundExecutor;
    pub use crate::broker::{CorrelationTicket, MessageBroker};
    pub use crate::context::{ContextPool, PoolStats};
    pub use crate::error::{FacadeError, ProgramError};
    pub use crate::facade::{spawn_host_mediator, HostFacade, HostOp, HostPort, HostServices};
    pub use crate::inprocess::{BuiltinRegistry, BuiltinWidget, InProcessExecutor};
    pub use crate::isolated::IsolatedExecutor;
    pub use crate::monitor::{LimitBreach, ResourceMonitor};
    pub use crate::program::{CellProgram, ExecutePayload, LogSink, ProgramIo, ProgramResolver};
    pub use crate::state::{allowed_transitions, validate_transition, ExecutionState};
}

pub use background::BackgroundExecutor;
pub use isolated::IsolatedExecutor;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if running with strict debugging enabled
pub const fn strict_debug() -> bool {
    cfg!(feature = "strict-debug")
}
