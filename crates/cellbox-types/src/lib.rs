//! Shared types for the cellbox workspace.
//!
//! Defines the vocabulary every other crate speaks:
//! - Cell and request identifiers
//! - Cell descriptors and the capability vocabulary
//! - The host ⇄ context wire protocol
//! - Execution results and the failure taxonomy
//! - Limit configuration

pub mod capability;
pub mod config;
pub mod descriptor;
pub mod id;
pub mod protocol;
pub mod request;
pub mod result;

pub use capability::{parse_manifest, Capability, UnknownCapability};
pub use config::SandboxLimits;
pub use descriptor::{CellDescriptor, CellKind, DescriptorError};
pub use id::{CellId, ContextId, EventId, RequestId};
pub use protocol::{Envelope, MessageType, ProtocolError};
pub use request::ExecutionRequest;
pub use result::{
    ExecutionFailure, ExecutionOutput, ExecutionResult, FailureKind, LogEntry, LogLevel,
};
