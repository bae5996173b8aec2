//! Cellbox core.
//!
//! The execution router and the [`CellSandbox`] orchestrator: the crate an
//! embedding dashboard talks to. Cells are registered with declared
//! capabilities, granted the intersection with the kind whitelist, and
//! executed through exactly one of three strategies — in-process for
//! trusted built-ins, isolated contexts for untrusted code, the background
//! pool for declared heavy computation.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use cellbox_core::{CellSandbox, SandboxConfig};
//!
//! let sandbox = CellSandbox::new(services, resolver);
//! sandbox.register_cell(descriptor)?;
//! let result = sandbox.execute(&cell_id, payload).await;
//! ```

pub mod router;
pub mod sandbox;

pub use router::{ExecutionRouter, ExecutorKind};
pub use sandbox::{CellSandbox, SandboxConfig};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
