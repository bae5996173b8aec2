//! Cell descriptors.
//!
//! A descriptor identifies one unit of executable dashboard content and its
//! declared capabilities. Descriptors are produced by the dashboard
//! composition layer; the sandbox validates them at registration.

use crate::capability::Capability;
use crate::id::CellId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// The kind of content a cell holds, which determines its execution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellKind {
    /// Trusted widget shipped with the host, identified by cell id.
    #[serde(rename = "built-in")]
    Builtin,
    /// Arbitrary untrusted user script.
    #[serde(rename = "user-script")]
    UserScript,
    /// Snippet in the dashboard expression DSL.
    #[serde(rename = "dsl")]
    Dsl,
}

impl CellKind {
    /// Wire spelling of this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CellKind::Builtin => "built-in",
            CellKind::UserScript => "user-script",
            CellKind::Dsl => "dsl",
        }
    }
}

impl fmt::Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Descriptor validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    /// Built-ins are identified by id, not source text.
    #[error("built-in cells must not carry source code")]
    BuiltinWithCode,

    /// Script and DSL cells are nothing without their source.
    #[error("{kind} cells require source code")]
    MissingCode {
        /// The offending kind.
        kind: CellKind,
    },
}

/// One unit of executable dashboard content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellDescriptor {
    /// Dashboard-assigned identifier.
    pub id: CellId,
    /// Content kind.
    pub kind: CellKind,
    /// Source text for script/DSL cells. `None` for built-ins.
    pub code: Option<String>,
    /// Capabilities the cell asks for. The grant is the intersection of
    /// this set with the kind-level policy whitelist.
    #[serde(default)]
    pub declared_capabilities: BTreeSet<Capability>,
    /// Opaque layout metadata owned by the composition layer.
    #[serde(default)]
    pub position: serde_json::Value,
}

impl CellDescriptor {
    /// Descriptor for a trusted built-in widget.
    #[must_use]
    pub fn builtin(id: impl Into<CellId>) -> Self {
        Self {
            id: id.into(),
            kind: CellKind::Builtin,
            code: None,
            declared_capabilities: BTreeSet::new(),
            position: serde_json::Value::Null,
        }
    }

    /// Descriptor for an untrusted user script.
    #[must_use]
    pub fn user_script(id: impl Into<CellId>, code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: CellKind::UserScript,
            code: Some(code.into()),
            declared_capabilities: BTreeSet::new(),
            position: serde_json::Value::Null,
        }
    }

    /// Descriptor for a DSL snippet.
    #[must_use]
    pub fn dsl(id: impl Into<CellId>, code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: CellKind::Dsl,
            code: Some(code.into()),
            declared_capabilities: BTreeSet::new(),
            position: serde_json::Value::Null,
        }
    }

    /// Add one declared capability.
    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.declared_capabilities.insert(capability);
        self
    }

    /// Add several declared capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.declared_capabilities.extend(capabilities);
        self
    }

    /// Attach layout metadata.
    #[must_use]
    pub fn with_position(mut self, position: serde_json::Value) -> Self {
        self.position = position;
        self
    }

    /// Whether the cell declares the given capability.
    #[inline]
    #[must_use]
    pub fn declares(&self, capability: Capability) -> bool {
        self.declared_capabilities.contains(&capability)
    }

    /// Enforce the kind/code invariant.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        match (self.kind, &self.code) {
            (CellKind::Builtin, Some(_)) => Err(DescriptorError::BuiltinWithCode),
            (CellKind::UserScript | CellKind::Dsl, None) => Err(DescriptorError::MissingCode {
                kind: self.kind,
            }),
            _ => Ok(()),
        }
    }
}
