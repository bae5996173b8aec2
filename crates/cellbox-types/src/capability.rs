//! Host capability vocabulary.
//!
//! A capability gates access to one host operation category. The vocabulary
//! is fixed and host-defined; cell manifests declare capabilities as strings
//! (`"data:read"`). Unrecognized strings are rejected at registration time,
//! never silently ignored.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// A named permission gating one category of host operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    /// Read dashboard data sources.
    DataRead,
    /// Write back to dashboard data sources.
    DataWrite,
    /// Read from the persistence layer.
    StorageRead,
    /// Write to the persistence layer.
    StorageWrite,
    /// Emit render fragments to the UI layer.
    UiRender,
    /// Fetch remote resources over the network.
    NetworkFetch,
    /// Marker for CPU-heavy, UI-less work; routes the cell to the
    /// background compute pool.
    ComputeHeavy,
}

impl Capability {
    /// The complete host vocabulary.
    pub const ALL: [Capability; 7] = [
        Capability::DataRead,
        Capability::DataWrite,
        Capability::StorageRead,
        Capability::StorageWrite,
        Capability::UiRender,
        Capability::NetworkFetch,
        Capability::ComputeHeavy,
    ];

    /// Manifest spelling of this capability.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::DataRead => "data:read",
            Capability::DataWrite => "data:write",
            Capability::StorageRead => "storage:read",
            Capability::StorageWrite => "storage:write",
            Capability::UiRender => "ui:render",
            Capability::NetworkFetch => "network:fetch",
            Capability::ComputeHeavy => "compute:heavy",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A manifest named a permission outside the host vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown capability: {0}")]
pub struct UnknownCapability(pub String);

impl FromStr for Capability {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCapability(s.to_string()))
    }
}

impl Serialize for Capability {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Capability {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Parse a manifest permission list (`{ "permissions": [...] }` content)
/// into a capability set.
///
/// Duplicates collapse. The first unrecognized string aborts the parse with
/// the offending string named, so registration can surface it verbatim.
pub fn parse_manifest<S: AsRef<str>>(
    permissions: &[S],
) -> Result<BTreeSet<Capability>, UnknownCapability> {
    permissions.iter().map(|p| p.as_ref().parse()).collect()
}
