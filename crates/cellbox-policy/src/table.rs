//! The capability/permission table.

use crate::error::PolicyError;
use cellbox_types::{Capability, CellDescriptor, CellId, CellKind};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;

/// Kind-level ceiling on what any cell of that kind may be granted.
///
/// Read-only after sandbox construction; registration intersects a cell's
/// declared capabilities with this ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyWhitelist {
    builtin: BTreeSet<Capability>,
    user_script: BTreeSet<Capability>,
    dsl: BTreeSet<Capability>,
}

impl Default for PolicyWhitelist {
    fn default() -> Self {
        Self {
            // Built-ins are trusted host code; the facade still checks
            // every operation against the cell's actual grant.
            builtin: Capability::ALL.into_iter().collect(),
            user_script: [
                Capability::DataRead,
                Capability::StorageRead,
                Capability::UiRender,
                Capability::NetworkFetch,
                Capability::ComputeHeavy,
            ]
            .into_iter()
            .collect(),
            dsl: [
                Capability::DataRead,
                Capability::UiRender,
                Capability::ComputeHeavy,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl PolicyWhitelist {
    /// Default whitelist.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the ceiling for one kind.
    #[must_use]
    pub fn with_allowed(
        mut self,
        kind: CellKind,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        let set = capabilities.into_iter().collect();
        match kind {
            CellKind::Builtin => self.builtin = set,
            CellKind::UserScript => self.user_script = set,
            CellKind::Dsl => self.dsl = set,
        }
        self
    }

    /// The ceiling for one kind.
    #[must_use]
    pub fn allowed_for(&self, kind: CellKind) -> &BTreeSet<Capability> {
        match kind {
            CellKind::Builtin => &self.builtin,
            CellKind::UserScript => &self.user_script,
            CellKind::Dsl => &self.dsl,
        }
    }
}

/// Immutable record of what one cell was granted, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityGrant {
    /// The cell the grant belongs to.
    pub cell_id: CellId,
    /// Granted capability set; possibly empty.
    pub capabilities: BTreeSet<Capability>,
    /// When the grant was written.
    pub granted_at: DateTime<Utc>,
}

impl CapabilityGrant {
    /// Whether the grant covers the capability.
    #[inline]
    #[must_use]
    pub fn covers(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Single point of truth for authorization checks.
///
/// Writes happen only at registration; the hot path is read-only, so no
/// runtime locking discipline is needed beyond the map's own sharding.
#[derive(Debug, Default)]
pub struct CapabilityTable {
    whitelist: PolicyWhitelist,
    grants: DashMap<CellId, CapabilityGrant>,
}

impl CapabilityTable {
    /// Table with the default whitelist.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with a custom whitelist.
    #[must_use]
    pub fn with_whitelist(whitelist: PolicyWhitelist) -> Self {
        Self {
            whitelist,
            grants: DashMap::new(),
        }
    }

    /// Register a cell, writing its grant record.
    ///
    /// The grant is the intersection of the descriptor's declared
    /// capabilities and the kind whitelist. Re-registration replaces the
    /// prior grant set atomically: the new set is computed fully before the
    /// single map insert.
    pub fn register(&self, descriptor: &CellDescriptor) -> Result<CapabilityGrant, PolicyError> {
        descriptor.validate()?;

        let allowed = self.whitelist.allowed_for(descriptor.kind);
        let capabilities: BTreeSet<Capability> = descriptor
            .declared_capabilities
            .intersection(allowed)
            .copied()
            .collect();

        let grant = CapabilityGrant {
            cell_id: descriptor.id.clone(),
            capabilities,
            granted_at: Utc::now(),
        };

        tracing::debug!(
            cell = %descriptor.id,
            kind = %descriptor.kind,
            granted = grant.capabilities.len(),
            declared = descriptor.declared_capabilities.len(),
            "grant written"
        );

        self.grants.insert(descriptor.id.clone(), grant.clone());
        Ok(grant)
    }

    /// Revoke a cell's grant. Returns the removed record, if any.
    pub fn revoke(&self, cell_id: &CellId) -> Option<CapabilityGrant> {
        self.grants.remove(cell_id).map(|(_, grant)| grant)
    }

    /// Authorization check; fail closed.
    ///
    /// Unknown cells answer `false`. Never panics, never allocates, never
    /// mutates — it sits on every host-facing call path.
    #[must_use]
    pub fn check(&self, cell_id: &CellId, capability: Capability) -> bool {
        self.grants
            .get(cell_id)
            .is_some_and(|grant| grant.covers(capability))
    }

    /// Whether a grant record exists for the cell (possibly empty).
    ///
    /// Routing requires this before any execution is dispatched.
    #[must_use]
    pub fn has_grant(&self, cell_id: &CellId) -> bool {
        self.grants.contains_key(cell_id)
    }

    /// Snapshot of a cell's grant.
    #[must_use]
    pub fn granted(&self, cell_id: &CellId) -> Option<CapabilityGrant> {
        self.grants.get(cell_id).map(|g| g.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn script(id: &str, caps: &[Capability]) -> CellDescriptor {
        CellDescriptor::user_script(id, "1 + 1").with_capabilities(caps.iter().copied())
    }

    #[test]
    fn grant_is_intersection_of_declared_and_whitelist() {
        let table = CapabilityTable::new();
        // data:write is not in the default user-script whitelist
        let grant = table
            .register(&script("s1", &[Capability::DataRead, Capability::DataWrite]))
            .unwrap();
        assert!(grant.covers(Capability::DataRead));
        assert!(!grant.covers(Capability::DataWrite));
    }

    #[test]
    fn check_fails_closed_for_unknown_cells() {
        let table = CapabilityTable::new();
        assert!(!table.check(&CellId::from("ghost"), Capability::DataRead));
    }

    #[test]
    fn reregistration_replaces_the_whole_grant() {
        let table = CapabilityTable::new();
        table
            .register(&script("s1", &[Capability::DataRead, Capability::UiRender]))
            .unwrap();
        table.register(&script("s1", &[Capability::UiRender])).unwrap();

        let cell = CellId::from("s1");
        assert!(!table.check(&cell, Capability::DataRead));
        assert!(table.check(&cell, Capability::UiRender));
    }

    #[test]
    fn empty_grant_still_counts_as_configured() {
        let table = CapabilityTable::new();
        table.register(&script("s1", &[])).unwrap();

        let cell = CellId::from("s1");
        assert!(table.has_grant(&cell));
        assert!(!table.check(&cell, Capability::DataRead));
    }

    #[test]
    fn revoked_cells_fail_closed_again() {
        let table = CapabilityTable::new();
        table.register(&script("s1", &[Capability::DataRead])).unwrap();

        let cell = CellId::from("s1");
        assert!(table.check(&cell, Capability::DataRead));

        let removed = table.revoke(&cell).unwrap();
        assert!(removed.covers(Capability::DataRead));
        assert!(!table.has_grant(&cell));
        assert!(!table.check(&cell, Capability::DataRead));
    }

    #[test]
    fn invalid_descriptor_is_rejected() {
        let table = CapabilityTable::new();
        let mut desc = CellDescriptor::builtin("b1");
        desc.code = Some("nope".to_string());
        assert!(matches!(
            table.register(&desc),
            Err(PolicyError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn custom_whitelist_caps_builtins_too() {
        let whitelist =
            PolicyWhitelist::new().with_allowed(CellKind::Builtin, [Capability::UiRender]);
        let table = CapabilityTable::with_whitelist(whitelist);
        let grant = table
            .register(
                &CellDescriptor::builtin("b1")
                    .with_capabilities([Capability::UiRender, Capability::NetworkFetch]),
            )
            .unwrap();
        assert!(grant.covers(Capability::UiRender));
        assert!(!grant.covers(Capability::NetworkFetch));
    }

    proptest! {
        #[test]
        fn check_never_grants_to_unregistered_ids(id in "[a-z0-9-]{1,32}") {
            let table = CapabilityTable::new();
            let cell = CellId::new(id);
            for cap in Capability::ALL {
                prop_assert!(!table.check(&cell, cap));
            }
        }

        #[test]
        fn grant_never_exceeds_declared_set(caps in prop::collection::btree_set(0usize..7, 0..7)) {
            let declared: Vec<Capability> =
                caps.iter().map(|&i| Capability::ALL[i]).collect();
            let table = CapabilityTable::new();
            let grant = table.register(&script("s1", &declared)).unwrap();
            for cap in &grant.capabilities {
                prop_assert!(declared.contains(cap));
            }
        }
    }
}
