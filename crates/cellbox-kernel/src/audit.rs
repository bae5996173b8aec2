//! Append-only audit log.
//!
//! Every authorization check, limit violation, dropped message and context
//! teardown lands here, hash-chained so tampering (or accidental mutation)
//! is detectable with [`AuditLog::verify_integrity`].

use crate::error::AuditIntegrityError;
use cellbox_types::{Capability, CellId, EventId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AuditAction {
    /// The router picked an execution strategy for a request.
    RouteSelected {
        /// Strategy name (`in-process`, `isolated`, `background`).
        strategy: String,
    },
    /// The facade checked a capability on behalf of a host operation.
    CapabilityChecked {
        /// The capability that gated the operation.
        capability: Capability,
        /// Operation name, e.g. `data.query`.
        operation: String,
        /// Outcome of the check.
        granted: bool,
    },
    /// A grant record was written at registration.
    GrantWritten {
        /// Number of capabilities granted.
        capabilities: usize,
    },
    /// A grant record was removed.
    GrantRevoked,
    /// A resource limit was breached.
    LimitViolation {
        /// Stable cause string (a `FailureKind`).
        cause: String,
    },
    /// An inbound message was dropped without being acted upon.
    MessageDropped {
        /// Why the message was dropped.
        reason: String,
    },
    /// An execution context was destroyed rather than pooled.
    ContextDestroyed {
        /// Why the context could not be reused.
        reason: String,
    },
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: EventId,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// The cell the event concerns, when attributable.
    pub cell_id: Option<CellId>,
    /// What happened.
    pub action: AuditAction,
    /// Hash of the previous event (zeros for the first).
    pub prev_hash: [u8; 32],
    /// Hash of this event.
    pub hash: [u8; 32],
}

/// Append-only, hash-chained event log.
#[derive(Debug, Default)]
pub struct AuditLog {
    inner: Mutex<Vec<AuditEvent>>,
}

impl AuditLog {
    /// Empty log.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event attributed to a cell.
    pub fn record(&self, cell_id: &CellId, action: AuditAction) -> EventId {
        self.append(Some(cell_id.clone()), action)
    }

    /// Append an event that cannot be attributed to a cell
    /// (e.g. a stray message for an unknown request).
    pub fn record_unattributed(&self, action: AuditAction) -> EventId {
        self.append(None, action)
    }

    fn append(&self, cell_id: Option<CellId>, action: AuditAction) -> EventId {
        let mut event = AuditEvent {
            event_id: EventId::new(),
            timestamp: now_millis(),
            cell_id,
            action,
            prev_hash: [0u8; 32],
            hash: [0u8; 32],
        };

        let mut guard = self.inner.lock();
        event.prev_hash = guard.last().map(|e| e.hash).unwrap_or([0u8; 32]);
        event.hash = compute_hash(&event);
        let id = event.event_id;
        guard.push(event);
        id
    }

    /// Snapshot of all events in append order.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.inner.lock().clone()
    }

    /// Snapshot of the events attributed to one cell.
    #[must_use]
    pub fn events_for(&self, cell_id: &CellId) -> Vec<AuditEvent> {
        self.inner
            .lock()
            .iter()
            .filter(|e| e.cell_id.as_ref() == Some(cell_id))
            .cloned()
            .collect()
    }

    /// Number of events recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Walk the chain and verify every link.
    pub fn verify_integrity(&self) -> Result<(), AuditIntegrityError> {
        let guard = self.inner.lock();
        let mut prev = [0u8; 32];
        for (index, e) in guard.iter().enumerate() {
            if e.prev_hash != prev || compute_hash(e) != e.hash {
                return Err(AuditIntegrityError { index });
            }
            prev = e.hash;
        }
        Ok(())
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn compute_hash(event: &AuditEvent) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(event.event_id.0.as_bytes());
    hasher.update(event.timestamp.to_le_bytes());
    if let Some(cell) = &event.cell_id {
        hasher.update(cell.as_str().as_bytes());
    }
    hasher.update([0]);
    // The action serializes deterministically: field order is fixed by the
    // enum definition.
    let action = serde_json::to_string(&event.action).unwrap_or_default();
    hasher.update(action.as_bytes());
    hasher.update([0]);
    hasher.update(event.prev_hash);
    hasher.finalize().into()
}
