//! Execution router.
//!
//! Classifies each cell by kind and dispatches it to one of three execution
//! strategies. The strategy set is a closed enum: adding one is a
//! deliberate, auditable change, not a runtime extension point.

use cellbox_kernel::{
    AuditAction, AuditLog, BackgroundExecutor, InProcessExecutor, IsolatedExecutor,
    ResourceMonitor,
};
use cellbox_policy::CapabilityTable;
use cellbox_types::{
    Capability, CellDescriptor, CellId, CellKind, ExecutionFailure, ExecutionRequest,
    ExecutionResult, FailureKind, RequestId,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// The fixed set of execution strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// Trusted built-ins, behind the facade, no serialization boundary.
    InProcess,
    /// Untrusted code in an isolated context.
    Isolated,
    /// CPU-heavy, UI-less work on the background pool.
    Background,
}

impl ExecutorKind {
    /// Strategy name as recorded in the audit stream.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutorKind::InProcess => "in-process",
            ExecutorKind::Isolated => "isolated",
            ExecutorKind::Background => "background",
        }
    }
}

/// Routes execution requests to their strategy.
pub struct ExecutionRouter {
    table: Arc<CapabilityTable>,
    monitor: Arc<ResourceMonitor>,
    audit: Arc<AuditLog>,
    pub(crate) in_process: InProcessExecutor,
    pub(crate) isolated: IsolatedExecutor,
    pub(crate) background: BackgroundExecutor,
    in_flight: DashMap<CellId, RequestId>,
}

impl ExecutionRouter {
    /// Assemble the router from its collaborators.
    #[must_use]
    pub fn new(
        table: Arc<CapabilityTable>,
        monitor: Arc<ResourceMonitor>,
        audit: Arc<AuditLog>,
        in_process: InProcessExecutor,
        isolated: IsolatedExecutor,
        background: BackgroundExecutor,
    ) -> Self {
        Self {
            table,
            monitor,
            audit,
            in_process,
            isolated,
            background,
            in_flight: DashMap::new(),
        }
    }

    /// Routing is deterministic by kind: built-ins run in process, declared
    /// heavy computation goes to the background pool, everything else is
    /// isolated.
    #[must_use]
    pub fn classify(descriptor: &CellDescriptor) -> ExecutorKind {
        match descriptor.kind {
            CellKind::Builtin => ExecutorKind::InProcess,
            CellKind::UserScript | CellKind::Dsl => {
                if descriptor.declares(Capability::ComputeHeavy) {
                    ExecutorKind::Background
                } else {
                    ExecutorKind::Isolated
                }
            }
        }
    }

    /// Route one invocation to its terminal result.
    ///
    /// Suspends until the executor's terminal message; never blocks the
    /// host thread. Requests for the same cell are strictly serialized:
    /// a second request while one is outstanding fails with
    /// `AlreadyExecuting` — no queuing, no cancellation of the prior one.
    pub async fn route(
        &self,
        descriptor: &CellDescriptor,
        payload: serde_json::Value,
    ) -> ExecutionResult {
        if !self.table.has_grant(&descriptor.id) {
            return Err(ExecutionFailure::new(
                FailureKind::PermissionConfigMissing,
                format!("no capability grant recorded for {}", descriptor.id),
            ));
        }

        let request = ExecutionRequest::new(descriptor.id.clone(), payload);

        match self.in_flight.entry(descriptor.id.clone()) {
            Entry::Occupied(_) => {
                return Err(ExecutionFailure::new(
                    FailureKind::AlreadyExecuting,
                    format!("a request is already outstanding for {}", descriptor.id),
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert(request.request_id);
            }
        }

        self.monitor.begin(&request.cell_id);

        let kind = Self::classify(descriptor);
        self.audit.record(
            &request.cell_id,
            AuditAction::RouteSelected {
                strategy: kind.as_str().to_string(),
            },
        );
        tracing::info!(
            cell = %request.cell_id,
            request = %request.request_id,
            strategy = kind.as_str(),
            "routing execution request"
        );

        let result = match kind {
            ExecutorKind::InProcess => self.in_process.execute(&request, descriptor).await,
            ExecutorKind::Isolated => self.isolated.execute(&request, descriptor).await,
            ExecutorKind::Background => self.background.execute(&request, descriptor).await,
        };

        self.monitor.finish(&request.cell_id);
        self.in_flight.remove(&descriptor.id);

        result
    }

    /// Number of requests currently in flight.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}
