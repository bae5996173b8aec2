//! Capability-filtered host facade.
//!
//! Cell code never touches host services directly. The reachable surface is
//! the closed [`HostOp`] enum; every invocation passes through
//! [`HostFacade::invoke`], which checks the capability table and appends the
//! check (granted or denied) to the audit stream before delegating.
//!
//! For in-process built-ins the facade wraps live host objects with no
//! serialization boundary. Isolated and background cells reach the same
//! checks through a [`HostPort`], whose calls cross the isolation boundary
//! over a channel and are mediated host-side.

use crate::audit::{AuditAction, AuditLog};
use crate::error::{FacadeError, HostError};
use cellbox_policy::CapabilityTable;
use cellbox_types::{Capability, CellId};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// The complete set of host operations reachable from cell code.
///
/// Deliberately a closed enum: adding an operation is an auditable change,
/// not a runtime extension point, and the set stays a strict hand-reviewed
/// subset of the host API surface.
#[derive(Debug, Clone, PartialEq)]
pub enum HostOp {
    /// Query a dashboard data source.
    DataQuery(serde_json::Value),
    /// Write back to a dashboard data source.
    DataWrite(serde_json::Value),
    /// Read a value from the persistence layer.
    StorageGet(String),
    /// Write a value to the persistence layer.
    StoragePut(String, serde_json::Value),
    /// Emit a render fragment to the UI layer.
    Render(serde_json::Value),
    /// Fetch a remote resource.
    Fetch(String),
}

impl HostOp {
    /// Operation name as recorded in the audit stream.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            HostOp::DataQuery(_) => "data.query",
            HostOp::DataWrite(_) => "data.write",
            HostOp::StorageGet(_) => "storage.get",
            HostOp::StoragePut(_, _) => "storage.put",
            HostOp::Render(_) => "ui.render",
            HostOp::Fetch(_) => "network.fetch",
        }
    }

    /// The capability gating this operation.
    #[must_use]
    pub fn required_capability(&self) -> Capability {
        match self {
            HostOp::DataQuery(_) => Capability::DataRead,
            HostOp::DataWrite(_) => Capability::DataWrite,
            HostOp::StorageGet(_) => Capability::StorageRead,
            HostOp::StoragePut(_, _) => Capability::StorageWrite,
            HostOp::Render(_) => Capability::UiRender,
            HostOp::Fetch(_) => Capability::NetworkFetch,
        }
    }
}

/// The host-side collaborators behind the facade: data sources, the
/// persistence layer, the UI renderer, the network stack.
///
/// Out of scope here; implemented by the embedding dashboard.
#[async_trait::async_trait]
pub trait HostServices: Send + Sync {
    /// Perform an already-authorized operation on behalf of a cell.
    async fn perform(
        &self,
        cell_id: &CellId,
        op: &HostOp,
    ) -> Result<serde_json::Value, HostError>;
}

/// Restricted wrapper exposing only permitted operations of the host.
#[derive(Clone)]
pub struct HostFacade {
    cell_id: CellId,
    table: Arc<CapabilityTable>,
    services: Arc<dyn HostServices>,
    audit: Arc<AuditLog>,
}

impl HostFacade {
    /// Facade bound to one cell.
    #[must_use]
    pub fn new(
        cell_id: CellId,
        table: Arc<CapabilityTable>,
        services: Arc<dyn HostServices>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            cell_id,
            table,
            services,
            audit,
        }
    }

    /// The cell this facade is bound to.
    #[inline]
    #[must_use]
    pub fn cell_id(&self) -> &CellId {
        &self.cell_id
    }

    /// Check, audit, and perform one host operation.
    ///
    /// A denied check returns [`FacadeError::PermissionDenied`] to the cell;
    /// it does not abort the execution.
    pub async fn invoke(&self, op: HostOp) -> Result<serde_json::Value, FacadeError> {
        let capability = op.required_capability();
        let granted = self.table.check(&self.cell_id, capability);

        self.audit.record(
            &self.cell_id,
            AuditAction::CapabilityChecked {
                capability,
                operation: op.name().to_string(),
                granted,
            },
        );

        if !granted {
            tracing::debug!(
                cell = %self.cell_id,
                operation = op.name(),
                %capability,
                "host operation denied"
            );
            return Err(FacadeError::PermissionDenied {
                capability,
                operation: op.name(),
            });
        }

        Ok(self.services.perform(&self.cell_id, &op).await?)
    }
}

/// One host call crossing the isolation boundary.
#[derive(Debug)]
pub struct HostCall {
    /// The calling cell.
    pub cell_id: CellId,
    /// The requested operation.
    pub op: HostOp,
    /// Where the mediator sends the outcome.
    pub reply: oneshot::Sender<Result<serde_json::Value, FacadeError>>,
}

/// Program-side handle: the only path from an execution context to the host.
#[derive(Clone)]
pub struct HostPort {
    cell_id: CellId,
    calls: mpsc::Sender<HostCall>,
    /// Background workers carry no rendering surface.
    allow_render: bool,
}

impl HostPort {
    pub(crate) fn new(cell_id: CellId, calls: mpsc::Sender<HostCall>, allow_render: bool) -> Self {
        Self {
            cell_id,
            calls,
            allow_render,
        }
    }

    /// Request one host operation and await the mediated outcome.
    pub async fn call(&self, op: HostOp) -> Result<serde_json::Value, FacadeError> {
        if !self.allow_render {
            if let HostOp::Render(_) = op {
                return Err(FacadeError::PermissionDenied {
                    capability: Capability::UiRender,
                    operation: op.name(),
                });
            }
        }

        let (reply, rx) = oneshot::channel();
        self.calls
            .send(HostCall {
                cell_id: self.cell_id.clone(),
                op,
                reply,
            })
            .await
            .map_err(|_| FacadeError::Detached)?;
        rx.await.map_err(|_| FacadeError::Detached)?
    }
}

/// Spawn the host-side mediator that drains [`HostCall`]s through the facade
/// checks. Returns the call sender handed to contexts and the task handle.
pub fn spawn_host_mediator(
    table: Arc<CapabilityTable>,
    services: Arc<dyn HostServices>,
    audit: Arc<AuditLog>,
) -> (mpsc::Sender<HostCall>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<HostCall>(64);
    let handle = tokio::spawn(async move {
        while let Some(call) = rx.recv().await {
            let facade = HostFacade::new(
                call.cell_id,
                Arc::clone(&table),
                Arc::clone(&services),
                Arc::clone(&audit),
            );
            let outcome = facade.invoke(call.op).await;
            // Caller may have been torn down mid-call.
            let _ = call.reply.send(outcome);
        }
    });
    (tx, handle)
}
