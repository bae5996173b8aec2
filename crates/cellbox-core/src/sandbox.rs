//! The sandbox orchestrator.
//!
//! [`CellSandbox`] is the single assembly point: it owns the capability
//! table, audit log, monitor, broker and the three executors, all wired by
//! explicit dependency injection. Nothing in the workspace reaches for
//! ambient global state, which keeps authorization and limit enforcement
//! testable in isolation.

use crate::router::ExecutionRouter;
use cellbox_kernel::{
    spawn_host_mediator, AuditAction, AuditLog, BackgroundExecutor, BuiltinRegistry,
    BuiltinWidget, HostServices, InProcessExecutor, IsolatedExecutor, MessageBroker, PoolStats,
    ProgramResolver, ResourceMonitor,
};
use cellbox_policy::{CapabilityGrant, CapabilityTable, PolicyError, PolicyWhitelist};
use cellbox_types::{
    parse_manifest, CellDescriptor, CellId, CellKind, ExecutionFailure, ExecutionResult,
    FailureKind, SandboxLimits,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Sandbox-wide configuration.
#[derive(Debug, Clone, Default)]
pub struct SandboxConfig {
    /// Execution limits.
    pub limits: SandboxLimits,
    /// Kind-level capability ceilings.
    pub whitelist: PolicyWhitelist,
}

impl SandboxConfig {
    /// Default configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With execution limits.
    #[inline]
    #[must_use]
    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    /// With a capability whitelist.
    #[inline]
    #[must_use]
    pub fn with_whitelist(mut self, whitelist: PolicyWhitelist) -> Self {
        self.whitelist = whitelist;
        self
    }
}

/// Owns and wires the whole sandbox.
///
/// Construction spawns the broker dispatcher, the host-call mediator and the
/// background pool, so a sandbox must be created inside a Tokio runtime.
pub struct CellSandbox {
    table: Arc<CapabilityTable>,
    audit: Arc<AuditLog>,
    broker: Arc<MessageBroker>,
    registry: Arc<BuiltinRegistry>,
    router: ExecutionRouter,
    descriptors: DashMap<CellId, CellDescriptor>,
    mediator: Mutex<Option<JoinHandle<()>>>,
}

impl CellSandbox {
    /// Sandbox with default configuration.
    #[must_use]
    pub fn new(services: Arc<dyn HostServices>, resolver: Arc<dyn ProgramResolver>) -> Self {
        Self::with_config(SandboxConfig::default(), services, resolver)
    }

    /// Sandbox with explicit configuration.
    #[must_use]
    pub fn with_config(
        config: SandboxConfig,
        services: Arc<dyn HostServices>,
        resolver: Arc<dyn ProgramResolver>,
    ) -> Self {
        let limits = config.limits;
        let table = Arc::new(CapabilityTable::with_whitelist(config.whitelist));
        let audit = Arc::new(AuditLog::new());
        let monitor = Arc::new(ResourceMonitor::new(limits.clone(), Arc::clone(&audit)));
        let broker = MessageBroker::spawn(Arc::clone(&monitor), Arc::clone(&audit));
        let registry = Arc::new(BuiltinRegistry::new());

        let (host_calls, mediator) = spawn_host_mediator(
            Arc::clone(&table),
            Arc::clone(&services),
            Arc::clone(&audit),
        );

        let in_process = InProcessExecutor::new(
            limits.clone(),
            Arc::clone(&registry),
            Arc::clone(&table),
            services,
            Arc::clone(&monitor),
            Arc::clone(&audit),
        );
        let isolated = IsolatedExecutor::new(
            limits.clone(),
            Arc::clone(&broker),
            Arc::clone(&audit),
            Arc::clone(&resolver),
            host_calls.clone(),
        );
        let background = BackgroundExecutor::new(
            limits,
            Arc::clone(&broker),
            Arc::clone(&audit),
            resolver,
            host_calls,
        );

        let router = ExecutionRouter::new(
            Arc::clone(&table),
            monitor,
            Arc::clone(&audit),
            in_process,
            isolated,
            background,
        );

        Self {
            table,
            audit,
            broker,
            registry,
            router,
            descriptors: DashMap::new(),
            mediator: Mutex::new(Some(mediator)),
        }
    }

    /// Register (or re-register) a cell, writing its capability grant.
    pub fn register_cell(&self, descriptor: CellDescriptor) -> Result<CapabilityGrant, PolicyError> {
        let grant = self.table.register(&descriptor)?;
        self.audit.record(
            &descriptor.id,
            AuditAction::GrantWritten {
                capabilities: grant.capabilities.len(),
            },
        );
        self.descriptors.insert(descriptor.id.clone(), descriptor);
        Ok(grant)
    }

    /// Register a cell from its manifest form: a permission string list as
    /// supplied by the dashboard composition layer. Unrecognized permission
    /// strings are rejected here, not silently ignored.
    pub fn register_manifest<S: AsRef<str>>(
        &self,
        id: impl Into<CellId>,
        kind: CellKind,
        code: Option<String>,
        permissions: &[S],
    ) -> Result<CapabilityGrant, PolicyError> {
        let declared = parse_manifest(permissions)?;
        let descriptor = CellDescriptor {
            id: id.into(),
            kind,
            code,
            declared_capabilities: declared,
            position: serde_json::Value::Null,
        };
        self.register_cell(descriptor)
    }

    /// Remove a cell: its descriptor is dropped and its grant revoked.
    pub fn remove_cell(&self, cell_id: &CellId) -> bool {
        let existed = self.descriptors.remove(cell_id).is_some();
        if self.table.revoke(cell_id).is_some() {
            self.audit.record(cell_id, AuditAction::GrantRevoked);
        }
        existed
    }

    /// Register a built-in widget implementation.
    pub fn register_builtin(&self, widget: Arc<dyn BuiltinWidget>) {
        self.registry.register(widget);
    }

    /// Execute a registered cell with the given payload.
    pub async fn execute(
        &self,
        cell_id: &CellId,
        payload: serde_json::Value,
    ) -> ExecutionResult {
        let Some(descriptor) = self.descriptors.get(cell_id).map(|d| d.clone()) else {
            return Err(ExecutionFailure::new(
                FailureKind::PermissionConfigMissing,
                format!("no cell registered as {cell_id}"),
            ));
        };
        self.router.route(&descriptor, payload).await
    }

    /// The audit stream.
    #[must_use]
    pub fn audit(&self) -> Arc<AuditLog> {
        Arc::clone(&self.audit)
    }

    /// The capability table.
    #[must_use]
    pub fn capability_table(&self) -> Arc<CapabilityTable> {
        Arc::clone(&self.table)
    }

    /// Isolated context pool counters.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.router.isolated.pool_stats()
    }

    /// Requests currently in flight.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.router.in_flight_count()
    }

    /// Stop the broker dispatcher, the background pool, idle contexts and
    /// the host-call mediator. In-flight requests resolve through their
    /// timeout paths.
    pub fn shutdown(&self) {
        self.broker.shutdown();
        self.router.background.shutdown();
        self.router.isolated.shutdown();
        if let Some(handle) = self.mediator.lock().take() {
            handle.abort();
        }
    }
}
