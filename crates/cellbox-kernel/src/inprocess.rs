//! In-process mediated executor.
//!
//! Trusted built-in widgets run directly in the host process behind the
//! capability-filtered [`HostFacade`]. There is no serialization boundary,
//! which keeps latency low, and no message traffic, so limit enforcement
//! here reduces to the execution budget and the serialized-output cap
//! applied to the finished result.

use crate::audit::AuditLog;
use crate::error::ProgramError;
use crate::facade::{HostFacade, HostServices};
use crate::monitor::ResourceMonitor;
use crate::program::LogSink;
use cellbox_policy::CapabilityTable;
use cellbox_types::{
    CellDescriptor, ExecutionFailure, ExecutionOutput, ExecutionRequest, ExecutionResult,
    FailureKind, SandboxLimits,
};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;

/// A trusted widget shipped with the host.
#[async_trait::async_trait]
pub trait BuiltinWidget: Send + Sync {
    /// The cell id this widget answers to.
    fn widget_id(&self) -> &str;

    /// Produce the widget's output for one invocation.
    ///
    /// All host access goes through the facade; logs go to the sink.
    async fn render(
        &self,
        facade: &HostFacade,
        logs: &LogSink,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, ProgramError>;
}

/// Registry of built-in widgets, keyed by cell id.
#[derive(Default)]
pub struct BuiltinRegistry {
    widgets: DashMap<String, Arc<dyn BuiltinWidget>>,
}

impl BuiltinRegistry {
    /// Empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a widget under its id. Replaces any previous registration.
    pub fn register(&self, widget: Arc<dyn BuiltinWidget>) {
        self.widgets.insert(widget.widget_id().to_string(), widget);
    }

    /// Look a widget up by cell id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn BuiltinWidget>> {
        self.widgets.get(id).map(|w| Arc::clone(&w))
    }

    /// Number of registered widgets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.widgets.len()
    }

    /// Whether no widgets are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.widgets.is_empty()
    }
}

/// Executes trusted built-ins behind the facade.
pub struct InProcessExecutor {
    registry: Arc<BuiltinRegistry>,
    table: Arc<CapabilityTable>,
    services: Arc<dyn HostServices>,
    monitor: Arc<ResourceMonitor>,
    audit: Arc<AuditLog>,
    limits: SandboxLimits,
}

impl InProcessExecutor {
    /// Wire the executor to the policy table and host services.
    #[must_use]
    pub fn new(
        limits: SandboxLimits,
        registry: Arc<BuiltinRegistry>,
        table: Arc<CapabilityTable>,
        services: Arc<dyn HostServices>,
        monitor: Arc<ResourceMonitor>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            registry,
            table,
            services,
            monitor,
            audit,
            limits,
        }
    }

    /// Run one built-in invocation to its terminal result.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        descriptor: &CellDescriptor,
    ) -> ExecutionResult {
        let Some(widget) = self.registry.get(descriptor.id.as_str()) else {
            return Err(ExecutionFailure::new(
                FailureKind::ExecutionFault,
                format!("no built-in registered for {}", descriptor.id),
            ));
        };

        let facade = HostFacade::new(
            request.cell_id.clone(),
            Arc::clone(&self.table),
            Arc::clone(&self.services),
            Arc::clone(&self.audit),
        );
        let sink = LogSink::new();
        let started = Instant::now();

        let outcome = tokio::time::timeout(
            self.limits.execution_timeout(),
            widget.render(&facade, &sink, &request.payload),
        )
        .await;

        match outcome {
            Ok(Ok(output)) => {
                // No message boundary here, so the output cap is applied to
                // the finished value.
                let size = serde_json::to_string(&output).map_or(0, |s| s.len());
                if let Err(breach) = self.monitor.record_output(&request.cell_id, size) {
                    return Err(ExecutionFailure::new(breach.kind(), breach.to_string())
                        .with_logs(sink.drain()));
                }
                Ok(ExecutionOutput {
                    output,
                    logs: sink.drain(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
            Ok(Err(err)) => Err(ExecutionFailure::new(
                FailureKind::ExecutionFault,
                err.to_string(),
            )
            .with_logs(sink.drain())),
            Err(_elapsed) => Err(ExecutionFailure::new(
                FailureKind::TimedOut,
                format!(
                    "built-in did not finish within {}ms",
                    self.limits.execution_timeout_ms
                ),
            )
            .with_logs(sink.drain())),
        }
    }
}
