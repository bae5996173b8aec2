//! Isolated executor.
//!
//! Runs untrusted cell code in a pooled isolated context. One execution
//! walks the full state machine: the context is acquired, probed for
//! liveness, handed the payload only after the ready ack, and awaited under
//! the execution budget measured from that ack. Clean completions return the
//! context to the pool; failures and timeouts destroy it so no state can
//! leak into a future cell's execution.

use crate::audit::{AuditAction, AuditLog};
use crate::broker::MessageBroker;
use crate::context::{ContextHandle, ContextPool, ContextSeed, PoolStats};
use crate::facade::HostCall;
use crate::program::{ExecutePayload, ProgramResolver};
use cellbox_types::{
    CellDescriptor, CellId, Envelope, ExecutionFailure, ExecutionRequest, ExecutionResult,
    FailureKind, SandboxLimits,
};
use std::sync::Arc;
use tokio::sync::mpsc;

enum Boot {
    Ready,
    Terminal(ExecutionResult),
    TimedOut,
}

/// Executes untrusted cells in isolated contexts.
pub struct IsolatedExecutor {
    pool: ContextPool,
    broker: Arc<MessageBroker>,
    audit: Arc<AuditLog>,
    limits: SandboxLimits,
}

impl IsolatedExecutor {
    /// Wire the executor to the broker and the host-call mediator.
    #[must_use]
    pub fn new(
        limits: SandboxLimits,
        broker: Arc<MessageBroker>,
        audit: Arc<AuditLog>,
        resolver: Arc<dyn ProgramResolver>,
        host_calls: mpsc::Sender<HostCall>,
    ) -> Self {
        let seed = ContextSeed {
            resolver,
            host_calls,
            outbox: broker.inbox(),
        };
        Self {
            pool: ContextPool::new(limits.context_pool_size, seed),
            broker,
            audit,
            limits,
        }
    }

    /// Pool counters, mainly for observability and tests.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Run one request to its terminal result.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        descriptor: &CellDescriptor,
    ) -> ExecutionResult {
        let ctx = self.pool.acquire();

        let mut ticket = match self
            .broker
            .register(request.request_id, request.cell_id.clone(), Some(ctx.id()))
        {
            Ok(ticket) => ticket,
            Err(err) => {
                self.pool.release(ctx);
                return Err(ExecutionFailure::new(
                    FailureKind::ExecutionFault,
                    err.to_string(),
                ));
            }
        };

        // Liveness probe. The payload is never sent before the ack.
        if ctx.send(&Envelope::ready(request.request_id)).await.is_err() {
            self.broker.abandon(&request.request_id);
            self.destroy(&request.cell_id, ctx, "channel closed during handshake");
            return Err(ExecutionFailure::new(
                FailureKind::ExecutionFault,
                "context channel closed during handshake",
            ));
        }

        let boot = tokio::select! {
            ack = &mut ticket.ready_rx => match ack {
                Ok(()) => Boot::Ready,
                Err(_) => Boot::Terminal(Err(ExecutionFailure::new(
                    FailureKind::ExecutionFault,
                    "correlator dropped the request",
                ))),
            },
            terminal = &mut ticket.result_rx => {
                Boot::Terminal(terminal.unwrap_or_else(|_| Err(ExecutionFailure::new(
                    FailureKind::ExecutionFault,
                    "correlator dropped the request",
                ))))
            }
            () = tokio::time::sleep(self.limits.boot_timeout()) => Boot::TimedOut,
        };

        match boot {
            Boot::Ready => {}
            Boot::Terminal(result) => {
                self.destroy(&request.cell_id, ctx, "terminal before handshake");
                return result;
            }
            Boot::TimedOut => {
                self.broker.expire(
                    &request.request_id,
                    format!(
                        "context failed liveness handshake within {}ms",
                        self.limits.boot_timeout_ms
                    ),
                );
                let result = ticket.result_rx.await.unwrap_or_else(|_| {
                    Err(ExecutionFailure::new(
                        FailureKind::TimedOut,
                        "context failed liveness handshake",
                    ))
                });
                self.destroy(&request.cell_id, ctx, "boot timeout");
                return result;
            }
        }

        // Dispatch. Running is marked first so a fast reply cannot race the
        // state transition.
        if self.broker.mark_running(&request.request_id).is_ok() {
            let payload = ExecutePayload::new(descriptor.clone(), request.payload.clone());
            let envelope = Envelope::execute(
                request.request_id,
                serde_json::to_value(&payload).unwrap_or(serde_json::Value::Null),
            );
            if ctx.send(&envelope).await.is_err() {
                self.broker.fail(
                    &request.request_id,
                    FailureKind::ExecutionFault,
                    "context channel closed at dispatch",
                );
            }
        }

        // The execution budget is measured from the ready ack, not from
        // context allocation.
        let result = match tokio::time::timeout(
            self.limits.execution_timeout(),
            &mut ticket.result_rx,
        )
        .await
        {
            Ok(delivered) => delivered.unwrap_or_else(|_| {
                Err(ExecutionFailure::new(
                    FailureKind::ExecutionFault,
                    "correlator dropped the request",
                ))
            }),
            Err(_elapsed) => {
                self.broker.expire(
                    &request.request_id,
                    format!(
                        "no terminal reply within {}ms",
                        self.limits.execution_timeout_ms
                    ),
                );
                ticket.result_rx.await.unwrap_or_else(|_| {
                    Err(ExecutionFailure::new(
                        FailureKind::TimedOut,
                        format!(
                            "no terminal reply within {}ms",
                            self.limits.execution_timeout_ms
                        ),
                    ))
                })
            }
        };

        // Teardown policy: pool on success, destroy on anything else.
        match &result {
            Ok(_) => self.pool.release(ctx),
            Err(failure) => self.destroy(&request.cell_id, ctx, failure.kind.as_str()),
        }
        result
    }

    fn destroy(&self, cell_id: &CellId, ctx: ContextHandle, reason: &str) {
        self.audit.record(
            cell_id,
            AuditAction::ContextDestroyed {
                reason: reason.to_string(),
            },
        );
        self.pool.discard(ctx);
    }

    /// Destroy idle contexts.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProgramError;
    use crate::monitor::ResourceMonitor;
    use crate::program::{CellProgram, ProgramIo};
    use serde_json::json;
    use std::time::Duration;

    struct Echo;

    #[async_trait::async_trait]
    impl CellProgram for Echo {
        async fn run(
            &self,
            payload: serde_json::Value,
            io: &ProgramIo,
        ) -> Result<serde_json::Value, ProgramError> {
            io.log(cellbox_types::LogLevel::Info, "running");
            Ok(payload)
        }
    }

    struct Stall;

    #[async_trait::async_trait]
    impl CellProgram for Stall {
        async fn run(
            &self,
            _payload: serde_json::Value,
            _io: &ProgramIo,
        ) -> Result<serde_json::Value, ProgramError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(serde_json::Value::Null)
        }
    }

    struct KindResolver;

    impl ProgramResolver for KindResolver {
        fn resolve(
            &self,
            descriptor: &CellDescriptor,
        ) -> Result<Arc<dyn CellProgram>, ProgramError> {
            match descriptor.code.as_deref() {
                Some("stall") => Ok(Arc::new(Stall)),
                Some(_) => Ok(Arc::new(Echo)),
                None => Err(ProgramError::Unresolvable(descriptor.id.to_string())),
            }
        }
    }

    fn executor(limits: SandboxLimits) -> (IsolatedExecutor, Arc<ResourceMonitor>, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::new());
        let monitor = Arc::new(ResourceMonitor::new(limits.clone(), Arc::clone(&audit)));
        let broker = MessageBroker::spawn(Arc::clone(&monitor), Arc::clone(&audit));
        let (host_calls, _rx) = mpsc::channel(8);
        let exec = IsolatedExecutor::new(
            limits,
            broker,
            Arc::clone(&audit),
            Arc::new(KindResolver),
            host_calls,
        );
        (exec, monitor, audit)
    }

    #[tokio::test]
    async fn successful_execution_returns_output_and_logs() {
        let (exec, monitor, _) = executor(SandboxLimits::default());
        let descriptor = CellDescriptor::user_script("s1", "echo");
        let request = ExecutionRequest::new(descriptor.id.clone(), json!({ "n": 1 }));
        monitor.begin(&request.cell_id);

        let output = exec.execute(&request, &descriptor).await.unwrap();
        assert_eq!(output.output, json!({ "n": 1 }));
        assert_eq!(output.logs.len(), 1);
        assert_eq!(output.logs[0].message, "running");
    }

    #[tokio::test]
    async fn completed_contexts_are_pooled_and_reused() {
        let (exec, monitor, _) = executor(SandboxLimits::default());
        let descriptor = CellDescriptor::user_script("s1", "echo");

        for _ in 0..2 {
            let request = ExecutionRequest::new(descriptor.id.clone(), json!(null));
            monitor.begin(&request.cell_id);
            exec.execute(&request, &descriptor).await.unwrap();
            monitor.finish(&request.cell_id);
        }

        let stats = exec.pool_stats();
        assert_eq!(stats.spawned, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.destroyed, 0);
    }

    #[tokio::test]
    async fn timed_out_contexts_are_destroyed_not_pooled() {
        let limits = SandboxLimits::default().with_execution_timeout_ms(50);
        let (exec, monitor, audit) = executor(limits);
        let descriptor = CellDescriptor::user_script("s1", "stall");
        let request = ExecutionRequest::new(descriptor.id.clone(), json!(null));
        monitor.begin(&request.cell_id);

        let failure = exec.execute(&request, &descriptor).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::TimedOut);

        let stats = exec.pool_stats();
        assert_eq!(stats.destroyed, 1);
        assert_eq!(stats.idle, 0);
        assert!(audit
            .events_for(&request.cell_id)
            .iter()
            .any(|e| matches!(e.action, AuditAction::ContextDestroyed { .. })));
    }

    #[tokio::test]
    async fn unresolvable_programs_fail_with_execution_fault() {
        let (exec, monitor, _) = executor(SandboxLimits::default());
        // Resolver errors on missing code; build a descriptor that parses
        // but cannot resolve.
        let mut descriptor = CellDescriptor::user_script("s1", "x");
        descriptor.code = None;
        let request = ExecutionRequest::new(descriptor.id.clone(), json!(null));
        monitor.begin(&request.cell_id);

        let failure = exec.execute(&request, &descriptor).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::ExecutionFault);
    }
}
