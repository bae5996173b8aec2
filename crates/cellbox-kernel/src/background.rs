//! Background compute executor.
//!
//! CPU-heavy, UI-less work runs on a fixed-size pool of workers fed by a
//! bounded FIFO queue. A full queue fails the request fast with
//! `Overloaded` instead of growing without bound. Workers speak the same
//! wire protocol as isolated contexts — ready handshake, log messages, one
//! terminal reply — but carry no rendering surface.
//!
//! A worker whose execution fails or times out is destroyed and replaced,
//! mirroring the isolated teardown policy.

use crate::audit::{AuditAction, AuditLog};
use crate::broker::MessageBroker;
use crate::context::run_payload;
use crate::facade::HostCall;
use crate::program::{ExecutePayload, ProgramResolver};
use cellbox_types::{
    CellDescriptor, CellId, ContextId, Envelope, ExecutionFailure, ExecutionRequest,
    ExecutionResult, FailureKind, MessageType, RequestId, SandboxLimits,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy)]
struct Job {
    request_id: RequestId,
}

#[derive(Debug)]
struct WorkerHandle {
    inbox: mpsc::Sender<serde_json::Value>,
    task: JoinHandle<()>,
}

enum Boot {
    Ready,
    Terminal(ExecutionResult),
    TimedOut,
}

/// Fixed pool of background compute workers.
pub struct BackgroundExecutor {
    queue_tx: mpsc::Sender<Job>,
    jobs: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    workers: Mutex<HashMap<ContextId, WorkerHandle>>,
    broker: Arc<MessageBroker>,
    audit: Arc<AuditLog>,
    resolver: Arc<dyn ProgramResolver>,
    host_calls: mpsc::Sender<HostCall>,
    limits: SandboxLimits,
}

impl BackgroundExecutor {
    /// Spawn the worker pool.
    #[must_use]
    pub fn new(
        limits: SandboxLimits,
        broker: Arc<MessageBroker>,
        audit: Arc<AuditLog>,
        resolver: Arc<dyn ProgramResolver>,
        host_calls: mpsc::Sender<HostCall>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel::<Job>(limits.max_queue_depth.max(1));
        let executor = Self {
            queue_tx,
            jobs: Arc::new(tokio::sync::Mutex::new(queue_rx)),
            workers: Mutex::new(HashMap::new()),
            broker,
            audit,
            resolver,
            host_calls,
            limits,
        };
        for _ in 0..executor.limits.background_workers.max(1) {
            executor.spawn_worker();
        }
        executor
    }

    fn spawn_worker(&self) {
        let id = ContextId::new();
        let (inbox_tx, inbox_rx) = mpsc::channel::<serde_json::Value>(16);
        let task = tokio::spawn(worker_loop(
            id,
            Arc::clone(&self.jobs),
            inbox_rx,
            self.broker.inbox(),
            Arc::clone(&self.resolver),
            self.host_calls.clone(),
            self.limits.execution_timeout(),
        ));
        tracing::debug!(worker = %id, "background worker spawned");
        self.workers.lock().insert(
            id,
            WorkerHandle {
                inbox: inbox_tx,
                task,
            },
        );
    }

    fn replace_worker(&self, cell_id: &CellId, id: ContextId, reason: &str) {
        if let Some(handle) = self.workers.lock().remove(&id) {
            handle.task.abort();
            self.audit.record(
                cell_id,
                AuditAction::ContextDestroyed {
                    reason: reason.to_string(),
                },
            );
            tracing::warn!(worker = %id, reason, "background worker destroyed");
        }
        self.spawn_worker();
    }

    /// Run one request to its terminal result.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        descriptor: &CellDescriptor,
    ) -> ExecutionResult {
        let mut ticket = match self
            .broker
            .register(request.request_id, request.cell_id.clone(), None)
        {
            Ok(ticket) => ticket,
            Err(err) => {
                return Err(ExecutionFailure::new(
                    FailureKind::ExecutionFault,
                    err.to_string(),
                ))
            }
        };

        // Queue admission: fail fast when full, no unbounded growth.
        if let Err(err) = self.queue_tx.try_send(Job {
            request_id: request.request_id,
        }) {
            self.broker.abandon(&request.request_id);
            return match err {
                mpsc::error::TrySendError::Full(_) => Err(ExecutionFailure::new(
                    FailureKind::Overloaded,
                    format!(
                        "background queue full (depth {})",
                        self.limits.max_queue_depth
                    ),
                )),
                mpsc::error::TrySendError::Closed(_) => Err(ExecutionFailure::new(
                    FailureKind::ExecutionFault,
                    "background pool stopped",
                )),
            };
        }

        // Wait for a worker to pick the job up and bind itself via the
        // handshake. Queue wait counts against the overall budget here, not
        // against the post-ready execution budget.
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
            () = tokio::time::sleep(self.limits.execution_timeout()) => Boot::TimedOut,
        };

        match boot {
            Boot::Ready => {}
            Boot::Terminal(result) => return result,
            Boot::TimedOut => {
                self.broker.expire(
                    &request.request_id,
                    format!(
                        "no worker picked the request up within {}ms",
                        self.limits.execution_timeout_ms
                    ),
                );
                return ticket.result_rx.await.unwrap_or_else(|_| {
                    Err(ExecutionFailure::new(
                        FailureKind::TimedOut,
                        "no worker picked the request up",
                    ))
                });
            }
        }

        let worker_id = self.broker.bound_context(&request.request_id);

        // Dispatch the payload to the worker that answered the handshake.
        if self.broker.mark_running(&request.request_id).is_ok() {
            let dispatched = match worker_id.and_then(|id| {
                self.workers.lock().get(&id).map(|w| w.inbox.clone())
            }) {
                Some(inbox) => {
                    let payload = ExecutePayload::new(descriptor.clone(), request.payload.clone());
                    let envelope = Envelope::execute(
                        request.request_id,
                        serde_json::to_value(&payload).unwrap_or(serde_json::Value::Null),
                    );
                    let raw = serde_json::to_value(&envelope).unwrap_or(serde_json::Value::Null);
                    inbox.send(raw).await.is_ok()
                }
                None => false,
            };
            if !dispatched {
                self.broker.fail(
                    &request.request_id,
                    FailureKind::ExecutionFault,
                    "worker unavailable at dispatch",
                );
            }
        }

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

        // A worker that failed or hung is destroyed and replaced.
        if result.is_err() {
            if let Some(id) = worker_id {
                let reason = result
                    .as_ref()
                    .err()
                    .map(|f| f.kind.as_str())
                    .unwrap_or("failed");
                self.replace_worker(&request.cell_id, id, reason);
            }
        }

        result
    }

    /// Number of live workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Abort every worker. Queued jobs are dropped.
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock();
        for (_, handle) in workers.drain() {
            handle.task.abort();
        }
    }
}

async fn worker_loop(
    id: ContextId,
    jobs: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    mut inbox: mpsc::Receiver<serde_json::Value>,
    outbox: mpsc::Sender<(ContextId, serde_json::Value)>,
    resolver: Arc<dyn ProgramResolver>,
    host_calls: mpsc::Sender<HostCall>,
    dispatch_wait: std::time::Duration,
) {
    loop {
        // Holding the lock only while waiting keeps pickup FIFO across the
        // pool: one idle worker parks on the queue at a time.
        let job = {
            let mut rx = jobs.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };

        // Bind to the request via the handshake.
        let ack = Envelope::ready(job.request_id);
        let raw = serde_json::to_value(&ack).unwrap_or(serde_json::Value::Null);
        if outbox.send((id, raw)).await.is_err() {
            break;
        }

        // Await the payload dispatch for this request; skip the job if the
        // host never follows through.
        loop {
            let message = tokio::time::timeout(dispatch_wait, inbox.recv()).await;
            match message {
                Err(_elapsed) => break,
                Ok(None) => return,
                Ok(Some(raw)) => {
                    let Ok(envelope) = Envelope::from_value(raw) else {
                        continue;
                    };
                    if envelope.request_id != job.request_id {
                        continue;
                    }
                    if envelope.kind == MessageType::Execute {
                        run_payload(
                            id,
                            envelope.request_id,
                            envelope.payload,
                            &resolver,
                            &host_calls,
                            &outbox,
                            // Background work has no rendering surface.
                            false,
                        )
                        .await;
                        break;
                    }
                }
            }
        }
    }
}
