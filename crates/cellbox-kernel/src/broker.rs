//! Message broker and result correlator.
//!
//! The broker owns the correlation table keyed by request id and is the only
//! code path that mutates per-cell usage counters, so limit enforcement has
//! a single writer. Inbound messages are raw JSON tagged with the identity
//! of the context they arrived from; the broker validates the envelope, the
//! sender identity and the state machine before anything is acted upon.
//! Malformed or stray messages are dropped and audited, never delivered.
//!
//! Exactly one terminal [`ExecutionResult`] is delivered per registered
//! request; duplicates for an already-resolved id find no pending entry and
//! are dropped like any other stray message.

use crate::audit::{AuditAction, AuditLog};
use crate::error::BrokerError;
use crate::monitor::ResourceMonitor;
use crate::state::{validate_transition, ExecutionState};
use cellbox_types::{
    CellId, ContextId, Envelope, ExecutionFailure, ExecutionOutput, ExecutionResult, FailureKind,
    LogEntry, MessageType, RequestId,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A raw message entering the broker: sender identity plus undecoded JSON.
pub type InboundMessage = (ContextId, serde_json::Value);

/// Executor-side handle to one registered request.
#[derive(Debug)]
pub struct CorrelationTicket {
    /// The registered request.
    pub request_id: RequestId,
    /// Fires when the context acks the liveness handshake.
    pub ready_rx: oneshot::Receiver<()>,
    /// Delivers the single terminal result.
    pub result_rx: oneshot::Receiver<ExecutionResult>,
}

#[derive(Debug)]
struct PendingEntry {
    cell_id: CellId,
    /// `None` until a queue-fed worker picks the request up and binds
    /// itself via the handshake.
    context_id: Option<ContextId>,
    state: ExecutionState,
    logs: Vec<LogEntry>,
    /// Set at dispatch; elapsed time is measured from here.
    started: Option<Instant>,
    ready_tx: Option<oneshot::Sender<()>>,
    result_tx: Option<oneshot::Sender<ExecutionResult>>,
}

enum Verdict {
    /// Handled in place (log appended, handshake fired).
    Handled,
    /// Message dropped; audit with this reason.
    Drop(String),
    /// Deliver success built from the envelope payload.
    Complete,
    /// Deliver a failure of this kind.
    Fail(FailureKind, String),
}

/// Correlates asynchronous context messages back to their requests.
pub struct MessageBroker {
    pending: DashMap<RequestId, PendingEntry>,
    monitor: Arc<ResourceMonitor>,
    audit: Arc<AuditLog>,
    inbox_tx: mpsc::Sender<InboundMessage>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl MessageBroker {
    /// Create the broker and spawn its dispatch task.
    #[must_use]
    pub fn spawn(monitor: Arc<ResourceMonitor>, audit: Arc<AuditLog>) -> Arc<Self> {
        let (inbox_tx, mut inbox_rx) = mpsc::channel::<InboundMessage>(256);
        let broker = Arc::new(Self {
            pending: DashMap::new(),
            monitor,
            audit,
            inbox_tx,
            dispatcher: Mutex::new(None),
        });

        let worker = Arc::clone(&broker);
        let handle = tokio::spawn(async move {
            while let Some((origin, raw)) = inbox_rx.recv().await {
                worker.on_message(origin, raw);
            }
        });
        *broker.dispatcher.lock() = Some(handle);
        broker
    }

    /// Sender handed to contexts; everything they emit funnels through here.
    #[must_use]
    pub fn inbox(&self) -> mpsc::Sender<InboundMessage> {
        self.inbox_tx.clone()
    }

    /// Register a request before any message can arrive for it.
    ///
    /// `context_id` is the context the request is dispatched to, or `None`
    /// for queue-fed executions where the worker binds at handshake time.
    pub fn register(
        &self,
        request_id: RequestId,
        cell_id: CellId,
        context_id: Option<ContextId>,
    ) -> Result<CorrelationTicket, BrokerError> {
        if self.pending.contains_key(&request_id) {
            return Err(BrokerError::DuplicateRegistration(request_id));
        }
        let (ready_tx, ready_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        self.pending.insert(
            request_id,
            PendingEntry {
                cell_id,
                context_id,
                state: ExecutionState::Created,
                logs: Vec::new(),
                started: None,
                ready_tx: Some(ready_tx),
                result_tx: Some(result_tx),
            },
        );
        Ok(CorrelationTicket {
            request_id,
            ready_rx,
            result_rx,
        })
    }

    /// Drop a registration that never got off the ground.
    pub fn abandon(&self, request_id: &RequestId) {
        self.pending.remove(request_id);
    }

    /// The context bound to a request, once known.
    #[must_use]
    pub fn bound_context(&self, request_id: &RequestId) -> Option<ContextId> {
        self.pending.get(request_id).and_then(|e| e.context_id)
    }

    /// Number of unresolved requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Transition a request to `Running` at payload dispatch.
    ///
    /// Must be called before the execute envelope is sent, so a fast reply
    /// can never race the transition.
    pub fn mark_running(&self, request_id: &RequestId) -> Result<(), BrokerError> {
        let mut entry = self
            .pending
            .get_mut(request_id)
            .ok_or(BrokerError::UnknownRequest(*request_id))?;
        if validate_transition(entry.state, ExecutionState::Running).is_ok() {
            entry.state = ExecutionState::Running;
            entry.started = Some(Instant::now());
        }
        Ok(())
    }

    /// Resolve a request as timed out (boot or execution budget).
    pub fn expire(&self, request_id: &RequestId, message: impl Into<String>) {
        if let Some((_, mut entry)) = self.pending.remove(request_id) {
            let message = message.into();
            tracing::warn!(cell = %entry.cell_id, request = %request_id, "{message}");
            self.audit.record(
                &entry.cell_id,
                AuditAction::LimitViolation {
                    cause: FailureKind::TimedOut.as_str().to_string(),
                },
            );
            let failure = ExecutionFailure::new(FailureKind::TimedOut, message)
                .with_logs(std::mem::take(&mut entry.logs));
            if let Some(tx) = entry.result_tx.take() {
                let _ = tx.send(Err(failure));
            }
        }
    }

    /// Resolve a request with a host-side failure (channel loss, dispatch
    /// breakdown).
    pub fn fail(&self, request_id: &RequestId, kind: FailureKind, message: impl Into<String>) {
        if let Some((_, mut entry)) = self.pending.remove(request_id) {
            let failure = ExecutionFailure::new(kind, message)
                .with_logs(std::mem::take(&mut entry.logs));
            if let Some(tx) = entry.result_tx.take() {
                let _ = tx.send(Err(failure));
            }
        }
    }

    fn on_message(&self, origin: ContextId, raw: serde_json::Value) {
        let envelope = match Envelope::from_value(raw) {
            Ok(env) => env,
            Err(err) => {
                tracing::warn!(context = %origin, %err, "dropping malformed message");
                self.audit.record_unattributed(AuditAction::MessageDropped {
                    reason: format!("malformed message from context {origin}: {err}"),
                });
                return;
            }
        };
        self.on_envelope(origin, envelope);
    }

    fn on_envelope(&self, origin: ContextId, envelope: Envelope) {
        let request_id = envelope.request_id;

        // Phase 1: examine and mutate the pending entry in place.
        let (verdict, cell_id) = match self.pending.get_mut(&request_id) {
            None => {
                self.drop_message(
                    None,
                    format!(
                        "{} for unknown or already-resolved request {request_id}",
                        envelope.kind
                    ),
                );
                return;
            }
            Some(mut entry) => {
                let cell_id = entry.cell_id.clone();
                let verdict = self.judge(&mut entry, origin, &envelope);
                (verdict, cell_id)
            }
        };

        // Phase 2: act on the verdict with the map reference released.
        match verdict {
            Verdict::Handled => {}
            Verdict::Drop(reason) => self.drop_message(Some(&cell_id), reason),
            Verdict::Complete => {
                if let Some((_, mut entry)) = self.pending.remove(&request_id) {
                    let output = ExecutionOutput {
                        output: envelope.payload,
                        logs: std::mem::take(&mut entry.logs),
                        elapsed_ms: entry
                            .started
                            .map(|s| s.elapsed().as_millis() as u64)
                            .unwrap_or(0),
                    };
                    tracing::debug!(cell = %cell_id, request = %request_id, "request completed");
                    if let Some(tx) = entry.result_tx.take() {
                        let _ = tx.send(Ok(output));
                    }
                }
            }
            Verdict::Fail(kind, message) => {
                if let Some((_, mut entry)) = self.pending.remove(&request_id) {
                    let failure = ExecutionFailure::new(kind, message)
                        .with_logs(std::mem::take(&mut entry.logs));
                    tracing::debug!(cell = %cell_id, request = %request_id, %kind, "request failed");
                    if let Some(tx) = entry.result_tx.take() {
                        let _ = tx.send(Err(failure));
                    }
                }
            }
        }
    }

    /// Decide what an inbound envelope means for its pending entry.
    fn judge(&self, entry: &mut PendingEntry, origin: ContextId, envelope: &Envelope) -> Verdict {
        // Sender identity: the message must come from the exact context the
        // request was dispatched to.
        match entry.context_id {
            Some(expected) if expected != origin => {
                return Verdict::Drop(format!(
                    "context identity mismatch (expected {expected}, got {origin})"
                ));
            }
            None => {
                if envelope.kind == MessageType::Ready {
                    entry.context_id = Some(origin);
                } else {
                    return Verdict::Drop(format!(
                        "{} before handshake from context {origin}",
                        envelope.kind
                    ));
                }
            }
            Some(_) => {}
        }

        // Every inbound message counts against the rate limit.
        if let Err(breach) = self.monitor.record_message(&entry.cell_id) {
            entry.state = ExecutionState::Failed;
            return Verdict::Fail(breach.kind(), breach.to_string());
        }

        match envelope.kind {
            MessageType::Ready => {
                if validate_transition(entry.state, ExecutionState::Ready).is_ok() {
                    entry.state = ExecutionState::Ready;
                    if let Some(tx) = entry.ready_tx.take() {
                        let _ = tx.send(());
                    }
                    Verdict::Handled
                } else {
                    Verdict::Drop(format!("duplicate ready in state {:?}", entry.state))
                }
            }
            MessageType::Log => {
                if let Err(breach) = self
                    .monitor
                    .record_output(&entry.cell_id, envelope.payload_size())
                {
                    entry.state = ExecutionState::Failed;
                    return Verdict::Fail(breach.kind(), breach.to_string());
                }
                match serde_json::from_value::<LogEntry>(envelope.payload.clone()) {
                    Ok(log) => {
                        entry.logs.push(log);
                        Verdict::Handled
                    }
                    Err(err) => Verdict::Drop(format!("malformed log payload: {err}")),
                }
            }
            MessageType::Result => {
                if let Err(breach) = self
                    .monitor
                    .record_output(&entry.cell_id, envelope.payload_size())
                {
                    entry.state = ExecutionState::Failed;
                    return Verdict::Fail(breach.kind(), breach.to_string());
                }
                if validate_transition(entry.state, ExecutionState::Completed).is_ok() {
                    entry.state = ExecutionState::Completed;
                    Verdict::Complete
                } else {
                    Verdict::Drop(format!("result in state {:?}", entry.state))
                }
            }
            MessageType::Error => {
                if validate_transition(entry.state, ExecutionState::Failed).is_ok() {
                    entry.state = ExecutionState::Failed;
                    let message = envelope
                        .payload
                        .as_str()
                        .unwrap_or("cell reported an error")
                        .to_string();
                    Verdict::Fail(FailureKind::ExecutionFault, message)
                } else {
                    Verdict::Drop(format!("error in state {:?}", entry.state))
                }
            }
            MessageType::Execute => {
                Verdict::Drop("host-bound message type from a context".to_string())
            }
        }
    }

    fn drop_message(&self, cell_id: Option<&CellId>, reason: String) {
        tracing::warn!(%reason, "message dropped");
        match cell_id {
            Some(cell) => {
                self.audit
                    .record(cell, AuditAction::MessageDropped { reason });
            }
            None => {
                self.audit
                    .record_unattributed(AuditAction::MessageDropped { reason });
            }
        }
    }

    /// Stop the dispatch task. Pending requests resolve through their
    /// executors' timeout paths.
    pub fn shutdown(&self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }
}
