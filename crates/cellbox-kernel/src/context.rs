//! Isolated execution contexts.
//!
//! A context is a spawned task owning nothing but channel endpoints: an
//! inbox of raw JSON messages from the host and an outbox into the broker.
//! It has no ambient access to host state; host operations travel through
//! the mediated [`HostCall`](crate::facade::HostCall) channel.
//!
//! Contexts are pooled for reuse after clean completions. A context retains
//! no per-request state between executions (the program, IO channels and
//! buffers are created per `execute` message and dropped with it), so
//! "reset" is structural rather than a cleanup pass. Failed or timed-out
//! contexts are destroyed by their executor, never pooled.

use crate::error::ContextError;
use crate::facade::{HostCall, HostPort};
use crate::program::{ExecutePayload, ProgramIo, ProgramResolver};
use cellbox_types::{ContextId, Envelope, LogEntry, MessageType, RequestId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A message leaving a context: its identity tag plus the raw envelope.
pub type OutboundMessage = (ContextId, serde_json::Value);

/// Everything needed to spawn a fresh context.
#[derive(Clone)]
pub(crate) struct ContextSeed {
    pub resolver: Arc<dyn ProgramResolver>,
    pub host_calls: mpsc::Sender<HostCall>,
    pub outbox: mpsc::Sender<OutboundMessage>,
}

/// Host-side handle to one context.
#[derive(Debug)]
pub struct ContextHandle {
    id: ContextId,
    inbox: mpsc::Sender<serde_json::Value>,
    task: JoinHandle<()>,
}

impl ContextHandle {
    /// The context's identity.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Send one envelope across the serialization boundary.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), ContextError> {
        let raw = serde_json::to_value(envelope).unwrap_or(serde_json::Value::Null);
        self.inbox
            .send(raw)
            .await
            .map_err(|_| ContextError::ChannelClosed)
    }

    fn destroy(self) {
        self.task.abort();
    }
}

fn spawn_context(seed: &ContextSeed) -> ContextHandle {
    let id = ContextId::new();
    let (inbox_tx, mut inbox_rx) = mpsc::channel::<serde_json::Value>(16);
    let resolver = Arc::clone(&seed.resolver);
    let host_calls = seed.host_calls.clone();
    let outbox = seed.outbox.clone();

    let task = tokio::spawn(async move {
        while let Some(raw) = inbox_rx.recv().await {
            let Ok(envelope) = Envelope::from_value(raw) else {
                continue;
            };
            match envelope.kind {
                MessageType::Ready => {
                    // Liveness probe; answer with the ack.
                    let ack = Envelope::ready(envelope.request_id);
                    let raw = serde_json::to_value(&ack).unwrap_or(serde_json::Value::Null);
                    if outbox.send((id, raw)).await.is_err() {
                        break;
                    }
                }
                MessageType::Execute => {
                    run_payload(
                        id,
                        envelope.request_id,
                        envelope.payload,
                        &resolver,
                        &host_calls,
                        &outbox,
                        true,
                    )
                    .await;
                }
                // The host never sends anything else.
                _ => {}
            }
        }
    });

    tracing::debug!(context = %id, "isolated context spawned");
    ContextHandle {
        id,
        inbox: inbox_tx,
        task,
    }
}

/// Resolve and run one `execute` payload, emitting `log` messages while the
/// program runs and exactly one terminal `result`/`error` message after it.
///
/// Shared by isolated context tasks and background workers; `allow_render`
/// is false for workers, which carry no rendering surface.
pub(crate) async fn run_payload(
    context_id: ContextId,
    request_id: RequestId,
    raw_payload: serde_json::Value,
    resolver: &Arc<dyn ProgramResolver>,
    host_calls: &mpsc::Sender<HostCall>,
    outbox: &mpsc::Sender<OutboundMessage>,
    allow_render: bool,
) {
    let payload: ExecutePayload = match serde_json::from_value(raw_payload) {
        Ok(p) => p,
        Err(err) => {
            send_envelope(
                outbox,
                context_id,
                &Envelope::error(request_id, format!("malformed execute payload: {err}")),
            )
            .await;
            return;
        }
    };

    let program = match resolver.resolve(&payload.descriptor) {
        Ok(p) => p,
        Err(err) => {
            send_envelope(
                outbox,
                context_id,
                &Envelope::error(request_id, err.to_string()),
            )
            .await;
            return;
        }
    };

    // Logs flow out as individual messages while the program runs; the
    // forwarder is drained before the terminal message so ordering holds.
    let (log_tx, mut log_rx) = mpsc::channel::<LogEntry>(256);
    let forwarder = {
        let outbox = outbox.clone();
        tokio::spawn(async move {
            while let Some(entry) = log_rx.recv().await {
                let env = Envelope::log(request_id, &entry);
                let raw = serde_json::to_value(&env).unwrap_or(serde_json::Value::Null);
                if outbox.send((context_id, raw)).await.is_err() {
                    break;
                }
            }
        })
    };

    let port = HostPort::new(payload.descriptor.id.clone(), host_calls.clone(), allow_render);
    let io = ProgramIo::new(port, log_tx);
    let outcome = program.run(payload.input, &io).await;
    drop(io);
    let _ = forwarder.await;

    let terminal = match outcome {
        Ok(value) => Envelope::result(request_id, value),
        Err(err) => Envelope::error(request_id, err.to_string()),
    };
    send_envelope(outbox, context_id, &terminal).await;
}

async fn send_envelope(
    outbox: &mpsc::Sender<OutboundMessage>,
    context_id: ContextId,
    envelope: &Envelope,
) {
    let raw = serde_json::to_value(envelope).unwrap_or(serde_json::Value::Null);
    let _ = outbox.send((context_id, raw)).await;
}

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Contexts spawned fresh.
    pub spawned: usize,
    /// Acquisitions served from the pool.
    pub reused: usize,
    /// Contexts destroyed instead of pooled.
    pub destroyed: usize,
    /// Idle contexts currently available.
    pub idle: usize,
}

/// Reuse pool for isolated contexts.
///
/// LIFO, bounded; overflow on release destroys the context instead.
pub struct ContextPool {
    max_idle: usize,
    seed: ContextSeed,
    available: Mutex<Vec<ContextHandle>>,
    stats: Mutex<PoolStats>,
}

impl ContextPool {
    pub(crate) fn new(max_idle: usize, seed: ContextSeed) -> Self {
        Self {
            max_idle,
            seed,
            available: Mutex::new(Vec::new()),
            stats: Mutex::new(PoolStats::default()),
        }
    }

    /// Reuse an idle context or spawn a fresh one.
    pub fn acquire(&self) -> ContextHandle {
        if let Some(handle) = self.available.lock().pop() {
            let mut stats = self.stats.lock();
            stats.reused += 1;
            stats.idle -= 1;
            return handle;
        }
        let mut stats = self.stats.lock();
        stats.spawned += 1;
        drop(stats);
        spawn_context(&self.seed)
    }

    /// Return a context after a clean completion.
    pub fn release(&self, handle: ContextHandle) {
        let mut available = self.available.lock();
        if available.len() < self.max_idle {
            available.push(handle);
            self.stats.lock().idle = available.len();
        } else {
            drop(available);
            self.discard(handle);
        }
    }

    /// Destroy a context that must not be reused.
    pub fn discard(&self, handle: ContextHandle) {
        tracing::debug!(context = %handle.id(), "context destroyed");
        handle.destroy();
        self.stats.lock().destroyed += 1;
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        *self.stats.lock()
    }

    /// Destroy every idle context.
    pub fn shutdown(&self) {
        let mut available = self.available.lock();
        let drained: Vec<ContextHandle> = available.drain(..).collect();
        drop(available);
        for handle in drained {
            self.discard(handle);
        }
        self.stats.lock().idle = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProgramError;
    use crate::program::CellProgram;
    use cellbox_types::CellDescriptor;
    use serde_json::json;

    struct Echo;

    #[async_trait::async_trait]
    impl CellProgram for Echo {
        async fn run(
            &self,
            payload: serde_json::Value,
            _io: &ProgramIo,
        ) -> Result<serde_json::Value, ProgramError> {
            Ok(payload)
        }
    }

    struct EchoResolver;

    impl ProgramResolver for EchoResolver {
        fn resolve(
            &self,
            _descriptor: &CellDescriptor,
        ) -> Result<Arc<dyn CellProgram>, ProgramError> {
            Ok(Arc::new(Echo))
        }
    }

    fn seed(outbox: mpsc::Sender<OutboundMessage>) -> ContextSeed {
        let (host_calls, _rx) = mpsc::channel(8);
        ContextSeed {
            resolver: Arc::new(EchoResolver),
            host_calls,
            outbox,
        }
    }

    #[tokio::test]
    async fn context_acks_the_liveness_probe() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let pool = ContextPool::new(2, seed(out_tx));
        let ctx = pool.acquire();

        let request = RequestId::new();
        ctx.send(&Envelope::ready(request)).await.unwrap();

        let (origin, raw) = out_rx.recv().await.unwrap();
        assert_eq!(origin, ctx.id());
        let env = Envelope::from_value(raw).unwrap();
        assert_eq!(env.kind, MessageType::Ready);
        assert_eq!(env.request_id, request);
    }

    #[tokio::test]
    async fn context_executes_and_replies_with_result() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let pool = ContextPool::new(2, seed(out_tx));
        let ctx = pool.acquire();

        let request = RequestId::new();
        let payload = ExecutePayload::new(
            CellDescriptor::user_script("s1", "echo"),
            json!({ "v": 7 }),
        );
        ctx.send(&Envelope::execute(
            request,
            serde_json::to_value(&payload).unwrap(),
        ))
        .await
        .unwrap();

        let (_, raw) = out_rx.recv().await.unwrap();
        let env = Envelope::from_value(raw).unwrap();
        assert_eq!(env.kind, MessageType::Result);
        assert_eq!(env.payload["v"], 7);
    }

    #[tokio::test]
    async fn malformed_execute_payload_yields_error_reply() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let pool = ContextPool::new(2, seed(out_tx));
        let ctx = pool.acquire();

        let request = RequestId::new();
        ctx.send(&Envelope::execute(request, json!("not a payload")))
            .await
            .unwrap();

        let (_, raw) = out_rx.recv().await.unwrap();
        let env = Envelope::from_value(raw).unwrap();
        assert_eq!(env.kind, MessageType::Error);
    }

    #[tokio::test]
    async fn pool_reuses_released_contexts_lifo() {
        let (out_tx, _out_rx) = mpsc::channel(8);
        let pool = ContextPool::new(2, seed(out_tx));

        let ctx = pool.acquire();
        let id = ctx.id();
        pool.release(ctx);

        let again = pool.acquire();
        assert_eq!(again.id(), id);
        assert_eq!(pool.stats().reused, 1);
    }

    #[tokio::test]
    async fn pool_overflow_destroys_instead_of_pooling() {
        let (out_tx, _out_rx) = mpsc::channel(8);
        let pool = ContextPool::new(1, seed(out_tx));

        let a = pool.acquire();
        let b = pool.acquire();
        pool.release(a);
        pool.release(b);

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.destroyed, 1);
    }
}
