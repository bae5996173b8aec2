//! Cell program seams.
//!
//! The sandbox does not interpret scripts or the dashboard DSL itself; those
//! engines are external collaborators. They plug in through
//! [`ProgramResolver`], which turns a descriptor into a runnable
//! [`CellProgram`]. Programs see nothing of the host except their
//! [`ProgramIo`].

use crate::error::{FacadeError, ProgramError};
use crate::facade::{HostOp, HostPort};
use cellbox_types::{CellDescriptor, LogEntry, LogLevel};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A runnable unit of cell logic.
#[async_trait::async_trait]
pub trait CellProgram: Send + Sync {
    /// Run with the invocation payload, returning the serializable output.
    async fn run(
        &self,
        payload: serde_json::Value,
        io: &ProgramIo,
    ) -> Result<serde_json::Value, ProgramError>;
}

/// Turns descriptors into programs. The seam where script and DSL engines
/// attach.
pub trait ProgramResolver: Send + Sync {
    /// Instantiate the program for a script or DSL descriptor.
    fn resolve(&self, descriptor: &CellDescriptor) -> Result<Arc<dyn CellProgram>, ProgramError>;
}

/// What a running program can reach: scoped logging and mediated host access.
pub struct ProgramIo {
    host: HostPort,
    logs: mpsc::Sender<LogEntry>,
}

impl ProgramIo {
    pub(crate) fn new(host: HostPort, logs: mpsc::Sender<LogEntry>) -> Self {
        Self { host, logs }
    }

    /// Emit one log line.
    ///
    /// Lines flow to the host as `log` messages and count against the
    /// message-rate limit; past the limit the execution is torn down anyway,
    /// so overflow here is silently dropped.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let _ = self.logs.try_send(LogEntry::new(level, message));
    }

    /// Request one host operation through the capability-checked mediator.
    pub async fn host(&self, op: HostOp) -> Result<serde_json::Value, FacadeError> {
        self.host.call(op).await
    }
}

/// Log collection for the in-process path, where there is no message
/// boundary to carry `log` envelopes.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    inner: Arc<Mutex<Vec<LogEntry>>>,
}

impl LogSink {
    /// Empty sink.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one line.
    pub fn push(&self, level: LogLevel, message: impl Into<String>) {
        self.inner.lock().push(LogEntry::new(level, message));
    }

    /// Take everything collected so far, in emission order.
    #[must_use]
    pub fn drain(&self) -> Vec<LogEntry> {
        std::mem::take(&mut *self.inner.lock())
    }
}

/// The `execute` envelope payload: everything a context needs to run one
/// cell, shipped across the isolation boundary as plain JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutePayload {
    /// The cell being executed.
    pub descriptor: CellDescriptor,
    /// Invocation input.
    pub input: serde_json::Value,
}

impl ExecutePayload {
    /// Bundle a descriptor and input for dispatch.
    #[must_use]
    pub fn new(descriptor: CellDescriptor, input: serde_json::Value) -> Self {
        Self { descriptor, input }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn log_sink_drains_in_order() {
        let sink = LogSink::new();
        sink.push(LogLevel::Info, "a");
        sink.push(LogLevel::Warn, "b");
        let logs = sink.drain();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "a");
        assert!(sink.drain().is_empty());
    }

    #[test]
    fn execute_payload_round_trips() {
        let payload = ExecutePayload::new(
            CellDescriptor::user_script("s1", "1 + 1"),
            json!({ "n": 3 }),
        );
        let value = serde_json::to_value(&payload).unwrap();
        let back: ExecutePayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }
}
