//! Execution results and the failure taxonomy.
//!
//! Every failure, whatever its origin, surfaces through the same
//! [`ExecutionFailure`] channel with a [`FailureKind`] and a human-readable
//! message. The caller decides whether to present an error UI, retry, or
//! discard the cell; nothing here retries automatically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of one log line captured during execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Diagnostic chatter.
    Debug,
    /// Normal progress.
    Info,
    /// Something suspicious but non-fatal.
    Warn,
    /// Cell-reported error.
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// One log line emitted by cell code, in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Severity.
    pub level: LogLevel,
    /// The message text.
    pub message: String,
    /// When the host observed the line.
    pub at: DateTime<Utc>,
}

impl LogEntry {
    /// Create an entry stamped now.
    #[must_use]
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Classification of an execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// A capability check failed.
    PermissionDenied,
    /// No grant record exists for the cell.
    PermissionConfigMissing,
    /// A request was already outstanding for the cell.
    AlreadyExecuting,
    /// No terminal reply arrived within the execution budget.
    TimedOut,
    /// The cell exceeded the message-rate limit.
    RateLimitExceeded,
    /// The cell exceeded the serialized-output cap.
    OutputLimitExceeded,
    /// The background queue was full.
    Overloaded,
    /// A context broke the wire protocol.
    MalformedMessage,
    /// The cell's own code raised an error.
    ExecutionFault,
}

impl FailureKind {
    /// Stable string form, used in audit records and wire payloads.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::PermissionDenied => "permission-denied",
            FailureKind::PermissionConfigMissing => "permission-config-missing",
            FailureKind::AlreadyExecuting => "already-executing",
            FailureKind::TimedOut => "timed-out",
            FailureKind::RateLimitExceeded => "rate-limit-exceeded",
            FailureKind::OutputLimitExceeded => "output-limit-exceeded",
            FailureKind::Overloaded => "overloaded",
            FailureKind::MalformedMessage => "malformed-message",
            FailureKind::ExecutionFault => "execution-fault",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Successful outcome of one execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// The serializable value the cell produced.
    pub output: serde_json::Value,
    /// Log lines in emission order.
    pub logs: Vec<LogEntry>,
    /// Wall-clock time from dispatch to terminal reply.
    pub elapsed_ms: u64,
}

/// Failed outcome of one execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ExecutionFailure {
    /// Failure classification.
    pub kind: FailureKind,
    /// Human-readable description.
    pub message: String,
    /// Log lines captured before the failure.
    pub logs: Vec<LogEntry>,
}

impl ExecutionFailure {
    /// Create a failure with no captured logs.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            logs: Vec::new(),
        }
    }

    /// Attach the logs captured before the failure.
    #[must_use]
    pub fn with_logs(mut self, logs: Vec<LogEntry>) -> Self {
        self.logs = logs;
        self
    }
}

/// Terminal outcome of one execution request; produced exactly once.
pub type ExecutionResult = Result<ExecutionOutput, ExecutionFailure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_display_includes_kind_and_message() {
        let f = ExecutionFailure::new(FailureKind::TimedOut, "no reply within 30000ms");
        assert_eq!(f.to_string(), "timed-out: no reply within 30000ms");
    }

    #[test]
    fn failure_kind_serde_is_kebab_case() {
        let json = serde_json::to_string(&FailureKind::RateLimitExceeded).unwrap();
        assert_eq!(json, "\"rate-limit-exceeded\"");
    }

    #[test]
    fn logs_preserve_emission_order() {
        let logs = vec![
            LogEntry::new(LogLevel::Info, "first"),
            LogEntry::new(LogLevel::Warn, "second"),
        ];
        let f = ExecutionFailure::new(FailureKind::ExecutionFault, "boom").with_logs(logs);
        assert_eq!(f.logs[0].message, "first");
        assert_eq!(f.logs[1].message, "second");
    }
}
