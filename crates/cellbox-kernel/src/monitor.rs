//! Per-cell resource accounting and limit enforcement.
//!
//! The monitor tracks message volume and output size for every in-flight
//! request and answers limit questions on every inbound message, not just at
//! the end. Counters are mutated only from the broker's correlation path
//! (and the in-process executor for its serialized output), keeping limit
//! enforcement race-free.

use crate::audit::{AuditAction, AuditLog};
use cellbox_types::{CellId, FailureKind, SandboxLimits};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A limit was breached.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitBreach {
    /// Message rate over the rolling one-minute window.
    #[error("message rate exceeded: {count} messages within the current minute (cap {cap})")]
    RateLimitExceeded {
        /// Messages observed in the current window, including this one.
        count: u32,
        /// Configured cap.
        cap: u32,
    },

    /// Total serialized output over the per-execution cap.
    #[error("output cap exceeded: {total} bytes (cap {cap}); output truncated")]
    OutputLimitExceeded {
        /// Bytes accumulated, including the offending chunk.
        total: usize,
        /// Configured cap.
        cap: usize,
    },
}

impl LimitBreach {
    /// The failure classification this breach maps to.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            LimitBreach::RateLimitExceeded { .. } => FailureKind::RateLimitExceeded,
            LimitBreach::OutputLimitExceeded { .. } => FailureKind::OutputLimitExceeded,
        }
    }
}

#[derive(Debug)]
struct UsageRecord {
    message_count: u32,
    output_bytes: usize,
    started_at: Instant,
    window_started: Instant,
    window_count: u32,
}

impl UsageRecord {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            message_count: 0,
            output_bytes: 0,
            started_at: now,
            window_started: now,
            window_count: 0,
        }
    }
}

/// Point-in-time usage numbers for one in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSnapshot {
    /// Messages observed so far.
    pub message_count: u32,
    /// Serialized output bytes accumulated so far.
    pub output_bytes: usize,
}

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Tracks execution-time resource usage per cell and enforces limits.
#[derive(Debug)]
pub struct ResourceMonitor {
    limits: SandboxLimits,
    usage: DashMap<CellId, UsageRecord>,
    audit: Arc<AuditLog>,
}

impl ResourceMonitor {
    /// Monitor with the given limits, violations recorded to `audit`.
    #[must_use]
    pub fn new(limits: SandboxLimits, audit: Arc<AuditLog>) -> Self {
        Self {
            limits,
            usage: DashMap::new(),
            audit,
        }
    }

    /// The configured limits.
    #[inline]
    #[must_use]
    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Open a usage record for a request about to start.
    ///
    /// Replaces any stale record; the router guarantees one in-flight
    /// request per cell.
    pub fn begin(&self, cell_id: &CellId) {
        self.usage.insert(cell_id.clone(), UsageRecord::new());
    }

    /// Drop the usage record when a request resolves.
    pub fn finish(&self, cell_id: &CellId) {
        self.usage.remove(cell_id);
    }

    /// Count one inbound message against the rate limit.
    pub fn record_message(&self, cell_id: &CellId) -> Result<(), LimitBreach> {
        let cap = self.limits.max_messages_per_minute;
        let breach = {
            let mut record = match self.usage.get_mut(cell_id) {
                Some(r) => r,
                // No open record: request already resolved; nothing to count.
                None => return Ok(()),
            };
            if record.window_started.elapsed() >= RATE_WINDOW {
                record.window_started = Instant::now();
                record.window_count = 0;
            }
            record.window_count += 1;
            record.message_count += 1;
            if record.window_count > cap {
                Some(LimitBreach::RateLimitExceeded {
                    count: record.window_count,
                    cap,
                })
            } else {
                None
            }
        };

        match breach {
            Some(b) => {
                self.audit_breach(cell_id, &b);
                Err(b)
            }
            None => Ok(()),
        }
    }

    /// Count serialized output bytes against the per-execution cap.
    pub fn record_output(&self, cell_id: &CellId, bytes: usize) -> Result<(), LimitBreach> {
        let cap = self.limits.max_output_bytes;
        let breach = {
            let mut record = match self.usage.get_mut(cell_id) {
                Some(r) => r,
                None => return Ok(()),
            };
            record.output_bytes += bytes;
            if record.output_bytes > cap {
                Some(LimitBreach::OutputLimitExceeded {
                    total: record.output_bytes,
                    cap,
                })
            } else {
                None
            }
        };

        match breach {
            Some(b) => {
                self.audit_breach(cell_id, &b);
                Err(b)
            }
            None => Ok(()),
        }
    }

    /// Milliseconds since the request's record was opened.
    #[must_use]
    pub fn elapsed_ms(&self, cell_id: &CellId) -> u64 {
        self.usage
            .get(cell_id)
            .map(|r| r.started_at.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    /// Current usage numbers, if a record is open.
    #[must_use]
    pub fn snapshot(&self, cell_id: &CellId) -> Option<UsageSnapshot> {
        self.usage.get(cell_id).map(|r| UsageSnapshot {
            message_count: r.message_count,
            output_bytes: r.output_bytes,
        })
    }

    fn audit_breach(&self, cell_id: &CellId, breach: &LimitBreach) {
        tracing::warn!(cell = %cell_id, %breach, "resource limit breached");
        self.audit.record(
            cell_id,
            AuditAction::LimitViolation {
                cause: breach.kind().as_str().to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(limits: SandboxLimits) -> ResourceMonitor {
        ResourceMonitor::new(limits, Arc::new(AuditLog::new()))
    }

    #[test]
    fn messages_below_the_cap_pass() {
        let m = monitor(SandboxLimits::default());
        let cell = CellId::from("c1");
        m.begin(&cell);
        for _ in 0..100 {
            assert!(m.record_message(&cell).is_ok());
        }
    }

    #[test]
    fn the_101st_message_in_a_minute_breaches() {
        let m = monitor(SandboxLimits::default());
        let cell = CellId::from("c2");
        m.begin(&cell);
        for _ in 0..100 {
            m.record_message(&cell).unwrap();
        }
        let breach = m.record_message(&cell).unwrap_err();
        assert_eq!(breach.kind(), cellbox_types::FailureKind::RateLimitExceeded);
        // Breach recorded in the audit stream regardless of what the caller does.
        assert_eq!(m.audit.events_for(&cell).len(), 1);
    }

    #[test]
    fn one_byte_over_the_output_cap_breaches() {
        let m = monitor(SandboxLimits::default());
        let cell = CellId::from("c3");
        m.begin(&cell);
        assert!(m.record_output(&cell, 1024 * 1024).is_ok());
        let breach = m.record_output(&cell, 1).unwrap_err();
        assert_eq!(
            breach.kind(),
            cellbox_types::FailureKind::OutputLimitExceeded
        );
    }

    #[test]
    fn finished_requests_stop_counting() {
        let m = monitor(SandboxLimits::default());
        let cell = CellId::from("c4");
        m.begin(&cell);
        m.finish(&cell);
        assert!(m.record_message(&cell).is_ok());
        assert!(m.snapshot(&cell).is_none());
    }

    #[test]
    fn begin_resets_prior_usage() {
        let m = monitor(SandboxLimits::default().with_max_output_bytes(10));
        let cell = CellId::from("c5");
        m.begin(&cell);
        assert!(m.record_output(&cell, 8).is_ok());
        m.begin(&cell);
        assert!(m.record_output(&cell, 8).is_ok());
    }
}
