//! Execution limit configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-sandbox execution limits.
///
/// Defaults match the recommended values: 30s execution budget, 1 MiB output
/// cap, 100 messages per minute per cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SandboxLimits {
    /// Budget from the `Ready` transition to a terminal reply.
    pub execution_timeout_ms: u64,
    /// Separate outer bound on context startup (allocation to `Ready`).
    pub boot_timeout_ms: u64,
    /// Cap on total serialized output per execution.
    pub max_output_bytes: usize,
    /// Inbound message-rate cap, evaluated on every message.
    pub max_messages_per_minute: u32,
    /// Background queue depth beyond which requests fail fast.
    pub max_queue_depth: usize,
    /// Fixed size of the background compute pool.
    pub background_workers: usize,
    /// Maximum idle isolated contexts retained for reuse.
    pub context_pool_size: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            execution_timeout_ms: 30_000,
            boot_timeout_ms: 5_000,
            max_output_bytes: 1024 * 1024,
            max_messages_per_minute: 100,
            max_queue_depth: 64,
            background_workers: 4,
            context_pool_size: 8,
        }
    }
}

impl SandboxLimits {
    /// Default limits.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With execution timeout.
    #[inline]
    #[must_use]
    pub fn with_execution_timeout_ms(mut self, ms: u64) -> Self {
        self.execution_timeout_ms = ms;
        self
    }

    /// With boot timeout.
    #[inline]
    #[must_use]
    pub fn with_boot_timeout_ms(mut self, ms: u64) -> Self {
        self.boot_timeout_ms = ms;
        self
    }

    /// With output cap.
    #[inline]
    #[must_use]
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// With message-rate cap.
    #[inline]
    #[must_use]
    pub fn with_max_messages_per_minute(mut self, count: u32) -> Self {
        self.max_messages_per_minute = count;
        self
    }

    /// With background queue depth.
    #[inline]
    #[must_use]
    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// With background pool size.
    #[inline]
    #[must_use]
    pub fn with_background_workers(mut self, workers: usize) -> Self {
        self.background_workers = workers;
        self
    }

    /// With context pool size.
    #[inline]
    #[must_use]
    pub fn with_context_pool_size(mut self, size: usize) -> Self {
        self.context_pool_size = size;
        self
    }

    /// Execution budget as a [`Duration`].
    #[inline]
    #[must_use]
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    /// Boot budget as a [`Duration`].
    #[inline]
    #[must_use]
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_recommended_values() {
        let limits = SandboxLimits::default();
        assert_eq!(limits.execution_timeout_ms, 30_000);
        assert_eq!(limits.max_output_bytes, 1024 * 1024);
        assert_eq!(limits.max_messages_per_minute, 100);
    }

    #[test]
    fn builder_overrides_single_fields() {
        let limits = SandboxLimits::new()
            .with_execution_timeout_ms(100)
            .with_max_queue_depth(2);
        assert_eq!(limits.execution_timeout_ms, 100);
        assert_eq!(limits.max_queue_depth, 2);
        assert_eq!(limits.max_messages_per_minute, 100);
    }

    #[test]
    fn partial_config_deserializes_over_defaults() {
        let limits: SandboxLimits =
            serde_json::from_str(r#"{ "executionTimeoutMs": 1000 }"#).unwrap();
        assert_eq!(limits.execution_timeout_ms, 1000);
        assert_eq!(limits.max_output_bytes, 1024 * 1024);
    }
}
