//! Testing utilities for the cellbox workspace.
//!
//! Shared fixtures: scripted cell programs, a code-string resolver, a
//! recording host-services stub, and sandbox builders.

#![allow(missing_docs)]

use cellbox_core::{CellSandbox, SandboxConfig};
use cellbox_kernel::{
    CellProgram, HostError, HostOp, HostServices, ProgramError, ProgramIo, ProgramResolver,
};
use cellbox_types::{Capability, CellDescriptor, CellId, LogLevel, SandboxLimits};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Returns the invocation payload unchanged.
pub struct EchoProgram;

#[async_trait::async_trait]
impl CellProgram for EchoProgram {
    async fn run(
        &self,
        payload: serde_json::Value,
        io: &ProgramIo,
    ) -> Result<serde_json::Value, ProgramError> {
        io.log(LogLevel::Info, "echo");
        Ok(payload)
    }
}

/// Never replies; used to exercise timeout paths.
pub struct StallProgram;

#[async_trait::async_trait]
impl CellProgram for StallProgram {
    async fn run(
        &self,
        _payload: serde_json::Value,
        _io: &ProgramIo,
    ) -> Result<serde_json::Value, ProgramError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(serde_json::Value::Null)
    }
}

/// Emits `lines` log messages, then completes.
pub struct ChattyProgram {
    pub lines: usize,
}

#[async_trait::async_trait]
impl CellProgram for ChattyProgram {
    async fn run(
        &self,
        _payload: serde_json::Value,
        io: &ProgramIo,
    ) -> Result<serde_json::Value, ProgramError> {
        for i in 0..self.lines {
            io.log(LogLevel::Info, format!("line {i}"));
            // Let the log forwarder keep pace so every line reaches the
            // broker as its own message.
            tokio::task::yield_now().await;
        }
        Ok(json!({ "emitted": self.lines }))
    }
}

/// Returns a string payload of `bytes` bytes.
pub struct BlobProgram {
    pub bytes: usize,
}

#[async_trait::async_trait]
impl CellProgram for BlobProgram {
    async fn run(
        &self,
        _payload: serde_json::Value,
        _io: &ProgramIo,
    ) -> Result<serde_json::Value, ProgramError> {
        Ok(serde_json::Value::String("x".repeat(self.bytes)))
    }
}

/// Fails with the given message.
pub struct FaultingProgram {
    pub message: String,
}

#[async_trait::async_trait]
impl CellProgram for FaultingProgram {
    async fn run(
        &self,
        _payload: serde_json::Value,
        _io: &ProgramIo,
    ) -> Result<serde_json::Value, ProgramError> {
        Err(ProgramError::Faulted(self.message.clone()))
    }
}

/// Attempts a network fetch through the host port, logs a denial, and
/// completes either way. Exercises partial-failure semantics.
pub struct FetchProgram;

#[async_trait::async_trait]
impl CellProgram for FetchProgram {
    async fn run(
        &self,
        _payload: serde_json::Value,
        io: &ProgramIo,
    ) -> Result<serde_json::Value, ProgramError> {
        match io.host(HostOp::Fetch("https://example.test/data".into())).await {
            Ok(body) => Ok(json!({ "fetched": true, "body": body })),
            Err(err) => {
                io.log(LogLevel::Warn, format!("fetch denied: {err}"));
                Ok(json!({ "fetched": false }))
            }
        }
    }
}

/// Resolves programs from code-string conventions:
///
/// - `"echo"` — [`EchoProgram`]
/// - `"stall"` — [`StallProgram`]
/// - `"chatty:<n>"` — [`ChattyProgram`] with `n` lines
/// - `"blob:<bytes>"` — [`BlobProgram`]
/// - `"fault:<message>"` — [`FaultingProgram`]
/// - `"fetch"` — [`FetchProgram`]
pub struct ScriptedResolver;

impl ProgramResolver for ScriptedResolver {
    fn resolve(&self, descriptor: &CellDescriptor) -> Result<Arc<dyn CellProgram>, ProgramError> {
        let code = descriptor
            .code
            .as_deref()
            .ok_or_else(|| ProgramError::Unresolvable(descriptor.id.to_string()))?;

        if code == "echo" {
            return Ok(Arc::new(EchoProgram));
        }
        if code == "stall" {
            return Ok(Arc::new(StallProgram));
        }
        if code == "fetch" {
            return Ok(Arc::new(FetchProgram));
        }
        if let Some(n) = code.strip_prefix("chatty:") {
            let lines = n
                .parse()
                .map_err(|_| ProgramError::Unresolvable(code.to_string()))?;
            return Ok(Arc::new(ChattyProgram { lines }));
        }
        if let Some(n) = code.strip_prefix("blob:") {
            let bytes = n
                .parse()
                .map_err(|_| ProgramError::Unresolvable(code.to_string()))?;
            return Ok(Arc::new(BlobProgram { bytes }));
        }
        if let Some(message) = code.strip_prefix("fault:") {
            return Ok(Arc::new(FaultingProgram {
                message: message.to_string(),
            }));
        }
        Err(ProgramError::Unresolvable(code.to_string()))
    }
}

/// Host services stub that records every authorized call and answers with
/// canned values.
#[derive(Default)]
pub struct RecordingServices {
    calls: Mutex<Vec<(CellId, String)>>,
}

impl RecordingServices {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `(cell, operation)` pairs in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<(CellId, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait::async_trait]
impl HostServices for RecordingServices {
    async fn perform(
        &self,
        cell_id: &CellId,
        op: &HostOp,
    ) -> Result<serde_json::Value, HostError> {
        self.calls
            .lock()
            .push((cell_id.clone(), op.name().to_string()));
        match op {
            HostOp::DataQuery(_) => Ok(json!([1, 2, 3])),
            HostOp::DataWrite(_) => Ok(json!(true)),
            HostOp::StorageGet(key) => Ok(json!({ "key": key })),
            HostOp::StoragePut(_, _) => Ok(json!(true)),
            HostOp::Render(_) => Ok(serde_json::Value::Null),
            HostOp::Fetch(url) => Ok(json!({ "url": url, "status": 200 })),
        }
    }
}

/// A sandbox wired with [`RecordingServices`] and [`ScriptedResolver`].
#[must_use]
pub fn sandbox_with_limits(limits: SandboxLimits) -> (CellSandbox, Arc<RecordingServices>) {
    let services = Arc::new(RecordingServices::new());
    let sandbox = CellSandbox::with_config(
        SandboxConfig::new().with_limits(limits),
        Arc::clone(&services) as Arc<dyn HostServices>,
        Arc::new(ScriptedResolver),
    );
    (sandbox, services)
}

/// A sandbox with default limits.
#[must_use]
pub fn sandbox() -> (CellSandbox, Arc<RecordingServices>) {
    sandbox_with_limits(SandboxLimits::default())
}

/// A user-script descriptor with the given code and capabilities.
#[must_use]
pub fn script(id: &str, code: &str, caps: &[Capability]) -> CellDescriptor {
    CellDescriptor::user_script(id, code).with_capabilities(caps.iter().copied())
}

/// A user-script descriptor carrying the heavy-computation marker.
#[must_use]
pub fn heavy_script(id: &str, code: &str) -> CellDescriptor {
    script(id, code, &[Capability::ComputeHeavy])
}
