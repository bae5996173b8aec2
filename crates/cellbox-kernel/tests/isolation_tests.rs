//! End-to-end isolation behavior: executor + broker + real contexts.

use cellbox_kernel::prelude::*;
use cellbox_kernel::AuditLog;
use cellbox_test_utils::{script, ScriptedResolver};
use cellbox_types::{
    CellDescriptor, ExecutionRequest, FailureKind, SandboxLimits,
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

fn harness(
    limits: SandboxLimits,
) -> (IsolatedExecutor, Arc<ResourceMonitor>, Arc<AuditLog>) {
    let audit = Arc::new(AuditLog::new());
    let monitor = Arc::new(ResourceMonitor::new(limits.clone(), Arc::clone(&audit)));
    let broker = MessageBroker::spawn(Arc::clone(&monitor), Arc::clone(&audit));
    let (host_calls, _rx) = mpsc::channel(8);
    let executor = IsolatedExecutor::new(
        limits,
        broker,
        Arc::clone(&audit),
        Arc::new(ScriptedResolver),
        host_calls,
    );
    (executor, monitor, audit)
}

async fn run(
    executor: &IsolatedExecutor,
    monitor: &ResourceMonitor,
    descriptor: &CellDescriptor,
    payload: serde_json::Value,
) -> cellbox_types::ExecutionResult {
    let request = ExecutionRequest::new(descriptor.id.clone(), payload);
    monitor.begin(&request.cell_id);
    let result = executor.execute(&request, descriptor).await;
    monitor.finish(&request.cell_id);
    result
}

#[tokio::test]
async fn logs_arrive_in_emission_order() {
    let (executor, monitor, _) = harness(SandboxLimits::default());
    let descriptor = script("s1", "chatty:3", &[]);

    let output = run(&executor, &monitor, &descriptor, json!(null))
        .await
        .unwrap();
    assert_eq!(output.output, json!({ "emitted": 3 }));
    let lines: Vec<&str> = output.logs.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(lines, vec!["line 0", "line 1", "line 2"]);
}

#[tokio::test]
async fn message_flood_tears_the_context_down() {
    let limits = SandboxLimits::default().with_max_messages_per_minute(10);
    let (executor, monitor, audit) = harness(limits);
    let descriptor = script("s1", "chatty:50", &[]);

    let failure = run(&executor, &monitor, &descriptor, json!(null))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::RateLimitExceeded);

    let stats = executor.pool_stats();
    assert_eq!(stats.destroyed, 1);
    assert_eq!(stats.idle, 0);

    // The violation is in the audit stream independent of the teardown.
    assert!(audit
        .events_for(&descriptor.id)
        .iter()
        .any(|e| matches!(&e.action, AuditAction::LimitViolation { cause }
            if cause == "rate-limit-exceeded")));
}

#[tokio::test]
async fn oversized_output_is_flagged_not_silently_dropped() {
    let limits = SandboxLimits::default().with_max_output_bytes(1024);
    let (executor, monitor, _) = harness(limits);
    let descriptor = script("s1", "blob:2048", &[]);

    let failure = run(&executor, &monitor, &descriptor, json!(null))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::OutputLimitExceeded);
}

#[tokio::test]
async fn faulting_cells_report_execution_fault_and_lose_their_context() {
    let (executor, monitor, _) = harness(SandboxLimits::default());
    let descriptor = script("s1", "fault:division by zero", &[]);

    let failure = run(&executor, &monitor, &descriptor, json!(null))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::ExecutionFault);
    assert_eq!(failure.message, "division by zero");

    let stats = executor.pool_stats();
    assert_eq!(stats.destroyed, 1);
    assert_eq!(stats.idle, 0);
}

#[tokio::test]
async fn successive_executions_reuse_one_context() {
    let (executor, monitor, _) = harness(SandboxLimits::default());

    for i in 0..3 {
        let descriptor = script("s1", "echo", &[]);
        let output = run(&executor, &monitor, &descriptor, json!(i))
            .await
            .unwrap();
        assert_eq!(output.output, json!(i));
    }

    let stats = executor.pool_stats();
    assert_eq!(stats.spawned, 1);
    assert_eq!(stats.reused, 2);
}
