//! Routing properties and limit scenarios, end to end through the sandbox.

use cellbox_kernel::AuditAction;
use cellbox_test_utils::{heavy_script, sandbox, sandbox_with_limits, script};
use cellbox_types::{Capability, CellId, FailureKind, SandboxLimits};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Opt-in log output for debugging: `RUST_LOG=debug cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn strategies_for(audit: &cellbox_kernel::AuditLog, cell: &CellId) -> Vec<String> {
    audit
        .events_for(cell)
        .into_iter()
        .filter_map(|e| match e.action {
            AuditAction::RouteSelected { strategy } => Some(strategy),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn routing_is_deterministic_by_kind() {
    init_tracing();
    let (sandbox, _) = sandbox();

    sandbox
        .register_cell(script("plain", "echo", &[]))
        .unwrap();
    sandbox
        .register_cell(heavy_script("heavy", "echo"))
        .unwrap();

    sandbox
        .execute(&CellId::from("plain"), json!(1))
        .await
        .unwrap();
    sandbox
        .execute(&CellId::from("heavy"), json!(1))
        .await
        .unwrap();

    let audit = sandbox.audit();
    assert_eq!(
        strategies_for(&audit, &CellId::from("plain")),
        vec!["isolated"]
    );
    assert_eq!(
        strategies_for(&audit, &CellId::from("heavy")),
        vec!["background"]
    );
    sandbox.shutdown();
}

#[tokio::test]
async fn unregistered_cells_fail_with_permission_config_missing() {
    let (sandbox, _) = sandbox();
    let failure = sandbox
        .execute(&CellId::from("ghost"), json!(null))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::PermissionConfigMissing);
    sandbox.shutdown();
}

#[tokio::test]
async fn concurrent_requests_for_one_cell_fail_with_already_executing() {
    init_tracing();
    let limits = SandboxLimits::default()
        .with_execution_timeout_ms(500)
        .with_boot_timeout_ms(500);
    let (sandbox, _) = sandbox_with_limits(limits);
    let sandbox = Arc::new(sandbox);

    sandbox.register_cell(script("s1", "stall", &[])).unwrap();

    let first = {
        let sandbox = Arc::clone(&sandbox);
        tokio::spawn(async move { sandbox.execute(&CellId::from("s1"), json!(null)).await })
    };

    // Wait until the first request is actually in flight.
    for _ in 0..100 {
        if sandbox.in_flight_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(sandbox.in_flight_count(), 1);

    let failure = sandbox
        .execute(&CellId::from("s1"), json!(null))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::AlreadyExecuting);

    let first = first.await.unwrap();
    assert_eq!(first.unwrap_err().kind, FailureKind::TimedOut);
    // Exactly one context ever existed: the rejected request never
    // created a second one.
    assert_eq!(sandbox.pool_stats().spawned, 1);
    sandbox.shutdown();
}

#[tokio::test]
async fn timed_out_requests_destroy_their_context() {
    let limits = SandboxLimits::default().with_execution_timeout_ms(100);
    let (sandbox, _) = sandbox_with_limits(limits);

    sandbox.register_cell(script("s1", "stall", &[])).unwrap();

    let failure = sandbox
        .execute(&CellId::from("s1"), json!(null))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::TimedOut);

    let stats = sandbox.pool_stats();
    assert_eq!(stats.destroyed, 1);
    assert_eq!(stats.idle, 0);
    sandbox.shutdown();
}

#[tokio::test]
async fn denied_host_operation_does_not_abort_the_cell() {
    let (sandbox, services) = sandbox();

    // No declared capabilities: network:fetch must be denied.
    sandbox.register_cell(script("c1", "fetch", &[])).unwrap();

    let output = sandbox
        .execute(&CellId::from("c1"), json!(null))
        .await
        .unwrap();
    assert_eq!(output.output, json!({ "fetched": false }));
    assert!(services.calls().is_empty());

    // The denied check is in the audit trail.
    let audit = sandbox.audit();
    assert!(audit
        .events_for(&CellId::from("c1"))
        .iter()
        .any(|e| matches!(&e.action, AuditAction::CapabilityChecked {
            capability: Capability::NetworkFetch,
            granted: false,
            ..
        })));
    sandbox.shutdown();
}

#[tokio::test]
async fn granted_host_operation_reaches_the_services() {
    let (sandbox, services) = sandbox();

    sandbox
        .register_cell(script("c1", "fetch", &[Capability::NetworkFetch]))
        .unwrap();

    let output = sandbox
        .execute(&CellId::from("c1"), json!(null))
        .await
        .unwrap();
    assert_eq!(output.output["fetched"], json!(true));
    assert_eq!(
        services.calls(),
        vec![(CellId::from("c1"), "network.fetch".to_string())]
    );
    sandbox.shutdown();
}

#[tokio::test]
async fn a_hundred_and_first_message_kills_the_cell() {
    let (sandbox, _) = sandbox();

    sandbox
        .register_cell(script("c2", "chatty:101", &[]))
        .unwrap();

    let failure = sandbox
        .execute(&CellId::from("c2"), json!(null))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::RateLimitExceeded);

    // Context torn down, not pooled.
    let stats = sandbox.pool_stats();
    assert_eq!(stats.destroyed, 1);
    assert_eq!(stats.idle, 0);
    sandbox.shutdown();
}

#[tokio::test]
async fn one_byte_over_the_output_cap_fails_the_request() {
    let (sandbox, _) = sandbox();

    // 1 MiB + 1 byte of raw string content.
    sandbox
        .register_cell(script("c3", "blob:1048577", &[]))
        .unwrap();

    let failure = sandbox
        .execute(&CellId::from("c3"), json!(null))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::OutputLimitExceeded);
    sandbox.shutdown();
}

#[tokio::test]
async fn full_background_queue_fails_fast_with_overloaded() {
    let limits = SandboxLimits::default()
        .with_execution_timeout_ms(500)
        .with_background_workers(1)
        .with_max_queue_depth(1);
    let (sandbox, _) = sandbox_with_limits(limits);
    let sandbox = Arc::new(sandbox);

    sandbox
        .register_cell(heavy_script("slow", "stall"))
        .unwrap();
    sandbox
        .register_cell(heavy_script("queued", "echo"))
        .unwrap();
    sandbox
        .register_cell(heavy_script("rejected", "echo"))
        .unwrap();

    // Occupy the single worker.
    let slow = {
        let sandbox = Arc::clone(&sandbox);
        tokio::spawn(async move { sandbox.execute(&CellId::from("slow"), json!(null)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Occupy the single queue slot.
    let queued = {
        let sandbox = Arc::clone(&sandbox);
        tokio::spawn(async move { sandbox.execute(&CellId::from("queued"), json!(null)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let failure = sandbox
        .execute(&CellId::from("rejected"), json!(null))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::Overloaded);

    let _ = slow.await;
    let _ = queued.await;
    sandbox.shutdown();
}

#[tokio::test]
async fn sequential_requests_for_one_cell_are_fine() {
    let (sandbox, _) = sandbox();
    sandbox.register_cell(script("s1", "echo", &[])).unwrap();

    for i in 0..3 {
        let output = sandbox
            .execute(&CellId::from("s1"), json!(i))
            .await
            .unwrap();
        assert_eq!(output.output, json!(i));
    }
    assert_eq!(sandbox.in_flight_count(), 0);
    sandbox.shutdown();
}
