//! Structured tracing events for sandbox, budget, security and blueprint
//! lifecycle.

use std::sync::Arc;

use enclave_core::fakes::ScriptedBackend;
use enclave_core::obs::{
    emit_blueprint_finished, emit_budget_transaction, emit_persist_deferred,
    emit_sandbox_deployed, emit_sandbox_executed, emit_sandbox_expired, emit_sandbox_terminated,
    emit_security_decision, SandboxSpan,
};
use enclave_core::{
    BackendKind, BackendSelector, EnclaveConfig, ExecutionRequest, SandboxConfig, SandboxRuntime,
};
use enclave_state::fakes::{MemoryAuditSink, MemoryStateStore};
use tracing_test::traced_test;

#[traced_test]
#[test]
fn test_emit_sandbox_deployed_logs_backend() {
    emit_sandbox_deployed("sbx-writer", "primary", false);
    assert!(logs_contain("sandbox.deployed"));
    assert!(logs_contain("backend=primary"));
}

#[traced_test]
#[test]
fn test_emit_sandbox_executed_logs_provenance() {
    emit_sandbox_executed("sbx-writer", "stub", true, 0, 12);
    assert!(logs_contain("sandbox.executed"));
    assert!(logs_contain("provenance=stub"));
}

#[traced_test]
#[test]
fn test_emit_sandbox_terminated_and_expired() {
    emit_sandbox_expired("sbx-old", 3600);
    emit_sandbox_terminated("sbx-old", "expired");
    assert!(logs_contain("sandbox.expired"));
    assert!(logs_contain("sandbox.terminated"));
}

#[traced_test]
#[test]
fn test_emit_budget_transaction_logs_kind() {
    emit_budget_transaction("writer", "reserve", 10, "run/task-1");
    assert!(logs_contain("budget.transaction"));
    assert!(logs_contain("kind=reserve"));
}

#[traced_test]
#[test]
fn test_emit_security_decision_deny_is_warning() {
    emit_security_decision("sbx-writer", false, Some("critical"));
    assert!(logs_contain("WARN"));
    assert!(logs_contain("decision=\"deny\""));
}

#[traced_test]
#[test]
fn test_emit_blueprint_finished_and_persist_deferred() {
    emit_blueprint_finished(3, 2, 1);
    emit_persist_deferred("sandboxes", "sbx-writer", &"store unavailable");
    assert!(logs_contain("blueprint.finished"));
    assert!(logs_contain("persist.deferred"));
}

#[traced_test]
#[test]
fn test_sandbox_span_carries_sandbox_id() {
    let _span = SandboxSpan::enter("sbx-span");
    emit_sandbox_terminated("sbx-span", "requested");
    assert!(logs_contain("enclave.sandbox"));
}

#[tokio::test]
#[traced_test]
async fn test_runtime_operations_emit_lifecycle_events() {
    let config = EnclaveConfig {
        agents: Some(vec![SandboxConfig::new("writer")]),
        ..EnclaveConfig::default()
    };
    let runtime = SandboxRuntime::with_selector(
        config,
        BackendSelector::new(5).with_backend(Arc::new(ScriptedBackend::new(BackendKind::Primary))),
        Arc::new(MemoryStateStore::new()),
        Arc::new(MemoryAuditSink::new()),
    )
    .unwrap();

    let sandbox = runtime.deploy("writer").await.unwrap();
    runtime
        .secure_execute(&ExecutionRequest::new(&sandbox.id, "print(1)"))
        .await
        .unwrap();
    runtime.terminate(&sandbox.id).await.unwrap();

    assert!(logs_contain("sandbox.deployed"));
    assert!(logs_contain("security.decision"));
    assert!(logs_contain("sandbox.executed"));
    assert!(logs_contain("sandbox.terminated"));
}
