//! End-to-end sandbox lifecycle through `SandboxRuntime`.

use std::collections::HashMap;
use std::sync::Arc;

use enclave_core::fakes::{Script, ScriptedBackend};
use enclave_core::{
    BackendKind, BackendSelector, EnclaveConfig, EnclaveError, ExecutionRequest, Provenance,
    SandboxConfig, SandboxRuntime, SandboxStatus, StubBackend,
};
use enclave_state::fakes::{MemoryAuditSink, MemoryStateStore};
use enclave_state::{collections, StateStore};
use serde_json::json;

struct Fixture {
    runtime: Arc<SandboxRuntime>,
    primary: Arc<ScriptedBackend>,
    secondary: Arc<ScriptedBackend>,
    store: Arc<MemoryStateStore>,
}

fn config() -> EnclaveConfig {
    EnclaveConfig {
        budgets: HashMap::from([("writer".to_string(), 100)]),
        agents: Some(vec![
            SandboxConfig::new("writer").with_budget_per_task(10),
            SandboxConfig::new("reviewer").with_ttl_days(1),
            SandboxConfig::new("ephemeral").with_ttl_days(0),
        ]),
        ..EnclaveConfig::default()
    }
}

fn fixture_with_store(store: Arc<MemoryStateStore>) -> Fixture {
    let primary = Arc::new(ScriptedBackend::new(BackendKind::Primary));
    let secondary = Arc::new(ScriptedBackend::new(BackendKind::Secondary));
    let selector = BackendSelector::new(5)
        .with_backend(primary.clone())
        .with_backend(secondary.clone())
        .with_stub(Arc::new(StubBackend::new()));
    let runtime = SandboxRuntime::with_selector(
        config(),
        selector,
        store.clone(),
        Arc::new(MemoryAuditSink::new()),
    )
    .unwrap();
    Fixture {
        runtime: Arc::new(runtime),
        primary,
        secondary,
        store,
    }
}

fn fixture() -> Fixture {
    fixture_with_store(Arc::new(MemoryStateStore::new()))
}

#[tokio::test]
async fn deploy_all_reports_each_agent() {
    let f = fixture();
    let outcomes = f.runtime.deploy_all().await;
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.values().all(|o| o.is_deployed()));
    assert_eq!(f.primary.provision_calls(), 3);
}

#[tokio::test]
async fn deploy_all_isolates_failures() {
    let f = fixture();
    f.primary.set_provision_fails(true);
    f.secondary.set_provision_fails(true);

    let outcomes = f.runtime.deploy_all().await;
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.values().all(|o| !o.is_deployed()));
    let rendered = serde_json::to_value(&outcomes["writer"]).unwrap();
    assert_eq!(rendered["outcome"], "failed");
}

#[tokio::test]
async fn deploy_twice_within_ttl_returns_same_sandbox() {
    let f = fixture();
    let a = f.runtime.deploy("writer").await.unwrap();
    let b = f.runtime.deploy("writer").await.unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(a.created_at, b.created_at);
    assert_eq!(a.budget_limit, 100);
    assert_eq!(f.primary.provision_calls(), 1);
}

#[tokio::test]
async fn deploy_unknown_agent_is_not_found() {
    let f = fixture();
    let err = f.runtime.deploy("nobody").await.unwrap_err();
    assert!(matches!(err, EnclaveError::NotFound { kind: "agent", .. }));
}

#[tokio::test]
async fn expired_sandbox_is_never_ready_and_is_redeployed() {
    let f = fixture();
    let first = f.runtime.deploy("ephemeral").await.unwrap();
    assert_ne!(
        f.runtime.get_sandbox(&first.id).await.unwrap().status,
        SandboxStatus::Ready
    );

    let err = f
        .runtime
        .execute(&ExecutionRequest::new(&first.id, "print(1)"))
        .await
        .unwrap_err();
    assert!(matches!(err, EnclaveError::NotReady { .. }));

    f.runtime.deploy("ephemeral").await.unwrap();
    assert_eq!(f.primary.provision_calls(), 2);
}

#[tokio::test]
async fn sweep_retires_expired_sandboxes() {
    let f = fixture();
    f.runtime.deploy("ephemeral").await.unwrap();
    f.runtime.deploy("reviewer").await.unwrap();

    let report = f.runtime.sweep().await;
    assert_eq!(report.expired_sandboxes, vec!["sbx-ephemeral".to_string()]);
    assert!(f.runtime.get_sandbox("sbx-ephemeral").await.is_none());
    assert!(f.runtime.get_sandbox("sbx-reviewer").await.is_some());
    assert_eq!(f.primary.destroy_calls(), 1);
}

#[tokio::test]
async fn execute_counts_and_provenance() {
    let f = fixture();
    let s = f.runtime.deploy("writer").await.unwrap();

    let ok = f
        .runtime
        .execute(&ExecutionRequest::new(&s.id, "print('hi')"))
        .await
        .unwrap();
    assert_eq!(ok.provenance, Provenance::Primary);

    f.primary.set_script(Script::Fail);
    f.secondary.set_script(Script::Fail);
    let degraded = f
        .runtime
        .execute(&ExecutionRequest::new(&s.id, "print('hi')"))
        .await
        .unwrap();
    assert_eq!(degraded.provenance, Provenance::Stub);
    assert!(degraded.degraded);

    let s = f.runtime.get_sandbox(&s.id).await.unwrap();
    assert_eq!(s.execution_count, 2);
    assert_eq!(s.error_count, 0);
    assert_eq!(s.status, SandboxStatus::Ready);
}

#[tokio::test]
async fn terminate_and_extend_ttl() {
    let f = fixture();
    let s = f.runtime.deploy("reviewer").await.unwrap();

    let extended = f.runtime.extend_ttl(&s.id, 2).await.unwrap();
    assert_eq!((extended.expires_at - s.expires_at).num_days(), 2);

    assert!(f.runtime.terminate(&s.id).await.unwrap());
    assert!(!f.runtime.terminate(&s.id).await.unwrap());
    assert!(f.runtime.extend_ttl(&s.id, 2).await.is_none());
    assert!(f.runtime.list_sandboxes().await.is_empty());
}

#[tokio::test]
async fn restart_hydrates_sandboxes_ledgers_and_delegation() {
    let store = Arc::new(MemoryStateStore::new());
    {
        let f = fixture_with_store(store.clone());
        f.runtime.deploy("writer").await.unwrap();
        f.runtime.deploy("reviewer").await.unwrap();
        f.runtime.terminate("sbx-reviewer").await.unwrap();
        f.runtime.budget().spend("writer", 25, "setup").await;
        f.runtime
            .merge_delegation_state(json!({"lead": "writer"}))
            .await
            .unwrap();
        assert_eq!(f.runtime.sweep().await.pending_writes, 0);
    }

    let f = fixture_with_store(store);
    let report = f.runtime.start().await;
    assert!(report.expired_sandboxes.is_empty());

    let sandboxes = f.runtime.list_sandboxes().await;
    assert_eq!(sandboxes.len(), 1);
    assert_eq!(sandboxes[0].id, "sbx-writer");

    // Reused, not reprovisioned.
    f.runtime.deploy("writer").await.unwrap();
    assert_eq!(f.primary.provision_calls(), 0);

    assert_eq!(f.runtime.get_budget_ledger("writer").await.unwrap().spent, 25);
    assert_eq!(
        f.runtime.get_delegation_state().await,
        json!({"lead": "writer"})
    );
}

#[tokio::test]
async fn budget_ledger_requires_known_agent() {
    let f = fixture();
    assert_eq!(
        f.runtime.get_budget_ledger("writer").await.unwrap().initial,
        100
    );
    assert_eq!(
        f.runtime.get_budget_ledger("reviewer").await.unwrap().initial,
        EnclaveConfig::default().default_budget
    );
    let err = f.runtime.get_budget_ledger("stranger").await.unwrap_err();
    assert!(matches!(err, EnclaveError::NotFound { .. }));
}

#[tokio::test]
async fn store_outage_degrades_then_recovers_on_sweep() {
    let f = fixture();
    f.store.set_available(false);

    let s = f.runtime.deploy("writer").await.unwrap();
    f.runtime
        .execute(&ExecutionRequest::new(&s.id, "print(1)"))
        .await
        .unwrap();
    assert!(f.runtime.get_sandbox(&s.id).await.is_some());
    assert!(f.runtime.sweep().await.pending_writes > 0);

    f.store.set_available(true);
    assert_eq!(f.runtime.sweep().await.pending_writes, 0);
    let stored = f
        .store
        .get(collections::SANDBOXES, &s.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored["execution_count"], 1);
}

#[tokio::test(start_paused = true)]
async fn maintenance_task_sweeps_on_interval() {
    let f = fixture();
    f.runtime.deploy("ephemeral").await.unwrap();

    let handle = f
        .runtime
        .spawn_maintenance(std::time::Duration::from_secs(60));
    tokio::time::sleep(std::time::Duration::from_secs(61)).await;
    tokio::task::yield_now().await;

    assert!(f.runtime.get_sandbox("sbx-ephemeral").await.is_none());
    handle.abort();
}

#[tokio::test(start_paused = true)]
async fn maintenance_task_survives_a_zero_interval() {
    let f = fixture();
    f.runtime.deploy("ephemeral").await.unwrap();

    let handle = f.runtime.spawn_maintenance(std::time::Duration::ZERO);
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    tokio::task::yield_now().await;

    assert!(!handle.is_finished());
    assert!(f.runtime.get_sandbox("sbx-ephemeral").await.is_none());
    handle.abort();
}
