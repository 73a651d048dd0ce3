//! Blueprint execution through real sandboxes, with budget accounting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use enclave_core::fakes::{Script, ScriptedBackend};
use enclave_core::{
    BackendKind, BackendSelector, EnclaveConfig, EnclaveError, SandboxConfig, SandboxRuntime,
    StubBackend, TaskNode, TransactionKind,
};
use enclave_state::fakes::{MemoryAuditSink, MemoryStateStore};
use serde_json::json;

struct Fixture {
    runtime: SandboxRuntime,
    primary: Arc<ScriptedBackend>,
}

fn fixture(budgets: &[(&str, u64)], stub: bool) -> Fixture {
    let config = EnclaveConfig {
        budgets: budgets
            .iter()
            .map(|(a, b)| (a.to_string(), *b))
            .collect::<HashMap<_, _>>(),
        agents: Some(vec![
            SandboxConfig::new("writer").with_budget_per_task(10),
            SandboxConfig::new("editor").with_budget_per_task(5),
            SandboxConfig::new("analyst").with_budget_per_task(5),
        ]),
        max_concurrent_tasks: 4,
        ..EnclaveConfig::default()
    };
    let primary = Arc::new(ScriptedBackend::new(BackendKind::Primary));
    let mut selector = BackendSelector::new(5).with_backend(primary.clone());
    if stub {
        selector = selector.with_stub(Arc::new(StubBackend::new()));
    }
    let runtime = SandboxRuntime::with_selector(
        config,
        selector,
        Arc::new(MemoryStateStore::new()),
        Arc::new(MemoryAuditSink::new()),
    )
    .unwrap();
    Fixture { runtime, primary }
}

fn task(id: &str, tool: &str, code: &str) -> TaskNode {
    TaskNode::new(id, tool).with_params(json!({ "code": code }))
}

#[tokio::test]
async fn dependent_tasks_run_after_their_dependency_and_are_charged() {
    let f = fixture(&[("writer", 100)], true);
    let out = f
        .runtime
        .execute_blueprint(vec![
            task("a", "writer", "step_a()"),
            task("b", "editor.review", "step_b()").depends_on(&["a"]),
            task("c", "analyst", "step_c()").depends_on(&["a"]),
        ])
        .await
        .unwrap();

    assert!(out.success, "{:?}", out.errors);
    assert_eq!(out.completed[0], "a");
    assert_eq!(out.completed.len(), 3);

    let executed = f.primary.executed();
    assert_eq!(executed[0], "step_a()");

    let writer = f.runtime.get_budget_ledger("writer").await.unwrap();
    assert_eq!(writer.spent, 10);
    assert_eq!(writer.reserved, 0);
    let kinds: Vec<TransactionKind> = writer.transactions.iter().map(|t| t.kind).collect();
    assert_eq!(kinds, vec![TransactionKind::Reserve, TransactionKind::Commit]);

    let sandbox = f.runtime.get_sandbox("sbx-writer").await.unwrap();
    assert_eq!(sandbox.budget_spent, 10);

    let artifact = out.artifact("a").unwrap();
    assert_eq!(artifact.result.as_ref().unwrap()["charged"], 10);
}

#[tokio::test]
async fn failed_root_blocks_dependents_and_refunds() {
    let f = fixture(&[], true);
    f.primary.set_script(Script::Exit(3));

    let out = f
        .runtime
        .execute_blueprint(vec![
            task("a", "writer", "fail()"),
            task("b", "editor", "never()").depends_on(&["a"]),
            task("c", "analyst", "never()").depends_on(&["a"]),
        ])
        .await
        .unwrap();

    assert!(!out.success);
    assert!(out.errors.iter().any(|e| e.contains("task a")));
    assert_eq!(f.primary.executed(), vec!["fail()".to_string()]);

    let writer = f.runtime.get_budget_ledger("writer").await.unwrap();
    assert_eq!(writer.spent, 0);
    assert_eq!(writer.reserved, 0);
    assert_eq!(
        writer.transactions.last().unwrap().kind,
        TransactionKind::Rollback
    );
}

#[tokio::test]
async fn cycle_reports_failure_without_running_anything() {
    let f = fixture(&[], true);
    let out = f
        .runtime
        .execute_blueprint(vec![
            task("A", "writer", "a()").depends_on(&["B"]),
            task("B", "writer", "b()").depends_on(&["A"]),
        ])
        .await
        .unwrap();

    assert!(!out.success);
    assert!(out.errors.iter().any(|e| e.contains("circular")));
    assert!(out.artifacts.iter().all(|a| !a.success));
    assert!(out.completed.is_empty());
    assert_eq!(f.primary.execute_calls(), 0);
}

#[tokio::test]
async fn exhausted_budget_fails_task_with_budget_error() {
    let f = fixture(&[("writer", 15)], true);
    let out = f
        .runtime
        .execute_blueprint(vec![
            task("first", "writer", "one()"),
            task("second", "writer", "two()").depends_on(&["first"]),
        ])
        .await
        .unwrap();

    assert_eq!(out.completed, vec!["first".to_string()]);
    let err = out.artifact("second").unwrap().error.clone().unwrap();
    assert!(err.contains("budget exceeded"), "{err}");
    assert_eq!(f.primary.execute_calls(), 1);

    let writer = f.runtime.get_budget_ledger("writer").await.unwrap();
    assert!(writer.spent + writer.reserved <= writer.initial);
}

#[tokio::test]
async fn escape_attempt_in_blueprint_is_denied_and_refunded() {
    let f = fixture(&[], true);
    let out = f
        .runtime
        .execute_blueprint(vec![task("x", "writer", "import os\nos.system('id')")])
        .await
        .unwrap();

    assert!(!out.success);
    assert!(out.errors[0].contains("security violation (critical)"), "{}", out.errors[0]);
    assert!(out.errors[0].contains("os.system"), "{}", out.errors[0]);
    assert!(out.errors[0].contains("os import"), "{}", out.errors[0]);
    assert_eq!(f.primary.execute_calls(), 0);
    let writer = f.runtime.get_budget_ledger("writer").await.unwrap();
    assert_eq!(writer.spent, 0);
    assert_eq!(writer.reserved, 0);
}

#[tokio::test]
async fn agent_without_budget_never_provisions_a_sandbox() {
    let f = fixture(&[("writer", 0)], true);
    let out = f
        .runtime
        .execute_blueprint(vec![task("a", "writer", "work()")])
        .await
        .unwrap();

    assert!(!out.success);
    assert!(out.errors[0].contains("budget exceeded"), "{}", out.errors[0]);
    assert_eq!(f.primary.provision_calls(), 0);
    assert!(f.runtime.get_sandbox("sbx-writer").await.is_none());
}

#[tokio::test]
async fn failed_deploy_releases_the_reservation() {
    let f = fixture(&[("writer", 100)], false);
    f.primary.set_provision_fails(true);
    let out = f
        .runtime
        .execute_blueprint(vec![task("a", "writer", "work()")])
        .await
        .unwrap();

    assert!(!out.success);
    let writer = f.runtime.get_budget_ledger("writer").await.unwrap();
    assert_eq!(writer.reserved, 0);
    assert_eq!(writer.spent, 0);
    let kinds: Vec<TransactionKind> = writer.transactions.iter().map(|t| t.kind).collect();
    assert_eq!(kinds, vec![TransactionKind::Reserve, TransactionKind::Rollback]);
}

#[tokio::test]
async fn stub_results_complete_the_task_but_are_not_charged() {
    let f = fixture(&[], true);
    f.primary.set_script(Script::Fail);

    let out = f
        .runtime
        .execute_blueprint(vec![task("a", "writer", "work()")])
        .await
        .unwrap();
    assert!(out.success);
    let result = out.artifact("a").unwrap().result.clone().unwrap();
    assert_eq!(result["charged"], 0);
    assert_eq!(result["result"]["provenance"], "stub");
    assert_eq!(result["result"]["degraded"], true);
    assert_eq!(f.runtime.get_budget_ledger("writer").await.unwrap().spent, 0);
}

#[tokio::test]
async fn unknown_agent_and_missing_code_are_task_failures() {
    let f = fixture(&[], true);
    let out = f
        .runtime
        .execute_blueprint(vec![
            task("ghost", "nobody.tool", "x()"),
            TaskNode::new("empty", "writer"),
        ])
        .await
        .unwrap();
    assert!(!out.success);
    assert!(out.artifact("ghost").unwrap().error.as_ref().unwrap().contains("agent not found"));
    assert!(out.artifact("empty").unwrap().error.as_ref().unwrap().contains("code"));
}

#[tokio::test]
async fn duplicate_task_ids_are_rejected() {
    let f = fixture(&[], true);
    let err = f
        .runtime
        .execute_blueprint(vec![task("a", "writer", "1"), task("a", "editor", "2")])
        .await
        .unwrap_err();
    assert!(matches!(err, EnclaveError::InvalidBlueprint(_)));
}

#[tokio::test]
async fn same_sandbox_tasks_share_a_lane_while_agents_run_in_parallel() {
    let f = fixture(&[], true);
    f.primary.set_script(Script::Delay(Duration::from_millis(50)));

    let out = f
        .runtime
        .execute_blueprint(vec![
            task("w1", "writer", "w1()"),
            task("w2", "writer", "w2()"),
            task("e1", "editor", "e1()"),
            task("a1", "analyst", "a1()"),
        ])
        .await
        .unwrap();

    // A busy sandbox would reject a concurrent execute; lanes prevent that.
    assert!(out.success, "{:?}", out.errors);
    assert_eq!(out.waves, 1);
    assert!(f.primary.peak_in_flight() >= 2);
    assert!(f.primary.peak_in_flight() <= 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_blueprints_never_overdraw_a_shared_agent() {
    let f = Arc::new(fixture(&[("writer", 35)], true));

    let mut handles = Vec::new();
    for i in 0..6 {
        let f = f.clone();
        handles.push(tokio::spawn(async move {
            f.runtime
                .execute_blueprint(vec![task(&format!("t{i}"), "writer", "work()")])
                .await
                .unwrap()
        }));
    }
    let mut succeeded = 0;
    for h in handles {
        if h.await.unwrap().success {
            succeeded += 1;
        }
    }

    let writer = f.runtime.get_budget_ledger("writer").await.unwrap();
    assert!(writer.spent + writer.reserved <= writer.initial);
    assert_eq!(writer.reserved, 0);
    assert_eq!(writer.spent, succeeded * 10);
    assert!(succeeded <= 3);
}
