//! Runs blueprint tasks in agent sandboxes under budget.
//!
//! Per task: resolve the agent from `tool`, reserve `budget_per_task`, deploy
//! (or reuse) its sandbox, execute through the security gate, then commit on
//! a genuine success or roll back otherwise. An agent that cannot pay never
//! provisions a sandbox.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{instrument, warn};

use super::{TaskNode, TaskRunner};
use crate::budget::BudgetManager;
use crate::error::{EnclaveError, EnclaveResult};
use crate::registry::{AgentRegistry, SandboxConfig};
use crate::sandbox::{ExecutionRequest, ExecutionResult, SandboxManager};
use crate::security::SecurityGate;

pub struct SandboxTaskRunner {
    registry: Arc<AgentRegistry>,
    budget: Arc<BudgetManager>,
    sandboxes: Arc<SandboxManager>,
    gate: Arc<SecurityGate>,
    /// Prefix for reservation keys, so identical task ids in different
    /// blueprint runs never share a reservation.
    run_id: String,
}

impl SandboxTaskRunner {
    pub fn new(
        registry: Arc<AgentRegistry>,
        budget: Arc<BudgetManager>,
        sandboxes: Arc<SandboxManager>,
        gate: Arc<SecurityGate>,
    ) -> Self {
        Self {
            registry,
            budget,
            sandboxes,
            gate,
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn agent_for(&self, task: &TaskNode) -> EnclaveResult<&SandboxConfig> {
        let agent_id = task.tool.split('.').next().unwrap_or_default();
        self.registry
            .get(agent_id)
            .ok_or_else(|| EnclaveError::agent_not_found(agent_id))
    }

    async fn settle(
        &self,
        agent_id: &str,
        sandbox_id: &str,
        amount: u64,
        key: &str,
        outcome: &EnclaveResult<ExecutionResult>,
    ) -> EnclaveResult<()> {
        match outcome {
            Ok(result) if result.is_genuine_success() => {
                self.budget.commit(agent_id, amount, key).await?;
                self.sandboxes.record_spend(sandbox_id, amount).await;
            }
            _ => {
                if let Err(e) = self.budget.rollback(agent_id, amount, key).await {
                    warn!(agent_id = %agent_id, key = %key, error = %e, "rollback failed");
                }
            }
        }
        Ok(())
    }
}

fn request_for(task: &TaskNode, sandbox_id: &str, agent_id: &str) -> EnclaveResult<ExecutionRequest> {
    let code = task
        .params
        .get("code")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            EnclaveError::InvalidBlueprint(format!("task {} has no string `code` parameter", task.id))
        })?;
    let mut request = ExecutionRequest::new(sandbox_id, code).with_actor(agent_id);
    if let Some(language) = task.params.get("language").and_then(Value::as_str) {
        request = request.with_language(language);
    }
    if let Some(secs) = task.params.get("timeout_secs").and_then(Value::as_u64) {
        request = request.with_timeout_secs(secs);
    }
    if let Some(env) = task.params.get("env").and_then(Value::as_object) {
        for (k, v) in env {
            if let Some(v) = v.as_str() {
                request = request.with_env(k.as_str(), v);
            }
        }
    }
    Ok(request)
}

#[async_trait]
impl TaskRunner for SandboxTaskRunner {
    #[instrument(skip(self, task), fields(task_id = %task.id, tool = %task.tool))]
    async fn run(&self, task: &TaskNode) -> EnclaveResult<Value> {
        let config = self.agent_for(task)?;
        let agent_id = config.agent_id.as_str();
        let amount = config.budget_per_task;

        let request = request_for(task, &config.sandbox_id, agent_id)?;

        let key = format!("{}/{}", self.run_id, task.id);
        if !self.budget.reserve(agent_id, amount, &key).await {
            return Err(EnclaveError::BudgetExceeded {
                agent_id: agent_id.to_string(),
                requested: amount,
                available: self.budget.ledger(agent_id).await.available(),
            });
        }

        let limit = self.budget.ledger(agent_id).await.initial;
        let sandbox = match self.sandboxes.deploy(config, limit).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                if let Err(rb) = self.budget.rollback(agent_id, amount, &key).await {
                    warn!(agent_id = %agent_id, key = %key, error = %rb, "rollback failed");
                }
                return Err(e);
            }
        };

        let outcome = self.gate.secure_execute(&request).await;
        self.settle(agent_id, &sandbox.id, amount, &key, &outcome)
            .await?;

        let result = outcome?;
        if result.is_policy_denial() {
            let denial = result.denial.unwrap_or_default();
            return Err(EnclaveError::SecurityViolation {
                severity: denial.severity,
                patterns: denial.patterns,
            });
        }
        if !result.success {
            return Err(EnclaveError::ExecutionFailed {
                sandbox_id: sandbox.id,
                exit_code: result.exit_code,
                stderr: result.stderr,
            });
        }
        Ok(json!({
            "sandbox_id": sandbox.id,
            "agent_id": agent_id,
            "charged": if result.is_genuine_success() { amount } else { 0 },
            "result": result,
        }))
    }

    fn lane(&self, task: &TaskNode) -> String {
        self.agent_for(task)
            .map(|c| c.sandbox_id.clone())
            .unwrap_or_else(|_| task.id.clone())
    }
}
