//! The process-wide context object.
//!
//! [`SandboxRuntime`] owns one instance of every manager and is built once at
//! startup, then shared (usually as `Arc<SandboxRuntime>`) with whatever
//! serves requests. It exposes the operations a gateway calls.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use enclave_state::{AuditSink, StateStore};

use crate::backend::BackendSelector;
use crate::budget::{BudgetLedger, BudgetManager};
use crate::config::EnclaveConfig;
use crate::delegation::DelegationBoard;
use crate::error::{EnclaveError, EnclaveResult};
use crate::persist::Persister;
use crate::registry::AgentRegistry;
use crate::sandbox::{ExecutionRequest, ExecutionResult, Sandbox, SandboxManager};
use crate::scheduler::{BlueprintExecutor, BlueprintOutcome, SandboxTaskRunner, TaskNode};
use crate::security::{EscapeRuleSet, SecurityGate};

/// Shortest period [`SandboxRuntime::spawn_maintenance`] will tick at.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Per-agent result of [`SandboxRuntime::deploy_all`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeployOutcome {
    Deployed { sandbox: Box<Sandbox> },
    Failed { error: String },
}

impl DeployOutcome {
    pub fn is_deployed(&self) -> bool {
        matches!(self, DeployOutcome::Deployed { .. })
    }
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub expired_sandboxes: Vec<String>,
    pub expired_reservations: usize,
    /// Deferred writes still failing after the flush.
    pub pending_writes: usize,
}

pub struct SandboxRuntime {
    config: EnclaveConfig,
    registry: Arc<AgentRegistry>,
    persister: Arc<Persister>,
    budget: Arc<BudgetManager>,
    sandboxes: Arc<SandboxManager>,
    gate: Arc<SecurityGate>,
    delegation: DelegationBoard,
}

impl SandboxRuntime {
    /// Build the runtime with HTTP backends taken from `config`.
    pub fn from_config(
        config: EnclaveConfig,
        store: Arc<dyn StateStore>,
        audit: Arc<dyn AuditSink>,
    ) -> EnclaveResult<Self> {
        config.validate()?;
        let selector = BackendSelector::from_config(&config)?;
        Self::with_selector(config, selector, store, audit)
    }

    /// Build the runtime around an already assembled backend chain.
    pub fn with_selector(
        config: EnclaveConfig,
        selector: BackendSelector,
        store: Arc<dyn StateStore>,
        audit: Arc<dyn AuditSink>,
    ) -> EnclaveResult<Self> {
        config.validate()?;
        let persister = Arc::new(Persister::new(store, config.store_timeout()));
        let budget = Arc::new(BudgetManager::new(
            config.default_budget,
            config.budgets.clone(),
            Arc::clone(&persister),
        ));
        let sandboxes = Arc::new(SandboxManager::new(
            Arc::new(selector),
            Arc::clone(&persister),
            config.default_timeout(),
            config.deploy_timeout(),
        ));
        let gate = Arc::new(SecurityGate::new(
            EscapeRuleSet::standard(),
            audit,
            config.store_timeout(),
            Arc::clone(&sandboxes),
        ));
        let delegation = DelegationBoard::new(Arc::clone(&persister));

        Ok(Self {
            registry: Arc::new(config.registry()),
            config,
            persister,
            budget,
            sandboxes,
            gate,
            delegation,
        })
    }

    /// Hydrate durable state, then run one sweep.
    #[instrument(skip(self))]
    pub async fn start(&self) -> SweepReport {
        let sandboxes = self.sandboxes.hydrate().await;
        let delegation = self.delegation.hydrate().await;
        info!(sandboxes, delegation, "runtime state hydrated");
        self.sweep().await
    }

    /// Deploy every catalog agent. One failure does not stop the others.
    pub async fn deploy_all(&self) -> BTreeMap<String, DeployOutcome> {
        let deploys = self.registry.iter().map(|config| async move {
            let outcome = match self.deploy(&config.agent_id).await {
                Ok(sandbox) => DeployOutcome::Deployed {
                    sandbox: Box::new(sandbox),
                },
                Err(e) => DeployOutcome::Failed {
                    error: e.to_string(),
                },
            };
            (config.agent_id.clone(), outcome)
        });
        let outcomes: BTreeMap<_, _> = futures::future::join_all(deploys)
            .await
            .into_iter()
            .collect();
        let failed = outcomes.values().filter(|o| !o.is_deployed()).count();
        info!(total = outcomes.len(), failed, "deploy_all finished");
        outcomes
    }

    pub async fn deploy(&self, agent_id: &str) -> EnclaveResult<Sandbox> {
        let config = self
            .registry
            .get(agent_id)
            .ok_or_else(|| EnclaveError::agent_not_found(agent_id))?;
        let limit = self.budget.ledger(agent_id).await.initial;
        self.sandboxes.deploy(config, limit).await
    }

    /// Execute without escape screening.
    pub async fn execute(&self, request: &ExecutionRequest) -> EnclaveResult<ExecutionResult> {
        self.sandboxes.execute(request).await
    }

    pub async fn secure_execute(
        &self,
        request: &ExecutionRequest,
    ) -> EnclaveResult<ExecutionResult> {
        self.gate.secure_execute(request).await
    }

    pub async fn terminate(&self, sandbox_id: &str) -> EnclaveResult<bool> {
        self.sandboxes.terminate(sandbox_id).await
    }

    pub async fn extend_ttl(&self, sandbox_id: &str, days: u32) -> Option<Sandbox> {
        self.sandboxes.extend_ttl(sandbox_id, days).await
    }

    pub async fn get_sandbox(&self, sandbox_id: &str) -> Option<Sandbox> {
        self.sandboxes.get(sandbox_id).await
    }

    pub async fn list_sandboxes(&self) -> Vec<Sandbox> {
        self.sandboxes.list().await
    }

    /// Ledger snapshot for a catalog agent or one with a configured budget.
    pub async fn get_budget_ledger(&self, agent_id: &str) -> EnclaveResult<BudgetLedger> {
        if self.registry.get(agent_id).is_none() && !self.config.budgets.contains_key(agent_id) {
            return Err(EnclaveError::agent_not_found(agent_id));
        }
        Ok(self.budget.ledger(agent_id).await)
    }

    pub async fn get_delegation_state(&self) -> Value {
        self.delegation.get().await
    }

    pub async fn merge_delegation_state(&self, patch: Value) -> EnclaveResult<Value> {
        self.delegation.merge(patch).await
    }

    /// Run a blueprint through agent sandboxes, charging each agent's budget.
    pub async fn execute_blueprint(&self, tasks: Vec<TaskNode>) -> EnclaveResult<BlueprintOutcome> {
        let runner = SandboxTaskRunner::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.budget),
            Arc::clone(&self.sandboxes),
            Arc::clone(&self.gate),
        );
        debug!(run_id = %runner.run_id(), tasks = tasks.len(), "blueprint accepted");
        BlueprintExecutor::new(Arc::new(runner), self.config.max_concurrent_tasks)
            .execute(tasks)
            .await
    }

    /// Expire sandboxes, expire stale reservations, retry deferred writes.
    pub async fn sweep(&self) -> SweepReport {
        let expired_sandboxes = self.sandboxes.sweep_expired().await;
        let expired_reservations = self
            .budget
            .expire_reservations(Utc::now(), self.config.reservation_ttl())
            .await;
        let pending_writes = self.persister.flush_pending().await;
        let report = SweepReport {
            expired_sandboxes,
            expired_reservations,
            pending_writes,
        };
        debug!(?report, "sweep finished");
        report
    }

    /// Run [`Self::sweep`] every `interval` (at least one second) until the
    /// handle is aborted.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let runtime = Arc::clone(self);
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; `start` already swept.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                runtime.sweep().await;
            }
        })
    }

    pub fn config(&self) -> &EnclaveConfig {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn budget(&self) -> &BudgetManager {
        &self.budget
    }

    pub fn gate(&self) -> &SecurityGate {
        &self.gate
    }
}
