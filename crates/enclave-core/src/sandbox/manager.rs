//! Sandbox state machine.
//!
//! ```text
//! creating -> ready -> executing -> ready
//!                       executing -> error
//! ready | error | executing -> terminating -> terminated
//! creating -> error            (every backend refused to provision)
//! ```
//!
//! The map lock is held only for state transitions, never across a backend
//! call. Each snapshot is queued for the store before the lock is released,
//! so stored records follow the order of the transitions. `executing` doubles as the per-sandbox mutex: a second `execute`
//! against a busy sandbox is rejected with `NotReady`, not queued.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use enclave_state::{collections, Filter};

use super::types::{ExecutionRequest, ExecutionResult, Sandbox, SandboxStatus};
use crate::backend::{BackendCall, BackendKind, BackendSelector};
use crate::error::{EnclaveError, EnclaveResult};
use crate::obs::{
    emit_sandbox_deployed, emit_sandbox_executed, emit_sandbox_expired, emit_sandbox_terminated,
    SandboxSpan,
};
use crate::persist::Persister;
use crate::registry::SandboxConfig;

pub struct SandboxManager {
    sandboxes: RwLock<HashMap<String, Sandbox>>,
    selector: Arc<BackendSelector>,
    persister: Arc<Persister>,
    default_timeout: Duration,
    deploy_timeout: Duration,
}

impl SandboxManager {
    pub fn new(
        selector: Arc<BackendSelector>,
        persister: Arc<Persister>,
        default_timeout: Duration,
        deploy_timeout: Duration,
    ) -> Self {
        Self {
            sandboxes: RwLock::new(HashMap::new()),
            selector,
            persister,
            default_timeout,
            deploy_timeout,
        }
    }

    /// Return the live sandbox for `config.sandbox_id`, or provision a new
    /// one (primary first, then secondary). `budget_limit` is recorded on
    /// the new record.
    #[instrument(skip(self, config), fields(sandbox_id = %config.sandbox_id))]
    pub async fn deploy(&self, config: &SandboxConfig, budget_limit: u64) -> EnclaveResult<Sandbox> {
        let now = Utc::now();
        if expiry_after(now, config.ttl_days).is_none() {
            return Err(EnclaveError::InvalidConfig(format!(
                "ttl_days {} for {} is out of range",
                config.ttl_days, config.sandbox_id
            )));
        }
        let previous = {
            let mut map = self.sandboxes.write().await;
            if let Some(existing) = map.get(&config.sandbox_id) {
                match existing.observed_status(now) {
                    SandboxStatus::Ready | SandboxStatus::Executing => {
                        emit_sandbox_deployed(
                            &existing.id,
                            &existing.backend.to_string(),
                            true,
                        );
                        return Ok(existing.clone());
                    }
                    SandboxStatus::Creating | SandboxStatus::Terminating => {
                        return Err(EnclaveError::NotReady {
                            sandbox_id: existing.id.clone(),
                            status: existing.status.to_string(),
                        });
                    }
                    SandboxStatus::Expired | SandboxStatus::Error | SandboxStatus::Terminated => {}
                }
            }
            map.insert(config.sandbox_id.clone(), placeholder(config, budget_limit))
        };

        // Best-effort cleanup of the incarnation being replaced.
        if let Some(old) = previous.filter(|s| !s.endpoint.is_empty()) {
            if old.observed_status(now) == SandboxStatus::Expired {
                emit_sandbox_expired(&old.id, (now - old.expires_at).num_seconds());
            }
            if let Err(e) = self.selector.destroy(&old, self.deploy_timeout).await {
                warn!(sandbox_id = %old.id, error = %e, "cleanup of replaced sandbox failed");
            }
        }

        let provisioned = self.selector.provision(config, self.deploy_timeout).await;
        let now = Utc::now();
        let snapshot = {
            let mut map = self.sandboxes.write().await;
            let record = map
                .get_mut(&config.sandbox_id)
                .ok_or_else(|| EnclaveError::sandbox_not_found(&config.sandbox_id))?;
            match &provisioned {
                Ok((kind, endpoint)) => {
                    record.status = SandboxStatus::Ready;
                    record.created_at = now;
                    record.expires_at =
                        expiry_after(now, config.ttl_days).unwrap_or(DateTime::<Utc>::MAX_UTC);
                    record.backend = *kind;
                    record.endpoint = endpoint.clone();
                }
                Err(_) => record.status = SandboxStatus::Error,
            }
            self.persist(record);
            record.clone()
        };

        match provisioned {
            Ok((kind, _)) => {
                emit_sandbox_deployed(&snapshot.id, &kind.to_string(), false);
                Ok(snapshot)
            }
            Err(e) => {
                warn!(error = %e, "deploy failed on every backend");
                Err(e)
            }
        }
    }

    /// Run code in a ready sandbox through the backend chain.
    #[instrument(skip(self, request), fields(sandbox_id = %request.sandbox_id))]
    pub async fn execute(&self, request: &ExecutionRequest) -> EnclaveResult<ExecutionResult> {
        let sandbox = {
            let mut map = self.sandboxes.write().await;
            let record = map
                .get_mut(&request.sandbox_id)
                .ok_or_else(|| EnclaveError::sandbox_not_found(&request.sandbox_id))?;
            let now = Utc::now();
            if !record.is_available(now) {
                return Err(EnclaveError::NotReady {
                    sandbox_id: record.id.clone(),
                    status: record.observed_status(now).to_string(),
                });
            }
            record.status = SandboxStatus::Executing;
            record.clone()
        };

        let call = BackendCall {
            code: request.code.clone(),
            language: request.language.clone(),
            timeout_secs: request
                .timeout_secs
                .unwrap_or(self.default_timeout.as_secs())
                .max(1),
            env: request.env.clone(),
        };
        let outcome = self.selector.execute(&sandbox, &call).await;

        let now = Utc::now();
        {
            let mut map = self.sandboxes.write().await;
            match map.get_mut(&sandbox.id) {
                Some(record) if record.created_at == sandbox.created_at => {
                    record.execution_count += 1;
                    record.last_execution_at = Some(now);
                    let failed = outcome.as_ref().map(|r| !r.success).unwrap_or(true);
                    if failed {
                        record.error_count += 1;
                    }
                    if record.status == SandboxStatus::Executing {
                        record.status = if outcome.is_ok() {
                            SandboxStatus::Ready
                        } else {
                            SandboxStatus::Error
                        };
                    }
                    self.persist(record);
                }
                // Terminated while in flight; the result still goes back.
                _ => {}
            }
        }

        let _span = SandboxSpan::enter(&sandbox.id);
        match &outcome {
            Ok(result) => emit_sandbox_executed(
                &sandbox.id,
                &result.provenance.to_string(),
                result.success,
                result.exit_code,
                result.execution_time_ms,
            ),
            Err(e) => warn!(error = %e, "execution failed on every backend"),
        }
        outcome
    }

    /// Retire a sandbox. Unknown or already-retired ids are a no-op
    /// (`Ok(false)`). An in-flight execution is allowed to drain.
    pub async fn terminate(&self, sandbox_id: &str) -> EnclaveResult<bool> {
        self.terminate_with_reason(sandbox_id, "requested").await
    }

    #[instrument(skip(self))]
    async fn terminate_with_reason(&self, sandbox_id: &str, reason: &str) -> EnclaveResult<bool> {
        let sandbox = {
            let mut map = self.sandboxes.write().await;
            let Some(record) = map.get_mut(sandbox_id) else {
                return Ok(false);
            };
            match record.status {
                SandboxStatus::Terminating | SandboxStatus::Terminated => return Ok(false),
                SandboxStatus::Creating => {
                    return Err(EnclaveError::NotReady {
                        sandbox_id: sandbox_id.to_string(),
                        status: record.status.to_string(),
                    })
                }
                _ => {}
            }
            record.status = SandboxStatus::Terminating;
            self.persist(record);
            record.clone()
        };

        if let Err(e) = self.selector.destroy(&sandbox, self.deploy_timeout).await {
            warn!(sandbox_id = %sandbox_id, error = %e, "backend cleanup failed");
        }

        {
            let mut map = self.sandboxes.write().await;
            let same_incarnation = map
                .get(sandbox_id)
                .is_some_and(|r| r.created_at == sandbox.created_at);
            let mut retired = if same_incarnation {
                map.remove(sandbox_id).unwrap_or(sandbox)
            } else {
                sandbox
            };
            retired.status = SandboxStatus::Terminated;
            // A newer incarnation owns the stored record.
            if !map.contains_key(sandbox_id) {
                self.persist(&retired);
            }
        }
        emit_sandbox_terminated(sandbox_id, reason);
        Ok(true)
    }

    /// Push `expires_at` forward by `days`. `None` for unknown or retiring
    /// sandboxes, or when the new expiry is out of range (the record is left
    /// unchanged).
    pub async fn extend_ttl(&self, sandbox_id: &str, days: u32) -> Option<Sandbox> {
        let snapshot = {
            let mut map = self.sandboxes.write().await;
            let record = map.get_mut(sandbox_id)?;
            if matches!(
                record.status,
                SandboxStatus::Terminating | SandboxStatus::Terminated
            ) {
                return None;
            }
            let Some(expires_at) = expiry_after(record.expires_at, days) else {
                warn!(sandbox_id = %sandbox_id, days, "ttl extension out of range");
                return None;
            };
            record.expires_at = expires_at;
            self.persist(record);
            record.clone()
        };
        debug!(sandbox_id = %sandbox_id, expires_at = %snapshot.expires_at, "ttl extended");
        Some(snapshot.observed(Utc::now()))
    }

    /// Terminate every sandbox past its TTL. Returns the retired ids.
    pub async fn sweep_expired(&self) -> Vec<String> {
        let now = Utc::now();
        let expired: Vec<(String, i64)> = self
            .sandboxes
            .read()
            .await
            .values()
            .filter(|s| s.is_expired(now))
            .filter(|s| {
                matches!(
                    s.status,
                    SandboxStatus::Ready | SandboxStatus::Error | SandboxStatus::Executing
                )
            })
            .map(|s| (s.id.clone(), (now - s.expires_at).num_seconds()))
            .collect();

        let mut retired = Vec::new();
        for (id, overdue) in expired {
            emit_sandbox_expired(&id, overdue);
            match self.terminate_with_reason(&id, "expired").await {
                Ok(true) => retired.push(id),
                Ok(false) => {}
                Err(e) => warn!(sandbox_id = %id, error = %e, "expiry termination skipped"),
            }
        }
        retired
    }

    /// Load non-terminated sandboxes from the store. Records already in
    /// memory win. Returns the number loaded.
    pub async fn hydrate(&self) -> usize {
        let stored: Vec<Sandbox> = self
            .persister
            .scan(
                collections::SANDBOXES,
                &[Filter::ne("status", SandboxStatus::Terminated.to_string())],
            )
            .await;

        let mut map = self.sandboxes.write().await;
        let mut loaded = 0;
        for mut sandbox in stored {
            if map.contains_key(&sandbox.id) {
                continue;
            }
            // Work in flight when the previous process died is gone.
            sandbox.status = match sandbox.status {
                SandboxStatus::Executing => SandboxStatus::Ready,
                SandboxStatus::Creating | SandboxStatus::Terminating => SandboxStatus::Error,
                other => other,
            };
            map.insert(sandbox.id.clone(), sandbox);
            loaded += 1;
        }
        if loaded > 0 {
            info!(loaded, "sandboxes hydrated from store");
        }
        loaded
    }

    pub async fn get(&self, sandbox_id: &str) -> Option<Sandbox> {
        let now = Utc::now();
        self.sandboxes
            .read()
            .await
            .get(sandbox_id)
            .map(|s| s.observed(now))
    }

    pub async fn list(&self) -> Vec<Sandbox> {
        let now = Utc::now();
        let mut all: Vec<Sandbox> = self
            .sandboxes
            .read()
            .await
            .values()
            .map(|s| s.observed(now))
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Add committed spend to the sandbox's running total.
    pub async fn record_spend(&self, sandbox_id: &str, amount: u64) {
        {
            let mut map = self.sandboxes.write().await;
            let Some(record) = map.get_mut(sandbox_id) else {
                return;
            };
            record.budget_spent = record.budget_spent.saturating_add(amount);
            self.persist(record);
        }
    }

    /// Callers hold the map write lock.
    fn persist(&self, sandbox: &Sandbox) {
        self.persister
            .write(collections::SANDBOXES, &sandbox.id, sandbox);
    }
}

fn expiry_after(from: DateTime<Utc>, days: u32) -> Option<DateTime<Utc>> {
    TimeDelta::try_days(i64::from(days)).and_then(|d| from.checked_add_signed(d))
}

fn placeholder(config: &SandboxConfig, budget_limit: u64) -> Sandbox {
    let now = Utc::now();
    Sandbox {
        id: config.sandbox_id.clone(),
        agent_id: config.agent_id.clone(),
        status: SandboxStatus::Creating,
        created_at: now,
        expires_at: now,
        last_execution_at: None,
        execution_count: 0,
        error_count: 0,
        backend: BackendKind::Primary,
        endpoint: String::new(),
        budget_spent: 0,
        budget_limit,
    }
}
