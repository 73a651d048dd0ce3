//! Structured observability hooks for sandbox, budget and blueprint events.
//!
//! Events are emitted at `info!` level except where noted; filter with
//! `RUST_LOG` (e.g. `RUST_LOG=enclave_core=debug`).

use tracing::{info, warn};

/// RAII guard that enters a sandbox-scoped tracing span.
///
/// ```ignore
/// let _span = SandboxSpan::enter("sbx-engineer");
/// // every event emitted here carries sandbox_id = "sbx-engineer"
/// ```
pub struct SandboxSpan {
    _span: tracing::span::EnteredSpan,
}

impl SandboxSpan {
    pub fn enter(sandbox_id: &str) -> Self {
        let span = tracing::info_span!("enclave.sandbox", sandbox_id = %sandbox_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: sandbox deployed (or reused) on a backend.
pub fn emit_sandbox_deployed(sandbox_id: &str, backend: &str, reused: bool) {
    info!(
        event = "sandbox.deployed",
        sandbox_id = %sandbox_id,
        backend = %backend,
        reused = reused,
    );
}

/// Emit event: one execute() call finished.
pub fn emit_sandbox_executed(
    sandbox_id: &str,
    provenance: &str,
    success: bool,
    exit_code: i32,
    duration_ms: u64,
) {
    info!(
        event = "sandbox.executed",
        sandbox_id = %sandbox_id,
        provenance = %provenance,
        success = success,
        exit_code = exit_code,
        duration_ms = duration_ms,
    );
}

/// Emit event: sandbox reached `terminated`.
pub fn emit_sandbox_terminated(sandbox_id: &str, reason: &str) {
    info!(event = "sandbox.terminated", sandbox_id = %sandbox_id, reason = %reason);
}

/// Emit event: sandbox found past its TTL by the sweep.
pub fn emit_sandbox_expired(sandbox_id: &str, expired_for_secs: i64) {
    info!(
        event = "sandbox.expired",
        sandbox_id = %sandbox_id,
        expired_for_secs = expired_for_secs,
    );
}

/// Emit event: a ledger transaction was appended.
pub fn emit_budget_transaction(agent_id: &str, kind: &str, amount: u64, task_id: &str) {
    info!(
        event = "budget.transaction",
        agent_id = %agent_id,
        kind = %kind,
        amount = amount,
        task_id = %task_id,
    );
}

/// Emit event: escape screening decision (warn level on deny).
pub fn emit_security_decision(resource: &str, allowed: bool, severity: Option<&str>) {
    if allowed {
        info!(event = "security.decision", resource = %resource, decision = "allow");
    } else {
        warn!(
            event = "security.decision",
            resource = %resource,
            decision = "deny",
            severity = severity.unwrap_or("none"),
        );
    }
}

/// Emit event: blueprint finished.
pub fn emit_blueprint_finished(total: usize, completed: usize, errors: usize) {
    info!(
        event = "blueprint.finished",
        total = total,
        completed = completed,
        errors = errors,
    );
}

/// Emit event: a persistence write was deferred (warning level).
pub fn emit_persist_deferred(collection: &str, key: &str, error: &dyn std::fmt::Display) {
    warn!(event = "persist.deferred", collection = %collection, key = %key, error = %error);
}
