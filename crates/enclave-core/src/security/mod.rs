//! Pre-execution escape screening.
//!
//! Code that matches any escape rule never reaches a backend. Every decision,
//! allow or deny, is appended to the audit trail; audit failures are logged
//! and dropped.

mod rules;

pub use rules::{Detection, EscapeRule, EscapeRuleSet, Severity};

use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, warn};

use enclave_state::{AuditDecision, AuditRecord, AuditSink};

use crate::error::{EnclaveError, EnclaveResult};
use crate::obs::emit_security_decision;
use crate::sandbox::{ExecutionRequest, ExecutionResult, SandboxManager};

const EXECUTE_ACTION: &str = "sandbox.execute";

pub struct SecurityGate {
    rules: EscapeRuleSet,
    audit: Arc<dyn AuditSink>,
    audit_timeout: Duration,
    manager: Arc<SandboxManager>,
}

impl SecurityGate {
    pub fn new(
        rules: EscapeRuleSet,
        audit: Arc<dyn AuditSink>,
        audit_timeout: Duration,
        manager: Arc<SandboxManager>,
    ) -> Self {
        Self {
            rules,
            audit,
            audit_timeout,
            manager,
        }
    }

    pub fn detect(&self, code: &str) -> Detection {
        self.rules.detect(code)
    }

    /// `Err(SecurityViolation)` if `code` matches any rule.
    pub fn screen(&self, code: &str) -> EnclaveResult<()> {
        let detection = self.detect(code);
        if !detection.detected {
            return Ok(());
        }
        Err(EnclaveError::SecurityViolation {
            severity: detection
                .severity
                .map(|s| s.to_string())
                .unwrap_or_default(),
            patterns: detection.matched_patterns,
        })
    }

    /// Screen, audit, then execute. A denial is returned as a result with
    /// [`crate::sandbox::POLICY_VIOLATION_EXIT_CODE`], not as an error.
    #[instrument(skip(self, request), fields(sandbox_id = %request.sandbox_id, actor = %request.actor))]
    pub async fn secure_execute(&self, request: &ExecutionRequest) -> EnclaveResult<ExecutionResult> {
        let detection = self.detect(&request.code);
        let severity = detection.severity.map(|s| s.to_string());
        emit_security_decision(&request.sandbox_id, !detection.detected, severity.as_deref());

        if detection.detected {
            let mut record = AuditRecord::new(
                &request.actor,
                EXECUTE_ACTION,
                &request.sandbox_id,
                AuditDecision::Deny,
            );
            record.matched_patterns = detection.matched_patterns.clone();
            record.severity = severity.clone();
            self.append_audit(record).await;
            return Ok(ExecutionResult::policy_denied(
                severity.as_deref().unwrap_or("unknown"),
                &detection.matched_patterns,
            ));
        }

        self.append_audit(AuditRecord::new(
            &request.actor,
            EXECUTE_ACTION,
            &request.sandbox_id,
            AuditDecision::Allow,
        ))
        .await;
        self.manager.execute(request).await
    }

    async fn append_audit(&self, record: AuditRecord) {
        let id = record.id.clone();
        match tokio::time::timeout(self.audit_timeout, self.audit.append(record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(audit_id = %id, error = %e, "audit append failed"),
            Err(_) => warn!(audit_id = %id, "audit append timed out"),
        }
    }
}
