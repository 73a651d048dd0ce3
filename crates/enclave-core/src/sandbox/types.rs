use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;

/// Exit code carried by a result whose code was refused by escape screening.
/// Negative, so it cannot collide with a real process exit status.
pub const POLICY_VIOLATION_EXIT_CODE: i32 = -403;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Ready,
    Executing,
    Error,
    Terminating,
    Terminated,
    /// Read-side view of a `Ready` sandbox past its `expires_at`. Never
    /// stored; the sweep moves such sandboxes to `Terminated`.
    Expired,
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxStatus::Creating => "creating",
            SandboxStatus::Ready => "ready",
            SandboxStatus::Executing => "executing",
            SandboxStatus::Error => "error",
            SandboxStatus::Terminating => "terminating",
            SandboxStatus::Terminated => "terminated",
            SandboxStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Where an [`ExecutionResult`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Primary,
    Secondary,
    /// Deterministic placeholder; nothing actually ran.
    Stub,
    /// Refused by escape screening; nothing ran.
    PolicyDenied,
}

impl From<BackendKind> for Provenance {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Primary => Provenance::Primary,
            BackendKind::Secondary => Provenance::Secondary,
            BackendKind::Stub => Provenance::Stub,
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Provenance::Primary => "primary",
            Provenance::Secondary => "secondary",
            Provenance::Stub => "stub",
            Provenance::PolicyDenied => "policy_denied",
        };
        f.write_str(s)
    }
}

/// A live (or recently retired) execution context bound to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    pub agent_id: String,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub last_execution_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_count: u64,
    #[serde(default)]
    pub error_count: u64,
    pub backend: BackendKind,
    pub endpoint: String,
    #[serde(default)]
    pub budget_spent: u64,
    #[serde(default)]
    pub budget_limit: u64,
}

impl Sandbox {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Status as callers should see it: `Ready` past expiry reads as `Expired`.
    pub fn observed_status(&self, now: DateTime<Utc>) -> SandboxStatus {
        if self.status == SandboxStatus::Ready && self.is_expired(now) {
            SandboxStatus::Expired
        } else {
            self.status
        }
    }

    /// Ready and within its TTL.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.observed_status(now) == SandboxStatus::Ready
    }

    /// Snapshot with `status` replaced by [`Self::observed_status`].
    pub fn observed(&self, now: DateTime<Utc>) -> Sandbox {
        let mut view = self.clone();
        view.status = self.observed_status(now);
        view
    }
}

fn default_language() -> String {
    "python".to_string()
}

fn default_actor() -> String {
    "anonymous".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub sandbox_id: String,
    pub code: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// Per-provider bound; the configured default applies when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Who is asking; recorded in the audit log.
    #[serde(default = "default_actor")]
    pub actor: String,
}

impl ExecutionRequest {
    pub fn new(sandbox_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            code: code.into(),
            language: default_language(),
            timeout_secs: None,
            env: BTreeMap::new(),
            actor: default_actor(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub execution_time_ms: u64,
    pub provenance: Provenance,
    /// Set when the result did not come from a real backend run.
    pub degraded: bool,
    /// What the security gate matched, for refused code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denial: Option<PolicyDenial>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDenial {
    pub severity: String,
    pub patterns: Vec<String>,
}

impl ExecutionResult {
    /// Result returned for code refused before reaching any backend.
    pub fn policy_denied(severity: &str, patterns: &[String]) -> Self {
        Self {
            success: false,
            output: String::new(),
            stdout: String::new(),
            stderr: format!(
                "execution refused ({severity}): matched {}",
                patterns.join(", ")
            ),
            exit_code: POLICY_VIOLATION_EXIT_CODE,
            execution_time_ms: 0,
            provenance: Provenance::PolicyDenied,
            degraded: false,
            denial: Some(PolicyDenial {
                severity: severity.to_string(),
                patterns: patterns.to_vec(),
            }),
        }
    }

    pub fn is_policy_denial(&self) -> bool {
        self.provenance == Provenance::PolicyDenied
    }

    /// Succeeded on a real backend (not the stub, not a denial).
    pub fn is_genuine_success(&self) -> bool {
        self.success && matches!(self.provenance, Provenance::Primary | Provenance::Secondary)
    }
}
