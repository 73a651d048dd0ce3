//! Error types for the Enclave core.

use thiserror::Error;

use enclave_state::StorageError;

/// Errors produced by sandbox, budget, security and scheduling operations.
#[derive(Debug, Error)]
pub enum EnclaveError {
    /// Unknown sandbox, agent, task or reservation id.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The sandbox exists but cannot accept work right now (busy, expired,
    /// terminating, errored or still being created).
    #[error("sandbox {sandbox_id} is not ready (status: {status})")]
    NotReady { sandbox_id: String, status: String },

    /// A spend or reservation exceeded the agent's remaining funds.
    #[error("budget exceeded for agent {agent_id}: requested {requested}, available {available}")]
    BudgetExceeded {
        agent_id: String,
        requested: u64,
        available: u64,
    },

    /// A commit or rollback did not match an outstanding reservation.
    #[error("overcommit for agent {agent_id} task {task_id}: requested {requested}, reserved {reserved}")]
    Overcommit {
        agent_id: String,
        task_id: String,
        requested: u64,
        reserved: u64,
    },

    /// Submitted code matched one or more escape rules; nothing was executed.
    #[error("security violation ({severity}): matched {patterns:?}")]
    SecurityViolation {
        severity: String,
        patterns: Vec<String>,
    },

    /// Every backend in the chain failed (and the stub, if any, was disabled).
    #[error("no backend available for sandbox {sandbox_id}: {attempts:?}")]
    BackendUnavailable {
        sandbox_id: String,
        attempts: Vec<String>,
    },

    /// The code ran but exited non-zero.
    #[error("execution in sandbox {sandbox_id} exited with {exit_code}: {stderr}")]
    ExecutionFailed {
        sandbox_id: String,
        exit_code: i32,
        stderr: String,
    },

    /// The blueprint stalled: these tasks never had their dependencies met.
    #[error("circular or unsatisfiable dependencies among tasks: {tasks:?}")]
    CircularDependency { tasks: Vec<String> },

    /// The blueprint itself is malformed (e.g. duplicate task ids).
    #[error("invalid blueprint: {0}")]
    InvalidBlueprint(String),

    /// A caller-supplied argument was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid runtime configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A storage / persistence layer error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl EnclaveError {
    pub(crate) fn sandbox_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "sandbox",
            id: id.into(),
        }
    }

    pub(crate) fn agent_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "agent",
            id: id.into(),
        }
    }
}

/// Convenience result alias.
pub type EnclaveResult<T> = std::result::Result<T, EnclaveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_displays_kind_and_id() {
        let err = EnclaveError::sandbox_not_found("sb-missing");
        let msg = err.to_string();
        assert!(msg.contains("sandbox"));
        assert!(msg.contains("sb-missing"));
    }

    #[test]
    fn test_budget_exceeded_displays_amounts() {
        let err = EnclaveError::BudgetExceeded {
            agent_id: "writer".into(),
            requested: 70,
            available: 60,
        };
        let msg = err.to_string();
        assert!(msg.contains("writer"));
        assert!(msg.contains("70"));
        assert!(msg.contains("60"));
    }

    #[test]
    fn test_circular_dependency_lists_tasks() {
        let err = EnclaveError::CircularDependency {
            tasks: vec!["a".into(), "b".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("\"a\""));
        assert!(msg.contains("\"b\""));
    }

    #[test]
    fn test_storage_error_converts() {
        let err: EnclaveError = StorageError::Unavailable("down".into()).into();
        assert!(matches!(err, EnclaveError::Storage(_)));
    }
}
