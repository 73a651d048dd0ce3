//! Sandbox records and their lifecycle.

mod manager;
mod types;

pub use manager::SandboxManager;
pub use types::{
    ExecutionRequest, ExecutionResult, PolicyDenial, Provenance, Sandbox, SandboxStatus,
    POLICY_VIOLATION_EXIT_CODE,
};
