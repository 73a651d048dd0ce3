//! Enclave Core Library
//!
//! Persistent execution sandboxes for agents: lifecycle with TTL expiry,
//! per-agent budget ledgers, escape screening ahead of every execution, a
//! primary/secondary/stub backend fallback chain and a wavefront scheduler
//! for dependency-ordered task graphs.

pub mod backend;
pub mod budget;
pub mod config;
pub mod delegation;
pub mod error;
pub mod fakes;
pub mod obs;
pub mod persist;
pub mod registry;
pub mod runtime;
pub mod sandbox;
pub mod scheduler;
pub mod security;
pub mod telemetry;

pub use backend::{
    BackendCall, BackendError, BackendKind, BackendOutput, BackendSelector, CircuitBreaker,
    ExecutionBackend, HttpBackend, StubBackend,
};
pub use budget::{BudgetLedger, BudgetManager, BudgetTransaction, TransactionKind};
pub use config::{BackendEndpoint, EnclaveConfig};
pub use delegation::DelegationBoard;
pub use error::{EnclaveError, EnclaveResult};
pub use registry::{AgentRegistry, ResourceLimits, SandboxConfig};
pub use runtime::{DeployOutcome, SandboxRuntime, SweepReport};
pub use sandbox::{
    ExecutionRequest, ExecutionResult, PolicyDenial, Provenance, Sandbox, SandboxManager,
    SandboxStatus, POLICY_VIOLATION_EXIT_CODE,
};
pub use scheduler::{
    BlueprintExecutor, BlueprintOutcome, SandboxTaskRunner, TaskArtifact, TaskNode, TaskRunner,
};
pub use security::{Detection, EscapeRule, EscapeRuleSet, SecurityGate, Severity};

/// Crate version, for the daemon's `--version` and startup log.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
