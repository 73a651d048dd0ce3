//! Execution backends and the fallback chain that drives them.

mod breaker;
mod http;
mod selector;
mod stub;

pub use breaker::CircuitBreaker;
pub use http::HttpBackend;
pub use selector::BackendSelector;
pub use stub::StubBackend;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::SandboxConfig;
use crate::sandbox::Sandbox;

/// Position of a backend in the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Primary,
    Secondary,
    Stub,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendKind::Primary => "primary",
            BackendKind::Secondary => "secondary",
            BackendKind::Stub => "stub",
        };
        f.write_str(s)
    }
}

/// A single provider failure. Any of these moves the chain to the next
/// provider.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("circuit open after {0} consecutive failures")]
    CircuitOpen(u32),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Transport(err.to_string())
    }
}

/// What a backend is asked to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCall {
    pub code: String,
    pub language: String,
    pub timeout_secs: u64,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Raw output of a backend run. A non-zero `exit_code` is a handled
/// failure of the submitted code, not of the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendOutput {
    pub output: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Create the remote sandbox; returns its endpoint.
    async fn provision(&self, config: &SandboxConfig) -> Result<String, BackendError>;

    async fn execute(
        &self,
        sandbox: &Sandbox,
        call: &BackendCall,
    ) -> Result<BackendOutput, BackendError>;

    /// Best-effort cleanup of a provisioned sandbox.
    async fn destroy(&self, _endpoint: &str) -> Result<(), BackendError> {
        Ok(())
    }
}
