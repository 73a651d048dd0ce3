//! Ordered fallback over execution providers.
//!
//! Providers are tried in order, each call bounded by a timeout, with no
//! retries inside a provider. When every real provider fails the terminal
//! stub (if enabled) answers with a result tagged `provenance = stub` and
//! `degraded = true`.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{
    BackendCall, BackendError, BackendKind, BackendOutput, CircuitBreaker, ExecutionBackend,
    HttpBackend, StubBackend,
};
use crate::config::EnclaveConfig;
use crate::error::{EnclaveError, EnclaveResult};
use crate::registry::SandboxConfig;
use crate::sandbox::{ExecutionResult, Provenance, Sandbox};

struct Provider {
    backend: Arc<dyn ExecutionBackend>,
    breaker: CircuitBreaker,
}

pub struct BackendSelector {
    providers: Vec<Provider>,
    stub: Option<Arc<dyn ExecutionBackend>>,
    breaker_threshold: u32,
}

impl BackendSelector {
    /// Empty chain. Add providers in the order they should be tried.
    pub fn new(breaker_threshold: u32) -> Self {
        Self {
            providers: Vec::new(),
            stub: None,
            breaker_threshold,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.providers.push(Provider {
            backend,
            breaker: CircuitBreaker::new(self.breaker_threshold),
        });
        self
    }

    pub fn with_stub(mut self, stub: Arc<dyn ExecutionBackend>) -> Self {
        self.stub = Some(stub);
        self
    }

    /// Primary and secondary HTTP backends from config, plus the stub when
    /// `stub_fallback` is set.
    pub fn from_config(config: &EnclaveConfig) -> EnclaveResult<Self> {
        let mut selector = Self::new(config.breaker_threshold);
        for (kind, endpoint) in [
            (BackendKind::Primary, &config.primary),
            (BackendKind::Secondary, &config.secondary),
        ] {
            if let Some(endpoint) = endpoint {
                let backend = HttpBackend::new(kind, endpoint).map_err(|e| {
                    EnclaveError::InvalidConfig(format!("{kind} backend {}: {e}", endpoint.url))
                })?;
                selector = selector.with_backend(Arc::new(backend));
            }
        }
        if config.stub_fallback {
            selector = selector.with_stub(Arc::new(StubBackend::new()));
        }
        Ok(selector)
    }

    /// Kinds in the order they are tried.
    pub fn chain(&self) -> Vec<BackendKind> {
        self.providers
            .iter()
            .map(|p| p.backend.kind())
            .chain(self.stub.iter().map(|s| s.kind()))
            .collect()
    }

    /// Provision on the first real provider that accepts. Never degrades
    /// to the stub, unless the stub is the only provider configured.
    pub async fn provision(
        &self,
        config: &SandboxConfig,
        timeout: Duration,
    ) -> EnclaveResult<(BackendKind, String)> {
        let mut attempts = Vec::new();
        for p in &self.providers {
            let kind = p.backend.kind();
            if !p.breaker.allow() {
                attempts.push(format!("{kind}: circuit open"));
                continue;
            }
            match bounded(timeout, p.backend.provision(config)).await {
                Ok(endpoint) => {
                    p.breaker.record_success();
                    return Ok((kind, endpoint));
                }
                Err(e) => {
                    let failures = p.breaker.record_failure();
                    warn!(backend = %kind, sandbox_id = %config.sandbox_id, failures, error = %e, "provision failed");
                    attempts.push(format!("{kind}: {e}"));
                }
            }
        }

        if self.providers.is_empty() {
            if let Some(stub) = &self.stub {
                debug!(sandbox_id = %config.sandbox_id, "no real backends configured, binding to stub");
                if let Ok(endpoint) = bounded(timeout, stub.provision(config)).await {
                    return Ok((BackendKind::Stub, endpoint));
                }
            }
        }

        Err(EnclaveError::BackendUnavailable {
            sandbox_id: config.sandbox_id.clone(),
            attempts,
        })
    }

    /// Run `call` through the chain. Each provider gets `call.timeout_secs`.
    pub async fn execute(
        &self,
        sandbox: &Sandbox,
        call: &BackendCall,
    ) -> EnclaveResult<ExecutionResult> {
        let started = Instant::now();
        let timeout = Duration::from_secs(call.timeout_secs);
        let mut attempts = Vec::new();

        for p in &self.providers {
            let kind = p.backend.kind();
            if !p.breaker.allow() {
                attempts.push(format!(
                    "{kind}: {}",
                    BackendError::CircuitOpen(p.breaker.failure_count())
                ));
                continue;
            }
            match bounded(timeout, p.backend.execute(sandbox, call)).await {
                Ok(out) => {
                    p.breaker.record_success();
                    return Ok(to_result(out, kind, started));
                }
                Err(e) => {
                    let failures = p.breaker.record_failure();
                    warn!(backend = %kind, sandbox_id = %sandbox.id, failures, error = %e, "execution failed, trying next backend");
                    attempts.push(format!("{kind}: {e}"));
                }
            }
        }

        if let Some(stub) = &self.stub {
            if !self.providers.is_empty() {
                warn!(sandbox_id = %sandbox.id, attempts = ?attempts, "all backends failed, degrading to stub");
            }
            match bounded(timeout, stub.execute(sandbox, call)).await {
                Ok(out) => return Ok(to_result(out, BackendKind::Stub, started)),
                Err(e) => attempts.push(format!("stub: {e}")),
            }
        }

        Err(EnclaveError::BackendUnavailable {
            sandbox_id: sandbox.id.clone(),
            attempts,
        })
    }

    /// Best-effort cleanup on the provider that owns the sandbox.
    pub async fn destroy(&self, sandbox: &Sandbox, timeout: Duration) -> Result<(), BackendError> {
        let owner = self
            .providers
            .iter()
            .map(|p| &p.backend)
            .chain(self.stub.iter())
            .find(|b| b.kind() == sandbox.backend);
        match owner {
            Some(backend) => bounded(timeout, backend.destroy(&sandbox.endpoint)).await,
            None => Ok(()),
        }
    }
}

async fn bounded<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(BackendError::Timeout(timeout)),
    }
}

fn to_result(out: BackendOutput, kind: BackendKind, started: Instant) -> ExecutionResult {
    ExecutionResult {
        success: out.exit_code == 0,
        output: out.output,
        stdout: out.stdout,
        stderr: out.stderr,
        exit_code: out.exit_code,
        execution_time_ms: started.elapsed().as_millis() as u64,
        provenance: Provenance::from(kind),
        degraded: kind == BackendKind::Stub,
        denial: None,
    }
}
