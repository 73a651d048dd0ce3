use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{BackendCall, BackendError, BackendKind, BackendOutput, ExecutionBackend};
use crate::registry::SandboxConfig;
use crate::sandbox::Sandbox;

/// Terminal provider: never fails, never runs anything.
///
/// The output is a pure function of the submitted code, so repeated calls
/// agree, and it is marked so nobody mistakes it for a real run.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubBackend;

impl StubBackend {
    pub fn new() -> Self {
        Self
    }

    pub fn digest(code: &str) -> String {
        hex::encode(Sha256::digest(code.as_bytes()))
    }
}

#[async_trait]
impl ExecutionBackend for StubBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Stub
    }

    async fn provision(&self, config: &SandboxConfig) -> Result<String, BackendError> {
        Ok(format!("stub://{}", config.sandbox_id))
    }

    async fn execute(
        &self,
        _sandbox: &Sandbox,
        call: &BackendCall,
    ) -> Result<BackendOutput, BackendError> {
        let digest = Self::digest(&call.code);
        Ok(BackendOutput {
            output: format!("[stub] {} sha256:{}", call.language, digest),
            stdout: String::new(),
            stderr: "no execution backend reachable; stub result".to_string(),
            exit_code: 0,
        })
    }
}
