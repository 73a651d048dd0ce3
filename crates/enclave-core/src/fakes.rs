//! Scriptable execution backend (testing only)
//!
//! `ScriptedBackend` implements [`ExecutionBackend`] with switchable
//! behaviour and call counters, so lifecycle and fallback paths can be
//! driven without a network.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{BackendCall, BackendError, BackendKind, BackendOutput, ExecutionBackend};
use crate::registry::SandboxConfig;
use crate::sandbox::Sandbox;

/// How the next `execute` calls behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Exit 0 and echo the code.
    Succeed,
    /// Transport-level failure.
    Fail,
    /// Never answer.
    Hang,
    /// Answer with this exit code.
    Exit(i32),
    /// Sleep, then succeed.
    Delay(Duration),
}

#[derive(Debug)]
pub struct ScriptedBackend {
    kind: BackendKind,
    script: Mutex<Script>,
    provision_fails: AtomicBool,
    destroy_fails: AtomicBool,
    destroy_delay_ms: AtomicU64,
    provision_calls: AtomicUsize,
    execute_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    executed: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            script: Mutex::new(Script::Succeed),
            provision_fails: AtomicBool::new(false),
            destroy_fails: AtomicBool::new(false),
            destroy_delay_ms: AtomicU64::new(0),
            provision_calls: AtomicUsize::new(0),
            execute_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn set_provision_fails(&self, fails: bool) {
        self.provision_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_destroy_fails(&self, fails: bool) {
        self.destroy_fails.store(fails, Ordering::SeqCst);
    }

    /// Make `destroy` take this long before answering.
    pub fn set_destroy_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.destroy_delay_ms.store(ms, Ordering::SeqCst);
    }

    pub fn provision_calls(&self) -> usize {
        self.provision_calls.load(Ordering::SeqCst)
    }

    pub fn execute_calls(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    /// Highest number of `execute` calls observed running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Code of every `execute` call that started, in start order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn provision(&self, config: &SandboxConfig) -> Result<String, BackendError> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        if self.provision_fails.load(Ordering::SeqCst) {
            return Err(BackendError::Transport(format!("{} refused provision", self.kind)));
        }
        Ok(format!("mock://{}/{}", self.kind, config.sandbox_id))
    }

    async fn execute(
        &self,
        _sandbox: &Sandbox,
        call: &BackendCall,
    ) -> Result<BackendOutput, BackendError> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        self.executed.lock().unwrap().push(call.code.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let script = *self.script.lock().unwrap();
        match script {
            Script::Succeed => {}
            Script::Fail => {
                return Err(BackendError::Transport(format!("{} unreachable", self.kind)))
            }
            Script::Hang => std::future::pending::<()>().await,
            Script::Exit(code) => {
                return Ok(BackendOutput {
                    output: String::new(),
                    stdout: String::new(),
                    stderr: format!("exited with {code}"),
                    exit_code: code,
                })
            }
            Script::Delay(d) => tokio::time::sleep(d).await,
        }
        Ok(BackendOutput {
            output: format!("ran: {}", call.code),
            stdout: call.code.clone(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn destroy(&self, endpoint: &str) -> Result<(), BackendError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.destroy_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.destroy_fails.load(Ordering::SeqCst) {
            return Err(BackendError::Transport(format!("cannot delete {endpoint}")));
        }
        Ok(())
    }
}
