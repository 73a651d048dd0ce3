//! Dependency-ordered execution of task graphs ("blueprints").

mod blueprint;
mod runner;

pub use blueprint::BlueprintExecutor;
pub use runner::SandboxTaskRunner;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EnclaveResult;

/// One node of a blueprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    /// `"<agent_id>"` or `"<agent_id>.<tool>"`.
    pub tool: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl TaskNode {
    pub fn new(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            params: Value::Null,
            dependencies: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| (*d).to_string()).collect();
        self
    }
}

/// Per-task record in a [`BlueprintOutcome`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskArtifact {
    pub task_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlueprintOutcome {
    /// `true` iff `errors` is empty.
    pub success: bool,
    pub artifacts: Vec<TaskArtifact>,
    pub errors: Vec<String>,
    /// Task ids in completion order.
    pub completed: Vec<String>,
    pub waves: usize,
}

impl BlueprintOutcome {
    pub fn artifact(&self, task_id: &str) -> Option<&TaskArtifact> {
        self.artifacts.iter().find(|a| a.task_id == task_id)
    }
}

/// Runs a single task on behalf of the executor.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &TaskNode) -> EnclaveResult<Value>;

    /// Tasks of one wave that share a lane run one after another; distinct
    /// lanes run concurrently.
    fn lane(&self, task: &TaskNode) -> String {
        task.id.clone()
    }
}
