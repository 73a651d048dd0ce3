//! Agent catalog: the static `SandboxConfig` entries sandboxes are deployed from.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Memory / CPU limits requested from the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u32,
    /// CPU in millicores (1000 = one core).
    pub cpu_millis: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_millis: 1000,
        }
    }
}

/// Immutable deployment description for one agent's sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub agent_id: String,
    pub sandbox_id: String,
    pub ttl_days: u32,
    /// Credits reserved for each task this agent runs.
    pub budget_per_task: u64,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub packages: Vec<String>,
}

impl SandboxConfig {
    /// Minimal config with `sandbox_id = "sbx-<agent_id>"`.
    pub fn new(agent_id: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self {
            sandbox_id: format!("sbx-{agent_id}"),
            agent_id,
            ttl_days: 7,
            budget_per_task: 5,
            capabilities: Vec::new(),
            limits: ResourceLimits::default(),
            packages: Vec::new(),
        }
    }

    pub fn with_ttl_days(mut self, days: u32) -> Self {
        self.ttl_days = days;
        self
    }

    pub fn with_budget_per_task(mut self, credits: u64) -> Self {
        self.budget_per_task = credits;
        self
    }

    pub fn with_capabilities(mut self, caps: &[&str]) -> Self {
        self.capabilities = caps.iter().map(|c| (*c).to_string()).collect();
        self
    }

    pub fn with_limits(mut self, memory_mb: u32, cpu_millis: u32) -> Self {
        self.limits = ResourceLimits {
            memory_mb,
            cpu_millis,
        };
        self
    }

    pub fn with_packages(mut self, packages: &[&str]) -> Self {
        self.packages = packages.iter().map(|p| (*p).to_string()).collect();
        self
    }
}

/// Lookup table of agent sandbox configs, ordered by agent id.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, SandboxConfig>,
}

impl AgentRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: impl IntoIterator<Item = SandboxConfig>) -> Self {
        let mut reg = Self::empty();
        for cfg in configs {
            reg.register(cfg);
        }
        reg
    }

    /// Insert or replace the config for `config.agent_id`.
    pub fn register(&mut self, config: SandboxConfig) {
        self.agents.insert(config.agent_id.clone(), config);
    }

    pub fn get(&self, agent_id: &str) -> Option<&SandboxConfig> {
        self.agents.get(agent_id)
    }

    /// Find the config that owns `sandbox_id`.
    pub fn by_sandbox(&self, sandbox_id: &str) -> Option<&SandboxConfig> {
        self.agents.values().find(|c| c.sandbox_id == sandbox_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SandboxConfig> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// The built-in agent catalog.
    ///
    /// | Agent        | TTL | Per task | Memory | CPU  |
    /// |--------------|-----|----------|--------|------|
    /// | orchestrator | 30  | 2        | 1024   | 1000 |
    /// | engineer     | 7   | 10       | 2048   | 2000 |
    /// | designer     | 7   | 5        | 1024   | 1000 |
    /// | finance      | 14  | 3        | 1024   | 1000 |
    /// | operations   | 14  | 4        | 512    | 1000 |
    /// | product      | 7   | 4        | 512    | 500  |
    /// | research     | 3   | 15       | 4096   | 2000 |
    pub fn builtin() -> Self {
        Self::from_configs([
            SandboxConfig::new("orchestrator")
                .with_ttl_days(30)
                .with_budget_per_task(2)
                .with_capabilities(&["intent-routing", "delegation", "budget-ledger"])
                .with_limits(1024, 1000)
                .with_packages(&["requests"]),
            SandboxConfig::new("engineer")
                .with_budget_per_task(10)
                .with_capabilities(&["code-review", "deployment", "ci-cd", "git"])
                .with_limits(2048, 2000)
                .with_packages(&["requests", "pytest"]),
            SandboxConfig::new("designer")
                .with_budget_per_task(5)
                .with_capabilities(&["content-creation", "branding", "ui-design"])
                .with_limits(1024, 1000)
                .with_packages(&["pillow"]),
            SandboxConfig::new("finance")
                .with_ttl_days(14)
                .with_budget_per_task(3)
                .with_capabilities(&["budget-tracking", "forecasting", "audit"])
                .with_limits(1024, 1000)
                .with_packages(&["pandas"]),
            SandboxConfig::new("operations")
                .with_ttl_days(14)
                .with_budget_per_task(4)
                .with_capabilities(&["workflow-automation", "process-optimization"]),
            SandboxConfig::new("product")
                .with_budget_per_task(4)
                .with_capabilities(&["product-specs", "user-research"])
                .with_limits(512, 500),
            SandboxConfig::new("research")
                .with_ttl_days(3)
                .with_budget_per_task(15)
                .with_capabilities(&["chunking", "aggregation", "deep-analysis"])
                .with_limits(4096, 2000)
                .with_packages(&["numpy", "pandas"]),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let reg = AgentRegistry::builtin();
        assert_eq!(reg.len(), 7);
        let eng = reg.get("engineer").unwrap();
        assert_eq!(eng.sandbox_id, "sbx-engineer");
        assert_eq!(eng.budget_per_task, 10);
        assert!(eng.capabilities.contains(&"git".to_string()));
    }

    #[test]
    fn test_lookup_by_sandbox() {
        let reg = AgentRegistry::builtin();
        assert_eq!(reg.by_sandbox("sbx-research").unwrap().agent_id, "research");
        assert!(reg.by_sandbox("sbx-nobody").is_none());
    }

    #[test]
    fn test_register_replaces() {
        let mut reg = AgentRegistry::empty();
        reg.register(SandboxConfig::new("writer"));
        reg.register(SandboxConfig::new("writer").with_ttl_days(1));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("writer").unwrap().ttl_days, 1);
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let cfg: SandboxConfig = serde_json::from_value(serde_json::json!({
            "agent_id": "writer",
            "sandbox_id": "sbx-writer",
            "ttl_days": 2,
            "budget_per_task": 7
        }))
        .unwrap();
        assert!(cfg.capabilities.is_empty());
        assert_eq!(cfg.limits, ResourceLimits::default());
    }
}
