//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config file.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EnclaveError, EnclaveResult};
use crate::registry::{AgentRegistry, SandboxConfig};

/// Upper bound for `reservation_ttl_secs` (one year).
pub const MAX_RESERVATION_TTL_SECS: u64 = 366 * 24 * 60 * 60;

/// One remote execution backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendEndpoint {
    /// Base URL, e.g. `https://exec.internal:8443`.
    pub url: String,
    /// Optional bearer token sent with every request.
    #[serde(default)]
    pub token: Option<String>,
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnclaveConfig {
    /// Initial allocation for ledgers without an explicit override.
    pub default_budget: u64,
    /// Per-agent initial allocations.
    pub budgets: HashMap<String, u64>,
    /// Bound applied to a backend call when the request carries none.
    pub default_timeout_secs: u64,
    pub deploy_timeout_secs: u64,
    /// Bound applied to every state store call.
    pub store_timeout_ms: u64,
    pub sweep_interval_secs: u64,
    /// Reservations older than this are rolled back by the sweep.
    pub reservation_ttl_secs: u64,
    /// Degrade to the deterministic stub when every real backend fails.
    pub stub_fallback: bool,
    /// Consecutive failures before a backend's breaker opens.
    pub breaker_threshold: u32,
    pub max_concurrent_tasks: usize,
    pub primary: Option<BackendEndpoint>,
    pub secondary: Option<BackendEndpoint>,
    /// Replaces the built-in agent catalog when present.
    pub agents: Option<Vec<SandboxConfig>>,
}

impl Default for EnclaveConfig {
    fn default() -> Self {
        Self {
            default_budget: 100,
            budgets: HashMap::new(),
            default_timeout_secs: 30,
            deploy_timeout_secs: 60,
            store_timeout_ms: 2_000,
            sweep_interval_secs: 300,
            reservation_ttl_secs: 3_600,
            stub_fallback: true,
            breaker_threshold: 5,
            max_concurrent_tasks: 4,
            primary: None,
            secondary: None,
            agents: None,
        }
    }
}

impl EnclaveConfig {
    /// Load and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> EnclaveResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EnclaveError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            EnclaveError::InvalidConfig(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EnclaveResult<()> {
        if self.default_timeout_secs == 0 {
            return Err(EnclaveError::InvalidConfig(
                "default_timeout_secs must be > 0".into(),
            ));
        }
        if self.deploy_timeout_secs == 0 {
            return Err(EnclaveError::InvalidConfig(
                "deploy_timeout_secs must be > 0".into(),
            ));
        }
        if self.store_timeout_ms == 0 {
            return Err(EnclaveError::InvalidConfig(
                "store_timeout_ms must be > 0".into(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(EnclaveError::InvalidConfig(
                "sweep_interval_secs must be > 0".into(),
            ));
        }
        if self.reservation_ttl_secs == 0 || self.reservation_ttl_secs > MAX_RESERVATION_TTL_SECS {
            return Err(EnclaveError::InvalidConfig(format!(
                "reservation_ttl_secs must be in 1..={MAX_RESERVATION_TTL_SECS}"
            )));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(EnclaveError::InvalidConfig(
                "max_concurrent_tasks must be > 0".into(),
            ));
        }
        if self.breaker_threshold == 0 {
            return Err(EnclaveError::InvalidConfig(
                "breaker_threshold must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Agent catalog: the configured list, or the built-in one.
    pub fn registry(&self) -> AgentRegistry {
        match &self.agents {
            Some(list) => AgentRegistry::from_configs(list.iter().cloned()),
            None => AgentRegistry::builtin(),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Clamped to [`MAX_RESERVATION_TTL_SECS`] for configs built in code
    /// without `validate`.
    pub fn reservation_ttl(&self) -> chrono::TimeDelta {
        let secs = self.reservation_ttl_secs.min(MAX_RESERVATION_TTL_SECS);
        i64::try_from(secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .unwrap_or(chrono::TimeDelta::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = EnclaveConfig::default();
        assert_eq!(cfg.default_budget, 100);
        assert_eq!(cfg.default_timeout(), Duration::from_secs(30));
        assert!(cfg.stub_fallback);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.registry().len(), AgentRegistry::builtin().len());
    }

    #[test]
    fn test_empty_object_is_valid() {
        let cfg: EnclaveConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, EnclaveConfig::default());
    }

    #[test]
    fn test_from_file_with_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "default_budget": 250,
                "budgets": {{"writer": 100}},
                "stub_fallback": false,
                "primary": {{"url": "http://127.0.0.1:9000"}},
                "agents": [{{"agent_id": "writer", "sandbox_id": "sbx-writer", "ttl_days": 1, "budget_per_task": 10}}]
            }}"#
        )
        .unwrap();

        let cfg = EnclaveConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.default_budget, 250);
        assert_eq!(cfg.budgets["writer"], 100);
        assert!(!cfg.stub_fallback);
        assert_eq!(cfg.primary.unwrap().url, "http://127.0.0.1:9000");
        let reg = EnclaveConfig::from_file(file.path()).unwrap().registry();
        assert_eq!(reg.len(), 1);
        assert!(reg.get("writer").is_some());
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_concurrent_tasks": 0}}"#).unwrap();
        let err = EnclaveConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, EnclaveError::InvalidConfig(_)));
    }

    #[test]
    fn test_zero_sweep_interval_is_rejected() {
        let cfg = EnclaveConfig {
            sweep_interval_secs: 0,
            ..EnclaveConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("sweep_interval_secs"));
    }

    #[test]
    fn test_reservation_ttl_is_bounded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"reservation_ttl_secs": {}}}"#, u64::MAX).unwrap();
        let err = EnclaveConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("reservation_ttl_secs"));

        let unchecked = EnclaveConfig {
            reservation_ttl_secs: u64::MAX,
            ..EnclaveConfig::default()
        };
        assert_eq!(
            unchecked.reservation_ttl(),
            chrono::TimeDelta::seconds(MAX_RESERVATION_TTL_SECS as i64)
        );
        assert_eq!(
            EnclaveConfig::default().reservation_ttl(),
            chrono::TimeDelta::hours(1)
        );
    }

    #[test]
    fn test_from_file_missing() {
        let err = EnclaveConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }
}
