//! Engine configuration.
//!
//! Loaded from a YAML or JSON file, then overridden by `OPFLOW_*`
//! environment variables.

use std::path::Path;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::workflow::parser::load_value;

pub const ENV_MAX_PARALLEL: &str = "OPFLOW_MAX_PARALLEL";
pub const ENV_RATE_LIMIT_RETRY_CAP: &str = "OPFLOW_RATE_LIMIT_RETRY_CAP";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on concurrently running steps of one batch
    pub max_parallel: usize,

    /// Retries granted to `rate_limited` responses, independent of strategy
    pub rate_limit_retry_cap: u32,

    /// Deepest allowed chain of nested sub-workflows
    pub max_workflow_depth: usize,

    /// Promote validation warnings to errors before running
    pub strict: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: num_cpus::get(),
            rate_limit_retry_cap: 5,
            max_workflow_depth: 8,
            strict: false,
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let value = load_value(path)?;
        let config: Self = serde_json::from_value(value).map_err(|e| EngineError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        debug!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Applies overrides from the process environment.
    pub fn apply_env(self) -> Self {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup(ENV_MAX_PARALLEL) {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => self.max_parallel = n,
                _ => warn!("Ignoring invalid {}: '{}'", ENV_MAX_PARALLEL, raw),
            }
        }
        if let Some(raw) = lookup(ENV_RATE_LIMIT_RETRY_CAP) {
            match raw.parse::<u32>() {
                Ok(n) => self.rate_limit_retry_cap = n,
                Err(_) => warn!("Ignoring invalid {}: '{}'", ENV_RATE_LIMIT_RETRY_CAP, raw),
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.max_parallel >= 1);
        assert_eq!(config.rate_limit_retry_cap, 5);
        assert_eq!(config.max_workflow_depth, 8);
    }

    #[test]
    fn test_load_partial_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("opflow.yaml");
        fs::write(&path, "max_parallel: 3\nstrict: true\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.max_parallel, 3);
        assert!(config.strict);
        assert_eq!(config.rate_limit_retry_cap, 5);
    }

    #[test]
    fn test_load_rejects_unknown_types() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("opflow.json");
        fs::write(&path, r#"{ "max_parallel": "many" }"#).unwrap();

        assert!(matches!(EngineConfig::load(&path), Err(EngineError::Parse { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [(ENV_MAX_PARALLEL, "2"), (ENV_RATE_LIMIT_RETRY_CAP, "nope")]
            .into_iter()
            .collect();
        let config = EngineConfig::default().apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.max_parallel, 2);
        assert_eq!(config.rate_limit_retry_cap, 5);
    }

    #[test]
    fn test_zero_parallel_ignored() {
        let config = EngineConfig {
            max_parallel: 4,
            ..EngineConfig::default()
        }
        .apply_overrides(|name| (name == ENV_MAX_PARALLEL).then(|| "0".to_string()));
        assert_eq!(config.max_parallel, 4);
    }
}
