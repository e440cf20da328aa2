//! Runtime Configuration
//!
//! [`RunnerConfig`] is read from an optional YAML file and then overridden
//! from `FLOWRUNNER_*` environment variables. Every field has a default, so
//! an empty file (or no file at all) is a valid configuration.
//!
//! # Example
//!
//! ```yaml
//! topic_prefix: orders
//! result_timeout_ms: 30000
//! worker_concurrency: 8
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding [`RunnerConfig::topic_prefix`].
pub const ENV_TOPIC_PREFIX: &str = "FLOWRUNNER_TOPIC_PREFIX";
/// Environment variable overriding [`RunnerConfig::result_timeout_ms`].
pub const ENV_RESULT_TIMEOUT_MS: &str = "FLOWRUNNER_RESULT_TIMEOUT_MS";
/// Environment variable overriding [`RunnerConfig::settled_history`].
pub const ENV_SETTLED_HISTORY: &str = "FLOWRUNNER_SETTLED_HISTORY";
/// Environment variable overriding [`RunnerConfig::early_capacity`].
pub const ENV_EARLY_CAPACITY: &str = "FLOWRUNNER_EARLY_CAPACITY";
/// Environment variable overriding [`RunnerConfig::worker_concurrency`].
pub const ENV_WORKER_CONCURRENCY: &str = "FLOWRUNNER_WORKER_CONCURRENCY";

/// Top-level runtime configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Queue topics are named `<topic_prefix>.<workflow name>`
    pub topic_prefix: String,

    /// Registration timeout for distributed results, 0 disables it
    pub result_timeout_ms: u64,

    /// Recently settled job ids remembered per topic
    pub settled_history: usize,

    /// Unmapped job outcomes buffered per topic before the oldest is dropped
    pub early_capacity: usize,

    /// Maximum concurrently running jobs per worker
    pub worker_concurrency: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "flows".to_string(),
            result_timeout_ms: 0,
            settled_history: 1024,
            early_capacity: 1024,
            worker_concurrency: 4,
        }
    }
}

impl RunnerConfig {
    /// Loads configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Cannot read config '{}': {}", path.display(), e))?;

        Self::from_yaml(&content)
    }

    /// Parses configuration from YAML text. Empty text yields the defaults.
    pub fn from_yaml(content: &str) -> Result<Self, Box<dyn std::error::Error>> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Applies `FLOWRUNNER_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self, Box<dyn std::error::Error>> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary variable source.
    fn apply_vars<F>(mut self, var: F) -> Result<Self, Box<dyn std::error::Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(prefix) = var(ENV_TOPIC_PREFIX) {
            self.topic_prefix = prefix;
        }
        if let Some(value) = var(ENV_RESULT_TIMEOUT_MS) {
            self.result_timeout_ms = parse_var(ENV_RESULT_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = var(ENV_SETTLED_HISTORY) {
            self.settled_history = parse_var(ENV_SETTLED_HISTORY, &value)?;
        }
        if let Some(value) = var(ENV_EARLY_CAPACITY) {
            self.early_capacity = parse_var(ENV_EARLY_CAPACITY, &value)?;
        }
        if let Some(value) = var(ENV_WORKER_CONCURRENCY) {
            self.worker_concurrency = parse_var(ENV_WORKER_CONCURRENCY, &value)?;
        }
        Ok(self)
    }

    /// Queue topic for a workflow.
    pub fn topic_for(&self, workflow: &str) -> String {
        topic_name(&self.topic_prefix, workflow)
    }

    pub fn tracker(&self) -> TrackerConfig {
        TrackerConfig {
            settled_history: self.settled_history,
            early_capacity: self.early_capacity.max(1),
        }
    }

    pub fn bridge(&self) -> BridgeConfig {
        BridgeConfig {
            topic_prefix: self.topic_prefix.clone(),
            result_timeout: timeout_from_ms(self.result_timeout_ms),
        }
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            topic_prefix: self.topic_prefix.clone(),
            concurrency: self.worker_concurrency.max(1),
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("Invalid value for {}: '{}'", key, value))
}

fn timeout_from_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn topic_name(prefix: &str, workflow: &str) -> String {
    if prefix.is_empty() {
        workflow.to_string()
    } else {
        format!("{}.{}", prefix, workflow)
    }
}

/// Completion tracker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    pub settled_history: usize,
    pub early_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        RunnerConfig::default().tracker()
    }
}

/// Distributed bridge settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub topic_prefix: String,
    /// `None` waits for a result indefinitely
    pub result_timeout: Option<Duration>,
}

impl BridgeConfig {
    pub fn topic_for(&self, workflow: &str) -> String {
        topic_name(&self.topic_prefix, workflow)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        RunnerConfig::default().bridge()
    }
}

/// Queue worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub topic_prefix: String,
    pub concurrency: usize,
}

impl WorkerConfig {
    pub fn topic_for(&self, workflow: &str) -> String {
        topic_name(&self.topic_prefix, workflow)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        RunnerConfig::default().worker()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.topic_prefix, "flows");
        assert_eq!(config.result_timeout_ms, 0);
        assert_eq!(config.settled_history, 1024);
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.tracker().early_capacity, 1024);
        assert_eq!(config.bridge().result_timeout, None);
    }

    #[test]
    fn test_load_partial_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "topic_prefix: orders\nresult_timeout_ms: 250").unwrap();

        let config = RunnerConfig::load(file.path()).unwrap();
        assert_eq!(config.topic_prefix, "orders");
        assert_eq!(config.bridge().result_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.worker_concurrency, 4);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(RunnerConfig::from_yaml("  \n").unwrap(), RunnerConfig::default());
    }

    #[test]
    fn test_load_missing_file() {
        let err = RunnerConfig::load("/nonexistent/flowrunner.yaml").unwrap_err();
        assert!(err.to_string().contains("Cannot read config"));
    }

    #[test]
    fn test_env_overrides() {
        let config = RunnerConfig::default()
            .apply_vars(vars(&[
                (ENV_TOPIC_PREFIX, "jobs"),
                (ENV_SETTLED_HISTORY, "16"),
                (ENV_EARLY_CAPACITY, "0"),
                (ENV_WORKER_CONCURRENCY, " 2 "),
            ]))
            .unwrap();

        assert_eq!(config.topic_prefix, "jobs");
        assert_eq!(config.tracker().settled_history, 16);
        assert_eq!(config.tracker().early_capacity, 1);
        assert_eq!(config.worker().concurrency, 2);
        assert_eq!(config.result_timeout_ms, 0);
    }

    #[test]
    fn test_env_invalid_number() {
        let err = RunnerConfig::default()
            .apply_vars(vars(&[(ENV_RESULT_TIMEOUT_MS, "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_RESULT_TIMEOUT_MS));
    }

    #[test]
    fn test_topic_naming() {
        let config = RunnerConfig::default();
        assert_eq!(config.topic_for("place_order"), "flows.place_order");
        assert_eq!(config.bridge().topic_for("refund"), "flows.refund");

        let bare = BridgeConfig {
            topic_prefix: String::new(),
            result_timeout: None,
        };
        assert_eq!(bare.topic_for("refund"), "refund");
    }

    #[test]
    fn test_worker_concurrency_at_least_one() {
        let config = RunnerConfig {
            worker_concurrency: 0,
            ..RunnerConfig::default()
        };
        assert_eq!(config.worker().concurrency, 1);
    }
}
