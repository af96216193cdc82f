use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MaestroError, Result};

/// Top-level Maestro configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaestroConfig {
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub swarm: SwarmConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Limits and pool size for graph runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Per-node execution bound. Required (and > 0) when the graph has a cycle.
    #[serde(default)]
    pub max_node_executions: Option<u32>,
    /// Maximum number of nodes running at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Timeout for a single node execution, in milliseconds.
    #[serde(default)]
    pub node_timeout_ms: Option<u64>,
    /// Deadline for the whole run, in milliseconds; checked between scheduling ticks.
    #[serde(default)]
    pub execution_timeout_ms: Option<u64>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_node_executions: None,
            max_concurrency: default_max_concurrency(),
            node_timeout_ms: None,
            execution_timeout_ms: None,
        }
    }
}

impl GraphConfig {
    pub fn node_timeout(&self) -> Option<Duration> {
        self.node_timeout_ms.map(Duration::from_millis)
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_ms.map(Duration::from_millis)
    }
}

/// Limits for swarm runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmConfig {
    #[serde(default = "default_max_handoffs")]
    pub max_handoffs: u32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Wall-clock deadline, in milliseconds.
    #[serde(default = "default_swarm_timeout_ms")]
    pub execution_timeout_ms: u64,
    #[serde(default)]
    pub node_timeout_ms: Option<u64>,
    /// Number of recent handoffs inspected for ping-pong detection (0 = disabled).
    #[serde(default)]
    pub repetitive_handoff_window: usize,
    /// Minimum distinct nodes expected inside the window.
    #[serde(default)]
    pub repetitive_handoff_min_unique: usize,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_handoffs: default_max_handoffs(),
            max_iterations: default_max_iterations(),
            execution_timeout_ms: default_swarm_timeout_ms(),
            node_timeout_ms: None,
            repetitive_handoff_window: 0,
            repetitive_handoff_min_unique: 0,
        }
    }
}

impl SwarmConfig {
    pub fn new(max_handoffs: u32, max_iterations: u32, execution_timeout: Duration) -> Self {
        Self {
            max_handoffs,
            max_iterations,
            execution_timeout_ms: execution_timeout.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn node_timeout(&self) -> Option<Duration> {
        self.node_timeout_ms.map(Duration::from_millis)
    }

    /// Reject zero limits.
    pub fn validate(&self) -> Result<()> {
        if self.max_handoffs == 0 {
            return Err(MaestroError::Validation("max_handoffs must be > 0".into()));
        }
        if self.max_iterations == 0 {
            return Err(MaestroError::Validation("max_iterations must be > 0".into()));
        }
        if self.execution_timeout_ms == 0 {
            return Err(MaestroError::Validation(
                "execution_timeout must be > 0".into(),
            ));
        }
        if self.repetitive_handoff_window > 0 && self.repetitive_handoff_min_unique == 0 {
            return Err(MaestroError::Validation(
                "repetitive_handoff_min_unique must be > 0 when the window is enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration for the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when neither MAESTRO_LOG nor RUST_LOG is set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_max_concurrency() -> usize { 8 }
fn default_max_handoffs() -> u32 { 20 }
fn default_max_iterations() -> u32 { 20 }
fn default_swarm_timeout_ms() -> u64 { 900_000 }
fn default_log_filter() -> String { "maestro=info,warn".to_string() }

impl MaestroConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| MaestroError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn from_toml(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| MaestroError::Config(e.to_string()))?;
        config.swarm.validate()?;
        if config.graph.max_node_executions == Some(0) {
            return Err(MaestroError::Config(
                "graph.max_node_executions must be > 0".into(),
            ));
        }
        if config.graph.max_concurrency == 0 {
            return Err(MaestroError::Config("graph.max_concurrency must be > 0".into()));
        }
        Ok(config)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_MAESTRO_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_MAESTRO_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_MAESTRO_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_MAESTRO_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_MAESTRO_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = MaestroConfig::from_toml("").unwrap();
        assert_eq!(config.graph.max_concurrency, 8);
        assert!(config.graph.max_node_executions.is_none());
        assert_eq!(config.swarm.max_handoffs, 20);
        assert_eq!(config.swarm.max_iterations, 20);
        assert_eq!(config.swarm.execution_timeout(), Duration::from_secs(900));
        assert_eq!(config.log.filter, "maestro=info,warn");
    }

    #[test]
    fn test_partial_sections() {
        let toml_str = r#"
[graph]
max_node_executions = 3
node_timeout_ms = 30000

[swarm]
max_handoffs = 10
execution_timeout_ms = 600000
"#;
        let config = MaestroConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.graph.max_node_executions, Some(3));
        assert_eq!(config.graph.node_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.swarm.max_handoffs, 10);
        assert_eq!(config.swarm.max_iterations, 20);
        assert_eq!(config.swarm.execution_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_zero_limits_rejected() {
        assert!(MaestroConfig::from_toml("[swarm]\nmax_handoffs = 0\n").is_err());
        assert!(MaestroConfig::from_toml("[graph]\nmax_node_executions = 0\n").is_err());
        assert!(MaestroConfig::from_toml("[graph]\nmax_concurrency = 0\n").is_err());
        assert!(MaestroConfig::from_toml(
            "[swarm]\nrepetitive_handoff_window = 4\n"
        )
        .is_err());
    }

    #[test]
    fn test_swarm_config_constructor() {
        let cfg = SwarmConfig::new(5, 10, Duration::from_secs(300));
        assert_eq!(cfg.execution_timeout_ms, 300_000);
        assert!(cfg.validate().is_ok());
        assert!(SwarmConfig::new(5, 10, Duration::ZERO).validate().is_err());
    }
}
