//! Configuration module for the script bridge.

use serde::Deserialize;
use std::path::Path;

use crate::{BridgeError, Result};

/// Evaluation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationConfig {
    /// Default timeout in milliseconds for `evaluate` calls.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
        }
    }
}

impl EvaluationConfig {
    /// Default timeout as a `Duration`.
    pub fn default_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.default_timeout_ms)
    }
}

/// Resource limits applied to the embedded engine.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of instructions per request (0 = unlimited).
    #[serde(default = "default_max_instructions")]
    pub max_instructions: u64,
    /// Maximum engine memory in megabytes (0 = unlimited).
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: usize,
}

fn default_max_instructions() -> u64 {
    10_000_000
}

fn default_max_memory_mb() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_instructions: default_max_instructions(),
            max_memory_mb: default_max_memory_mb(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file path; console-only when absent.
    #[serde(default)]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    /// Evaluation settings.
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    /// Engine resource limits.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| BridgeError::Config(e.to_string()))
    }
}
