//! Fanout Configuration System
//!
//! TOML-based configuration with environment variable overrides.

use fanout_common::logging::LoggingSettings;
use fanout_common::RoutingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::{ConfigLoader, LoadNotice};

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub routing: RoutingConfig,
    pub input: InputConfig,
    pub shutdown: ShutdownConfig,
    pub logging: LoggingSettings,
}

/// How the host turns raw input into routing keys
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct InputConfig {
    /// Top-level JSON field used as the lane key under BY_KEY routing.
    /// Unset means every payload lands on the default lane.
    pub key_field: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Upper bound on the drain wait after a termination signal
    pub drain_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { drain_timeout_secs: 60 }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Fanout Configuration
# Environment variables (FANOUT_*) override these settings

[routing]
strategy = "BY_KEY"  # ROUND_ROBIN, LEAST_WORKLOAD or BY_KEY
fixed_lanes = 4      # used by ROUND_ROBIN and LEAST_WORKLOAD

[input]
key_field = "customer"

[shutdown]
drain_timeout_secs = 60

[logging]
level = "info"
format = "text"  # text or json
"#
        .to_string()
    }
}
