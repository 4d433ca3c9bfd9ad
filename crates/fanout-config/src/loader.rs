//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use fanout_common::logging::LogFormat;
use fanout_common::RoutingKind;
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

/// Something worth logging that happened while loading. Loading usually
/// runs before logging is initialised, so notices are collected and logged
/// by the caller afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadNotice {
    FileLoaded(PathBuf),
    MissingConfiguredFile(PathBuf),
    IgnoredOverride { name: &'static str, value: String },
}

impl LoadNotice {
    pub fn log(&self) {
        match self {
            LoadNotice::FileLoaded(path) => {
                info!(?path, "Loaded configuration from file");
            }
            LoadNotice::MissingConfiguredFile(path) => {
                warn!(?path, "Configured file does not exist, searched defaults");
            }
            LoadNotice::IgnoredOverride { name, value } => {
                warn!(variable = %name, value = %value, "Ignoring unparseable override");
            }
        }
    }
}

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "fanout.toml",
    "config.toml",
    "./config/fanout.toml",
    "/etc/fanout/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable
    /// overrides, logging notices as they come. Use when logging is already set up.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (config, notices) = self.load_with_notices()?;
        for notice in &notices {
            notice.log();
        }
        Ok(config)
    }

    /// Like [`load`](Self::load) but hands the notices back instead of
    /// logging them, for callers that configure logging from the result.
    pub fn load_with_notices(&self) -> Result<(AppConfig, Vec<LoadNotice>), ConfigError> {
        let mut notices = Vec::new();
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file(&mut notices) {
            config = AppConfig::from_file(&path)?;
            notices.push(LoadNotice::FileLoaded(path));
        }

        apply_overrides(&mut config, |name| env::var(name).ok(), &mut notices)?;

        Ok((config, notices))
    }

    fn find_config_file(&self, notices: &mut Vec<LoadNotice>) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            notices.push(LoadNotice::MissingConfiguredFile(path.clone()));
        }

        if let Ok(path) = env::var("FANOUT_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `FANOUT_*` overrides read through `lookup`.
///
/// Numeric values that fail to parse are ignored and reported as notices; an
/// unknown routing strategy name is rejected.
pub(crate) fn apply_overrides<F>(
    config: &mut AppConfig,
    lookup: F,
    notices: &mut Vec<LoadNotice>,
) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    // Routing
    if let Some(val) = lookup("FANOUT_ROUTING_STRATEGY") {
        config.routing.strategy = val
            .parse::<RoutingKind>()
            .map_err(ConfigError::ValidationError)?;
    }
    if let Some(val) = lookup("FANOUT_FIXED_LANES") {
        match val.trim().parse() {
            Ok(lanes) => config.routing.fixed_lanes = lanes,
            Err(_) => notices.push(LoadNotice::IgnoredOverride {
                name: "FANOUT_FIXED_LANES",
                value: val,
            }),
        }
    }

    // Input
    if let Some(val) = lookup("FANOUT_KEY_FIELD") {
        config.input.key_field = if val.trim().is_empty() { None } else { Some(val) };
    }

    // Shutdown
    if let Some(val) = lookup("FANOUT_DRAIN_TIMEOUT_SECS") {
        match val.trim().parse() {
            Ok(secs) => config.shutdown.drain_timeout_secs = secs,
            Err(_) => notices.push(LoadNotice::IgnoredOverride {
                name: "FANOUT_DRAIN_TIMEOUT_SECS",
                value: val,
            }),
        }
    }

    // Logging
    if let Some(val) = lookup("FANOUT_LOG_LEVEL") {
        config.logging.level = val;
    }
    if let Some(val) = lookup("FANOUT_LOG_FORMAT") {
        config.logging.format = if val.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        };
    }

    Ok(())
}
