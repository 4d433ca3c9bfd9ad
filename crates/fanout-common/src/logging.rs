//! Structured Logging Configuration
//!
//! Installs a `tracing` subscriber with:
//! - JSON output for log aggregation (`format = "json"` or LOG_FORMAT=json)
//! - Human-readable output otherwise
//!
//! `RUST_LOG` always wins over the configured level, e.g.
//! `RUST_LOG=fanout_router=debug`.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl LoggingSettings {
    /// Output format after applying the LOG_FORMAT environment variable
    pub fn effective_format(&self) -> LogFormat {
        match std::env::var("LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            Ok(v) if v.eq_ignore_ascii_case("text") => LogFormat::Text,
            _ => self.format,
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new("info"))
        })
    }
}

/// Initialize the global subscriber.
///
/// Returns false if a subscriber was already installed (tests, embedding hosts).
pub fn init_logging(settings: &LoggingSettings) -> bool {
    let env_filter = settings.env_filter();

    match settings.effective_format() {
        LogFormat::Json => init_json_logging(env_filter),
        LogFormat::Text => init_text_logging(env_filter),
    }
}

fn init_json_logging(env_filter: EnvFilter) -> bool {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .flatten_event(true)
                .with_span_events(FmtSpan::CLOSE)
        )
        .try_init()
        .is_ok()
}

fn init_text_logging(env_filter: EnvFilter) -> bool {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
        )
        .try_init()
        .is_ok()
}

/// Initialize logging with defaults (info, text)
pub fn init_default_logging() -> bool {
    init_logging(&LoggingSettings::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_falls_back() {
        let settings = LoggingSettings {
            level: "not a [valid directive".to_string(),
            format: LogFormat::Text,
        };
        // Must not panic whatever RUST_LOG holds
        drop(settings.env_filter());
    }

    #[test]
    fn test_second_init_is_rejected() {
        init_default_logging();
        assert!(!init_default_logging());
    }

    #[test]
    fn test_format_deserializes_lowercase() {
        let settings: LoggingSettings =
            serde_json::from_str(r#"{"level":"debug","format":"json"}"#).unwrap();
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.level, "debug");
    }
}
