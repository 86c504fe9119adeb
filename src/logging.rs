//! Log subscriber setup
//!
//! ```text
//! Registry
//!   ├── EnvFilter (RUST_LOG, then --log-level, then config)
//!   └── Fmt Layer (json or pretty, on stderr)
//! ```
//!
//! Logs go to stderr so they never interleave with anything a caller pipes
//! from stdout. The progress bar shares stderr and redraws in place.

use crate::config::LoggingConfig;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Logging setup errors
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {message}")]
    InvalidFilter { filter: String, message: String },

    #[error("Failed to set global subscriber (may already be initialized): {0}")]
    AlreadyInitialized(String),
}

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn parse(format: &str) -> Self {
        match format.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

/// Filter directive to use: RUST_LOG wins, then the CLI override, then config
fn filter_directive(config: &LoggingConfig, level_override: Option<&str>) -> String {
    if let Ok(from_env) = std::env::var(EnvFilter::DEFAULT_ENV) {
        if !from_env.trim().is_empty() {
            return from_env;
        }
    }
    level_override
        .map(str::to_string)
        .unwrap_or_else(|| config.level.clone())
}

/// Build the env filter without installing anything
pub fn build_filter(
    config: &LoggingConfig,
    level_override: Option<&str>,
) -> Result<EnvFilter, LoggingError> {
    let directive = filter_directive(config, level_override);
    EnvFilter::try_new(&directive).map_err(|e| LoggingError::InvalidFilter {
        filter: directive,
        message: e.to_string(),
    })
}

/// Install the global subscriber
///
/// Fails if a subscriber is already installed.
pub fn init_subscriber(
    config: &LoggingConfig,
    level_override: Option<&str>,
) -> Result<(), LoggingError> {
    let env_filter = build_filter(config, level_override)?;
    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match LogFormat::parse(&config.format) {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_line_number(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    result.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("anything"), LogFormat::Json);
    }

    #[test]
    #[serial]
    fn test_filter_prefers_override_over_config() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig::default();
        assert_eq!(filter_directive(&config, Some("debug")), "debug");
        assert_eq!(filter_directive(&config, None), "info");
    }

    #[test]
    #[serial]
    fn test_filter_prefers_rust_log() {
        std::env::set_var("RUST_LOG", "presign_uploadr=trace");
        let directive = filter_directive(&LoggingConfig::default(), Some("warn"));
        std::env::remove_var("RUST_LOG");
        assert_eq!(directive, "presign_uploadr=trace");
    }

    #[test]
    #[serial]
    fn test_invalid_filter_rejected() {
        std::env::remove_var("RUST_LOG");
        let result = build_filter(&LoggingConfig::default(), Some("presign_uploadr=loudest"));
        assert!(matches!(result, Err(LoggingError::InvalidFilter { .. })));
    }
}
