//! Configuration module for presign-uploadr
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Default maximum chunk size: 250 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 250 * 1024 * 1024;

/// Default streaming window handed to the transport per poll: 8 KiB
pub const DEFAULT_STREAM_WINDOW: usize = 8 * 1024;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("CONTROL_PLANE_TOKEN", "secret");
/// let result = expand_env_vars("Bearer ${CONTROL_PLANE_TOKEN}");
/// assert_eq!(result, "Bearer secret");
///
/// let result = expand_env_vars("${MISSING:-fallback}");
/// assert_eq!(result, "fallback");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    // Regex to capture ${VAR} or ${VAR:-default}
    let re = match regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]+))?\}") {
        Ok(re) => re,
        Err(_) => return s.to_string(),
    };
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name.as_str()) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);

    result
}

/// Deserialize a string, expanding `${VAR}` references.
fn deserialize_with_env<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(expand_env_vars(&s))
}

/// Same as [`deserialize_with_env`] for optional values.
fn deserialize_option_with_env<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    Ok(s.map(|s| expand_env_vars(&s)))
}

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
///
/// Every section is optional; an empty file yields the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub control_plane: Option<ControlPlaneConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upload.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "upload.chunk_size must be greater than zero".into(),
            ));
        }

        if self.upload.stream_window == 0 {
            return Err(ConfigError::ValidationError(
                "upload.stream_window must be greater than zero".into(),
            ));
        }

        if (self.upload.stream_window as u64) > self.upload.chunk_size {
            return Err(ConfigError::ValidationError(format!(
                "upload.stream_window ({}) cannot exceed upload.chunk_size ({})",
                self.upload.stream_window, self.upload.chunk_size
            )));
        }

        if let Some(ref control_plane) = self.control_plane {
            if !is_valid_http_url(&control_plane.endpoint) {
                return Err(ConfigError::ValidationError(
                    "Invalid control plane endpoint: must start with http:// or https://".into(),
                ));
            }
        }

        match self.logging.format.as_str() {
            "json" | "pretty" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format '{}': must be 'json' or 'pretty'",
                    other
                )))
            }
        }

        Ok(())
    }
}

/// Chunking and progress configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Maximum bytes per chunk/part/block. Default: 250 MiB
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Bytes handed to the transport per poll of the request body. Default: 8 KiB
    #[serde(default = "default_stream_window")]
    pub stream_window: usize,
    /// Render a textual progress bar on stderr. Default: true
    #[serde(default = "default_show_progress")]
    pub show_progress: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            stream_window: default_stream_window(),
            show_progress: default_show_progress(),
        }
    }
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_stream_window() -> usize {
    DEFAULT_STREAM_WINDOW
}

fn default_show_progress() -> bool {
    true
}

/// HTTP transport configuration
///
/// No timeout is applied unless one is configured: a hung provider call
/// blocks the upload until the transport gives up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub connect_timeout_seconds: Option<u64>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl HttpConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_seconds.map(Duration::from_secs)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: None,
            connect_timeout_seconds: None,
            user_agent: default_user_agent(),
        }
    }
}

fn default_user_agent() -> String {
    format!("presign-uploadr/{}", env!("CARGO_PKG_VERSION"))
}

/// Control plane endpoint used to finalize or abandon uploads.
///
/// # Example
///
/// ```yaml
/// control_plane:
///   endpoint: "${CONTROL_PLANE_URL:-https://api.example.com}"
///   token: "${CONTROL_PLANE_TOKEN}"
///   workspace_id: "42"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    #[serde(deserialize_with = "deserialize_with_env")]
    pub endpoint: String,
    #[serde(default, deserialize_with = "deserialize_option_with_env")]
    pub token: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_with_env")]
    pub workspace_id: Option<String>,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Where to write the text exposition after each run
    #[serde(default, deserialize_with = "deserialize_option_with_env")]
    pub textfile: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            textfile: None,
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

/// Log output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset. Default: "info"
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "json" or "pretty". Default: "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_upload_config() {
        let config = UploadConfig::default();
        assert_eq!(config.chunk_size, 262_144_000);
        assert_eq!(config.stream_window, 8192);
        assert!(config.show_progress);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation_zero_chunk_size() {
        let mut config = Config::default();
        config.upload.chunk_size = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_window_larger_than_chunk() {
        let mut config = Config::default();
        config.upload.chunk_size = 1024;
        config.upload.stream_window = 4096;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_bad_endpoint() {
        let mut config = Config::default();
        config.control_plane = Some(ControlPlaneConfig {
            endpoint: "ftp://example.com".into(),
            token: None,
            workspace_id: None,
        });

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_bad_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".into();

        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_expand_env_vars_with_default() {
        std::env::remove_var("PRESIGN_TEST_MISSING");
        assert_eq!(
            expand_env_vars("${PRESIGN_TEST_MISSING:-fallback}"),
            "fallback"
        );
        assert_eq!(
            expand_env_vars("keep ${PRESIGN_TEST_MISSING}"),
            "keep ${PRESIGN_TEST_MISSING}"
        );
    }

    #[test]
    #[serial]
    fn test_control_plane_token_expansion() {
        std::env::set_var("PRESIGN_TEST_TOKEN", "s3cr3t");
        let yaml = r#"
control_plane:
  endpoint: "https://api.example.com"
  token: "${PRESIGN_TEST_TOKEN}"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        std::env::remove_var("PRESIGN_TEST_TOKEN");

        let control_plane = config.control_plane.unwrap();
        assert_eq!(control_plane.token.as_deref(), Some("s3cr3t"));
        assert_eq!(control_plane.workspace_id, None);
    }
}
