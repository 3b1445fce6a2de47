//! Configuration management for the Workbox daemon.
//!
//! This module provides TOML-based configuration file loading.
//! The default configuration path is `~/.config/workbox/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("sandbox root must be an absolute path, got {}", .0.display())]
    RelativeRoot(PathBuf),

    #[error("root_token must not be empty")]
    EmptyRootToken,

    #[error("max_size must be greater than 0, got {0}")]
    InvalidMaxSize(u64),

    #[error("max_entries must be greater than 0, got {0}")]
    InvalidMaxEntries(usize),

    #[error("listing timeout must be greater than 0 seconds, got {0}")]
    InvalidListingTimeout(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Workbox daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Sandbox boundary.
    pub sandbox: SandboxConfig,

    /// Upload limits.
    pub upload: UploadConfig,

    /// Directory listing limits.
    pub listing: ListingConfig,

    /// Where file operations execute.
    pub execution: ExecutionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Socket used by the remote execution environment.
    /// Unset means the per-user runtime location.
    pub socket_path: Option<PathBuf>,
}

/// Sandbox boundary configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    /// The sandbox root. Relative paths in requests resolve against it.
    pub root: PathBuf,

    /// Additional directories that are also inside the boundary.
    pub extra_roots: Vec<PathBuf>,

    /// Request path that stands for the sandbox root.
    pub root_token: String,
}

/// Upload configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadConfig {
    /// Maximum size of a single uploaded file in bytes (default: 100MB).
    pub max_size: u64,
}

/// Directory listing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ListingConfig {
    /// Entries returned before a listing is truncated.
    pub max_entries: usize,

    /// Seconds a single enumeration may take.
    pub timeout_secs: u64,
}

/// Execution environment configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Run operations in-process or in the remote environment.
    pub mode: ExecutionMode,

    /// Seconds to wait for the remote environment to answer.
    pub request_timeout_secs: u64,
}

/// Where file operations execute.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// In the current process.
    #[default]
    Local,
    /// In a separate environment reached over the daemon socket.
    Remote,
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(ExecutionMode::Local),
            "remote" => Ok(ExecutionMode::Remote),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            socket_path: None,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/a0"),
            extra_roots: Vec::new(),
            root_token: "$WORK_DIR".to_string(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_size: 100 * 1024 * 1024, // 100MB
        }
    }
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            timeout_secs: 30,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Local,
            request_timeout_secs: 60,
        }
    }
}

impl ListingConfig {
    /// Enumeration timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ExecutionConfig {
    /// Remote request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl SandboxConfig {
    /// The sandbox root followed by any extra roots.
    pub fn all_roots(&self) -> Vec<PathBuf> {
        std::iter::once(self.root.clone())
            .chain(self.extra_roots.iter().cloned())
            .collect()
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("workbox")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - WORKBOX_ROOT: Override the sandbox root
    /// - WORKBOX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - WORKBOX_EXECUTION_MODE: `local` or `remote`
    /// - WORKBOX_SOCKET: Override the execution socket path
    pub fn apply_env_overrides(&mut self) {
        if let Some(root) = non_empty_env("WORKBOX_ROOT") {
            tracing::info!(root = %root, "Overriding sandbox root from environment");
            self.sandbox.root = PathBuf::from(root);
        }

        if let Some(level) = non_empty_env("WORKBOX_LOG_LEVEL") {
            tracing::info!(level = %level, "Overriding log_level from environment");
            self.daemon.log_level = level;
        }

        if let Some(mode) = non_empty_env("WORKBOX_EXECUTION_MODE") {
            match mode.parse() {
                Ok(mode) => {
                    tracing::info!(?mode, "Overriding execution mode from environment");
                    self.execution.mode = mode;
                }
                Err(e) => tracing::warn!(error = %e, "Ignoring WORKBOX_EXECUTION_MODE"),
            }
        }

        if let Some(socket) = non_empty_env("WORKBOX_SOCKET") {
            tracing::info!(socket = %socket, "Overriding socket_path from environment");
            self.daemon.socket_path = Some(PathBuf::from(socket));
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.sandbox.root.is_absolute() {
            return Err(ConfigError::RelativeRoot(self.sandbox.root.clone()));
        }
        if let Some(extra) = self.sandbox.extra_roots.iter().find(|r| !r.is_absolute()) {
            return Err(ConfigError::RelativeRoot(extra.clone()));
        }

        if self.sandbox.root_token.is_empty() {
            return Err(ConfigError::EmptyRootToken);
        }

        if self.upload.max_size == 0 {
            return Err(ConfigError::InvalidMaxSize(self.upload.max_size));
        }

        if self.listing.max_entries == 0 {
            return Err(ConfigError::InvalidMaxEntries(self.listing.max_entries));
        }

        if self.listing.timeout_secs == 0 {
            return Err(ConfigError::InvalidListingTimeout(self.listing.timeout_secs));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const ENV_KEYS: &[&str] = &[
        "WORKBOX_ROOT",
        "WORKBOX_LOG_LEVEL",
        "WORKBOX_EXECUTION_MODE",
        "WORKBOX_SOCKET",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.daemon.socket_path, None);
        assert_eq!(config.sandbox.root, PathBuf::from("/a0"));
        assert!(config.sandbox.extra_roots.is_empty());
        assert_eq!(config.sandbox.root_token, "$WORK_DIR");
        assert_eq!(config.upload.max_size, 100 * 1024 * 1024);
        assert_eq!(config.listing.max_entries, 10_000);
        assert_eq!(config.listing.timeout(), Duration::from_secs(30));
        assert_eq!(config.execution.mode, ExecutionMode::Local);
        assert_eq!(config.execution.request_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[sandbox]
root = "/srv/work"

[execution]
mode = "remote"
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.sandbox.root, PathBuf::from("/srv/work"));
        assert_eq!(config.sandbox.root_token, "$WORK_DIR");
        assert_eq!(config.execution.mode, ExecutionMode::Remote);
        assert_eq!(config.execution.request_timeout_secs, 60);
        assert_eq!(config.upload, UploadConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
log_level = "debug"
socket_path = "/run/workbox/exec.sock"

[sandbox]
root = "/srv/work"
extra_roots = ["/srv/shared"]
root_token = "$ROOT"

[upload]
max_size = 1048576

[listing]
max_entries = 50
timeout_secs = 5

[execution]
mode = "local"
request_timeout_secs = 10
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(
            config.daemon.socket_path,
            Some(PathBuf::from("/run/workbox/exec.sock"))
        );
        assert_eq!(
            config.sandbox.all_roots(),
            vec![PathBuf::from("/srv/work"), PathBuf::from("/srv/shared")]
        );
        assert_eq!(config.sandbox.root_token, "$ROOT");
        assert_eq!(config.upload.max_size, 1_048_576);
        assert_eq!(config.listing.max_entries, 50);
        assert_eq!(config.listing.timeout_secs, 5);
        assert_eq!(config.execution.request_timeout_secs, 10);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let err = Config::from_toml("[sandbox\nroot = ").unwrap_err();
        assert!(err.to_string().contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_from_toml_unknown_mode() {
        let err = Config::from_toml("[execution]\nmode = \"cloud\"").unwrap_err();
        assert!(err.to_string().contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_from_toml_remote_setup() {
        let config = Config::from_toml(
            r#"
            [daemon]
            socket_path = "/tmp/exec.sock"

            [sandbox]
            extra_roots = ["/tmp/shared"]

            [execution]
            mode = "remote"
            "#,
        )
        .unwrap();

        assert_eq!(config.sandbox.extra_roots, [PathBuf::from("/tmp/shared")]);
        assert_eq!(config.daemon.socket_path, Some(PathBuf::from("/tmp/exec.sock")));
        assert_eq!(config.execution.mode, ExecutionMode::Remote);
        assert_eq!(config.sandbox.root, PathBuf::from("/a0"));
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/workbox/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[listing]\nmax_entries = 12\n").unwrap();

        let mut expected = Config::default();
        expected.listing.max_entries = 12;
        assert_eq!(Config::load(&path).unwrap(), expected);
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "upload = 3").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("workbox/config.toml"));
    }

    #[test]
    fn test_execution_mode_from_str() {
        assert_eq!("Remote".parse::<ExecutionMode>(), Ok(ExecutionMode::Remote));
        assert_eq!("local".parse::<ExecutionMode>(), Ok(ExecutionMode::Local));
        assert!("elsewhere".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn test_validate_default_config() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn test_validate_relative_root() {
        let mut config = Config::default();
        config.sandbox.root = PathBuf::from("work");
        assert_eq!(
            config.validate(),
            Err(ConfigError::RelativeRoot(PathBuf::from("work")))
        );

        let mut config = Config::default();
        config.sandbox.extra_roots = vec![PathBuf::from("shared")];
        assert_eq!(
            config.validate(),
            Err(ConfigError::RelativeRoot(PathBuf::from("shared")))
        );
    }

    #[test]
    fn test_validate_empty_root_token() {
        let mut config = Config::default();
        config.sandbox.root_token.clear();
        assert_eq!(config.validate(), Err(ConfigError::EmptyRootToken));
    }

    #[test]
    fn test_validate_zero_limits() {
        let mut config = Config::default();
        config.upload.max_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSize(0)));

        let mut config = Config::default();
        config.listing.max_entries = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxEntries(0)));

        let mut config = Config::default();
        config.listing.timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidListingTimeout(0)));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        for level in ["trace", "DEBUG", "Info", "warn", "error"] {
            config.daemon.log_level = level.to_string();
            assert_eq!(config.validate(), Ok(()), "level {level}");
        }

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("WORKBOX_ROOT", "/srv/override");
        std::env::set_var("WORKBOX_LOG_LEVEL", "trace");
        std::env::set_var("WORKBOX_EXECUTION_MODE", "remote");
        std::env::set_var("WORKBOX_SOCKET", "/tmp/override.sock");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.sandbox.root, PathBuf::from("/srv/override"));
        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(config.execution.mode, ExecutionMode::Remote);
        assert_eq!(
            config.daemon.socket_path,
            Some(PathBuf::from("/tmp/override.sock"))
        );

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var("WORKBOX_ROOT", "");
        std::env::set_var("WORKBOX_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_bad_mode_is_ignored() {
        clear_env();
        std::env::set_var("WORKBOX_EXECUTION_MODE", "cloud");

        let mut config = Config::default();
        config.execution.mode = ExecutionMode::Remote;
        config.apply_env_overrides();
        assert_eq!(config.execution.mode, ExecutionMode::Remote);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        clear_env();
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());
    }
}
