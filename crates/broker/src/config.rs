//! Configuration management for the PodShell broker.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/podshell/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default address the terminal endpoint listens on.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8765";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen_addr must be a socket address like 0.0.0.0:8765, got {0}")]
    InvalidListenAddr(String),

    #[error("create_attempts must be between 1 and 20, got {0}")]
    InvalidCreateAttempts(u32),

    #[error("ready_timeout_secs must be greater than 0")]
    InvalidReadyTimeout,

    #[error("namespace must not be empty")]
    EmptyNamespace,

    #[error("shell must not be empty")]
    EmptyShell,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Terminal endpoint settings.
    pub server: ServerConfig,

    /// Cluster connection settings.
    pub cluster: ClusterConfig,

    /// Per-session provisioning settings.
    pub session: SessionConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Terminal endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to accept WebSocket connections on.
    pub listen_addr: String,

    /// Seconds to wait for live sessions to close during shutdown.
    pub drain_timeout_secs: u64,

    /// Upper bound in seconds on the whole shutdown before the process exits.
    pub shutdown_timeout_secs: u64,
}

/// Cluster connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    /// Namespace session pods are created in.
    pub namespace: String,

    /// Explicit kubeconfig file. When unset the in-cluster configuration
    /// is tried first, then the default kubeconfig.
    pub kubeconfig: Option<PathBuf>,
}

/// Session provisioning configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Attempts made to create a pod before the session is abandoned.
    pub create_attempts: u32,

    /// Seconds to wait for a new pod to become ready.
    pub ready_timeout_secs: u64,

    /// Command attached to inside the pod.
    pub shell: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            drain_timeout_secs: 10,
            shutdown_timeout_secs: 15,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            kubeconfig: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            create_attempts: 3,
            ready_timeout_secs: 120,
            shell: "/bin/bash".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl SessionConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("podshell")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PODSHELL_LISTEN_ADDR: Override the listen address
    /// - PODSHELL_NAMESPACE: Override the pod namespace
    /// - PODSHELL_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("PODSHELL_LISTEN_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding listen_addr from environment: {}", addr);
                self.server.listen_addr = addr;
            }
        }

        if let Ok(namespace) = std::env::var("PODSHELL_NAMESPACE") {
            if !namespace.is_empty() {
                tracing::info!("Overriding namespace from environment: {}", namespace);
                self.cluster.namespace = namespace;
            }
        }

        if let Ok(level) = std::env::var("PODSHELL_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.logging.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(
                self.server.listen_addr.clone(),
            ));
        }

        if !(1..=20).contains(&self.session.create_attempts) {
            return Err(ConfigError::InvalidCreateAttempts(
                self.session.create_attempts,
            ));
        }

        if self.session.ready_timeout_secs == 0 {
            return Err(ConfigError::InvalidReadyTimeout);
        }

        if self.cluster.namespace.is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }

        if self.session.shell.trim().is_empty() {
            return Err(ConfigError::EmptyShell);
        }

        let level = self.logging.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(
                self.logging.log_level.clone(),
            ));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
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

    /// Save configuration to a file, creating parent directories as needed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
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

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.listen_addr, "0.0.0.0:8765");
        assert_eq!(config.server.drain_timeout_secs, 10);
        assert_eq!(config.server.shutdown_timeout_secs, 15);
        assert_eq!(config.cluster.namespace, "default");
        assert!(config.cluster.kubeconfig.is_none());
        assert_eq!(config.session.create_attempts, 3);
        assert_eq!(config.session.shell, "/bin/bash");
        assert_eq!(config.logging.log_level, "info");
    }

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn test_durations() {
        let config = Config::default();
        assert_eq!(config.server.drain_timeout(), Duration::from_secs(10));
        assert_eq!(config.server.shutdown_timeout(), Duration::from_secs(15));
        assert_eq!(config.session.ready_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml(
            r#"
            [cluster]
            namespace = "sandboxes"
            "#,
        )
        .unwrap();

        assert_eq!(config.cluster.namespace, "sandboxes");
        assert_eq!(config.server.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(config.session.create_attempts, 3);
    }

    #[test]
    fn test_full_toml() {
        let config = Config::from_toml(
            r#"
            [server]
            listen_addr = "127.0.0.1:9000"
            drain_timeout_secs = 5
            shutdown_timeout_secs = 20

            [cluster]
            namespace = "terminals"
            kubeconfig = "/etc/podshell/kubeconfig"

            [session]
            create_attempts = 5
            ready_timeout_secs = 30
            shell = "/bin/sh"

            [logging]
            log_level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.server.drain_timeout_secs, 5);
        assert_eq!(
            config.cluster.kubeconfig,
            Some(PathBuf::from("/etc/podshell/kubeconfig"))
        );
        assert_eq!(config.session.create_attempts, 5);
        assert_eq!(config.session.shell, "/bin/sh");
        assert_eq!(config.logging.log_level, "debug");
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_invalid_toml_reports_error() {
        let err = Config::from_toml("[server\nlisten_addr = 1").unwrap_err();
        assert!(err.to_string().contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_validate_listen_addr() {
        let mut config = Config::default();
        config.server.listen_addr = "not-an-address".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidListenAddr("not-an-address".to_string()))
        );
    }

    #[test]
    fn test_validate_create_attempts() {
        let mut config = Config::default();
        config.session.create_attempts = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidCreateAttempts(0)));

        config.session.create_attempts = 21;
        assert_eq!(config.validate(), Err(ConfigError::InvalidCreateAttempts(21)));

        config.session.create_attempts = 20;
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_validate_ready_timeout() {
        let mut config = Config::default();
        config.session.ready_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidReadyTimeout));
    }

    #[test]
    fn test_validate_namespace_and_shell() {
        let mut config = Config::default();
        config.cluster.namespace = String::new();
        assert_eq!(config.validate(), Err(ConfigError::EmptyNamespace));

        let mut config = Config::default();
        config.session.shell = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyShell));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.logging.log_level = "WARN".to_string();
        assert_eq!(config.validate(), Ok(()));

        config.logging.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load_preserves_values() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.cluster.namespace = "terminals".to_string();
        config.session.create_attempts = 7;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("podshell/config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_listen_addr() {
        std::env::set_var("PODSHELL_LISTEN_ADDR", "127.0.0.1:1234");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.server.listen_addr, "127.0.0.1:1234");

        std::env::remove_var("PODSHELL_LISTEN_ADDR");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("PODSHELL_NAMESPACE", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.cluster.namespace, "default");

        std::env::remove_var("PODSHELL_NAMESPACE");
    }

    #[test]
    #[serial]
    fn test_env_override_namespace_and_log_level() {
        std::env::remove_var("PODSHELL_LISTEN_ADDR");
        std::env::set_var("PODSHELL_NAMESPACE", "terminals");
        std::env::set_var("PODSHELL_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.cluster.namespace, "terminals");
        assert_eq!(config.logging.log_level, "debug");
        assert_eq!(config.server.listen_addr, DEFAULT_LISTEN_ADDR);

        std::env::remove_var("PODSHELL_NAMESPACE");
        std::env::remove_var("PODSHELL_LOG_LEVEL");
    }
}
