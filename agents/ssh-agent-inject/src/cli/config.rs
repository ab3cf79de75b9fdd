//! Configuration module
//!
//! Handles loading and validating injector configuration from TOML files.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::inject::coordinator::{
    DiscoverySettings, DEFAULT_SOCKET_PATH, DEFAULT_USER, INJECTION_LABEL, USER_LABEL,
};
use crate::agent::connector::AUTH_SOCK_ENV;
use crate::inject::relay::RelaySettings;

/// Main configuration structure for the injector
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Container discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Relay helper binary settings
    #[serde(default)]
    pub payload: PayloadConfig,

    /// Relay session settings
    #[serde(default)]
    pub relay: RelayConfig,

    /// Runtime configuration
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Host ssh-agent settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Container discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Delay between scans in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Delay after a failed scan in milliseconds
    #[serde(default = "default_backoff_interval")]
    pub backoff_interval_ms: u64,

    /// Label that opts a container in
    #[serde(default = "default_injection_label")]
    pub injection_label: String,

    /// Label selecting the helper's user
    #[serde(default = "default_user_label")]
    pub user_label: String,

    /// User when the label is absent
    #[serde(default = "default_user")]
    pub default_user: String,
}

/// Relay helper binary configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadConfig {
    /// Helper binary on the host
    pub path: Option<PathBuf>,

    /// File name inside the container
    #[serde(default = "default_payload_name")]
    pub name: String,

    /// Directory inside the container the helper is copied to
    #[serde(default = "default_install_dir")]
    pub install_dir: String,
}

/// Relay session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Variable naming the in-container agent socket
    #[serde(default = "default_socket_env")]
    pub socket_env: String,

    /// In-container socket path when the container does not set one
    #[serde(default = "default_socket_path")]
    pub default_socket_path: String,

    /// Wait for the helper to exit after its streams close, in milliseconds
    /// (unset = until it exits)
    #[serde(default)]
    pub exit_grace_ms: Option<u64>,

    /// Maximum session length in seconds (unset = unlimited)
    #[serde(default)]
    pub session_timeout_secs: Option<u64>,
}

/// Runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Docker socket path (unset = local defaults, honouring DOCKER_HOST)
    pub docker_socket: Option<String>,
}

/// Host ssh-agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent socket or pipe (unset = SSH_AUTH_SOCK / platform default)
    pub socket: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (full, pretty, json, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_poll_interval() -> u64 {
    1000
}

fn default_backoff_interval() -> u64 {
    5000
}

fn default_injection_label() -> String {
    INJECTION_LABEL.to_string()
}

fn default_user_label() -> String {
    USER_LABEL.to_string()
}

fn default_user() -> String {
    DEFAULT_USER.to_string()
}

fn default_payload_name() -> String {
    "ssh-agent-pipe".to_string()
}

fn default_install_dir() -> String {
    "/usr/local/bin/".to_string()
}

fn default_socket_env() -> String {
    AUTH_SOCK_ENV.to_string()
}

fn default_socket_path() -> String {
    DEFAULT_SOCKET_PATH.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "full".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            backoff_interval_ms: default_backoff_interval(),
            injection_label: default_injection_label(),
            user_label: default_user_label(),
            default_user: default_user(),
        }
    }
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            path: None,
            name: default_payload_name(),
            install_dir: default_install_dir(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            socket_env: default_socket_env(),
            default_socket_path: default_socket_path(),
            exit_grace_ms: None,
            session_timeout_secs: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self::default()
    }

    /// Reject settings the injector cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.discovery.poll_interval_ms == 0 || self.discovery.backoff_interval_ms == 0 {
            bail!("discovery intervals must be greater than zero");
        }
        if self.discovery.injection_label.is_empty() {
            bail!("discovery.injection_label must not be empty");
        }
        if self.relay.socket_env.is_empty() {
            bail!("relay.socket_env must not be empty");
        }
        if self.payload.name.is_empty() || self.payload.name.contains('/') {
            bail!("payload.name must be a plain file name");
        }
        if !self.payload.install_dir.starts_with('/') {
            bail!("payload.install_dir must be an absolute path");
        }
        Ok(())
    }

    /// Helper binary path, required to start injecting
    pub fn payload_path(&self) -> Result<&Path> {
        self.payload
            .path
            .as_deref()
            .context("No relay helper binary configured (use --payload or payload.path)")
    }

    /// Discovery settings for the coordinator
    pub fn discovery_settings(&self) -> DiscoverySettings {
        DiscoverySettings {
            injection_label: self.discovery.injection_label.clone(),
            user_label: self.discovery.user_label.clone(),
            default_user: self.discovery.default_user.clone(),
            socket_env: self.relay.socket_env.clone(),
            default_socket_path: self.relay.default_socket_path.clone(),
            poll_interval: Duration::from_millis(self.discovery.poll_interval_ms),
            backoff_interval: Duration::from_millis(self.discovery.backoff_interval_ms),
        }
    }

    /// Relay settings for a helper installed at `helper_path`
    pub fn relay_settings(&self, helper_path: String, verbose: bool) -> RelaySettings {
        RelaySettings {
            helper_path,
            socket_env: self.relay.socket_env.clone(),
            verbose,
            exit_grace: self.relay.exit_grace_ms.map(Duration::from_millis),
            session_timeout: self.relay.session_timeout_secs.map(Duration::from_secs),
        }
    }
}
