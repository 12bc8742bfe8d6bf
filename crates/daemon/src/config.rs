//! Configuration management for the termbridge server.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termbridge/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::pty::{
    default_shell, Geometry, SpawnOptions, DEFAULT_COLS, DEFAULT_ROWS, DEFAULT_TERM,
};

/// Default address the bridge listens on.
pub const DEFAULT_BIND: &str = "127.0.0.1:5001";

/// Default maximum size of an inbound WebSocket message (1 MiB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bind must be a socket address like 127.0.0.1:5001, got {0}")]
    InvalidBindAddress(String),

    #[error("max_message_bytes must be greater than 0")]
    InvalidMaxMessageBytes,

    #[error("rows and cols must be greater than 0, got {rows}x{cols}")]
    InvalidGeometry { rows: u16, cols: u16 },

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("working_dir does not exist: {0}")]
    InvalidWorkingDir(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the termbridge server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General process configuration.
    pub daemon: DaemonConfig,

    /// Listener configuration.
    pub server: ServerConfig,

    /// Shell session configuration.
    pub session: SessionConfig,
}

/// General process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to accept WebSocket connections on.
    pub bind: String,

    /// Largest inbound WebSocket message accepted, in bytes.
    pub max_message_bytes: usize,
}

/// Shell session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell to spawn for every connection.
    pub shell: String,

    /// Arguments passed to the shell.
    pub shell_args: Vec<String>,

    /// Working directory for new shells (default: home directory).
    pub working_dir: Option<PathBuf>,

    /// `TERM` value exported to the shell.
    pub term: String,

    /// Initial terminal columns.
    pub cols: u16,

    /// Initial terminal rows.
    pub rows: u16,

    /// Command typed into every new shell right after it starts.
    pub startup_command: Option<String>,

    /// Close sessions with no traffic for this many seconds (0 = never).
    pub idle_timeout_secs: u64,

    /// Milliseconds a shell gets to exit after hangup before it is killed.
    pub kill_grace_ms: u64,

    /// Extra environment variables for the shell.
    pub env: BTreeMap<String, String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            shell_args: Vec::new(),
            working_dir: None,
            term: DEFAULT_TERM.to_string(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            startup_command: None,
            idle_timeout_secs: 0,
            kill_grace_ms: 2000,
            env: BTreeMap::new(),
        }
    }
}

impl SessionConfig {
    /// Builds the spawn template used for every connection.
    pub fn spawn_options(&self) -> SpawnOptions {
        SpawnOptions {
            program: self.shell.clone(),
            args: self.shell_args.clone(),
            cwd: self.working_dir.clone(),
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            term: self.term.clone(),
            geometry: Geometry::new(self.rows, self.cols),
            startup_command: self.startup_command.clone().filter(|c| !c.trim().is_empty()),
            kill_grace: Duration::from_millis(self.kill_grace_ms),
        }
    }

    /// Returns the idle cutoff, if enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

impl ServerConfig {
    /// Parses the bind address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.bind.clone()))
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termbridge")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMBRIDGE_BIND: Override listen address
    /// - TERMBRIDGE_SHELL: Override shell program
    /// - TERMBRIDGE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("TERMBRIDGE_BIND") {
            if !bind.is_empty() {
                tracing::info!("Overriding bind from environment: {}", bind);
                self.server.bind = bind;
            }
        }

        if let Ok(shell) = std::env::var("TERMBRIDGE_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding shell from environment: {}", shell);
                self.session.shell = shell;
            }
        }

        if let Ok(level) = std::env::var("TERMBRIDGE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind_addr()?;

        if self.server.max_message_bytes == 0 {
            return Err(ConfigError::InvalidMaxMessageBytes);
        }

        if self.session.rows == 0 || self.session.cols == 0 {
            return Err(ConfigError::InvalidGeometry {
                rows: self.session.rows,
                cols: self.session.cols,
            });
        }

        let shell_path = Path::new(&self.session.shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(self.session.shell.clone()));
            }
        } else if which::which(&self.session.shell).is_err() {
            return Err(ConfigError::InvalidShellPath(self.session.shell.clone()));
        }

        if let Some(dir) = &self.session.working_dir {
            if !dir.is_dir() {
                return Err(ConfigError::InvalidWorkingDir(dir.display().to_string()));
            }
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

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
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
