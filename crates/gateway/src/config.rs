//! Configuration management for the KubeJump gateway.
//!
//! Settings live in one TOML file with a section per concern. Every key is
//! optional and falls back to its default.
//! The default configuration path is `~/.config/kubejump/config.toml`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use protocol::WindowSize;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exchange::RoomOptions;
use crate::session::{ExpireInfo, SwitchOptions};

/// A configuration value out of range.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("gateway name must not be empty")]
    EmptyName,

    #[error("max_idle_minutes must be between 1 and 10080, got {0}")]
    InvalidMaxIdle(u64),

    #[error("max_session_hours must be between 1 and 720, got {0}")]
    InvalidMaxSessionHours(u64),

    #[error("heartbeat_secs must be between 1 and 3600, got {0}")]
    InvalidHeartbeat(u64),

    #[error("keepalive_secs must be between 1 and 3600, got {0}")]
    InvalidKeepalive(u64),

    #[error("default window must be non-zero, got {0}x{1}")]
    InvalidDefaultWindow(u16, u16),

    #[error("replay_size must be at most 1000, got {0}")]
    InvalidReplaySize(usize),

    #[error("idle_check_secs must be between 1 and 3600, got {0}")]
    InvalidIdleCheck(u64),

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General gateway configuration.
    pub gateway: GatewayConfig,

    /// Terminal session limits.
    pub terminal: TerminalConfig,

    /// Broadcast room settings.
    pub room: RoomConfig,

    /// Local backend settings.
    pub backend: BackendConfig,
}

/// General gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Name this gateway reports in logs and session records.
    pub name: String,

    /// Directory for gateway data (logs).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Write logs to daily files under `data_dir/logs` instead of stderr.
    /// Interactive shells always log to file.
    pub log_to_file: bool,
}

/// Terminal session limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminalConfig {
    /// Minutes without activity before a session is closed.
    pub max_idle_minutes: u64,

    /// Absolute session lifetime in hours.
    pub max_session_hours: u64,

    /// Idle seconds after which the backend is sent a keepalive.
    pub keepalive_secs: u64,

    /// Seconds between policy checks.
    pub heartbeat_secs: u64,

    /// Window width used when the front-end reports none.
    pub default_width: u16,

    /// Window height used when the front-end reports none.
    pub default_height: u16,
}

/// Broadcast room settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoomConfig {
    /// Recent output messages replayed to late observers.
    pub replay_size: usize,

    /// Seconds between empty-room checks.
    pub idle_check_secs: u64,
}

/// Local backend settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// Shell started for local sessions.
    pub shell: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            name: "kubejump".to_string(),
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_to_file: false,
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            max_idle_minutes: 60,
            max_session_hours: 24,
            keepalive_secs: 60,
            heartbeat_secs: 30,
            default_width: 80,
            default_height: 40,
        }
    }
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            replay_size: 5,
            idle_check_secs: 60,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
        }
    }
}

/// `<config dir>/kubejump/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kubejump")
        .join("config.toml")
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kubejump")
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

impl TerminalConfig {
    /// Window used when the front-end reports an empty one.
    pub fn default_window(&self) -> WindowSize {
        WindowSize::new(self.default_width, self.default_height)
    }
}

impl RoomConfig {
    /// Room options for new sessions.
    pub fn room_options(&self) -> RoomOptions {
        RoomOptions {
            replay_size: self.replay_size,
            idle_check: Duration::from_secs(self.idle_check_secs),
        }
    }
}

impl Config {
    /// Session limits for new sessions. Permission expiry is per connection
    /// and starts out as never.
    pub fn switch_options(&self) -> SwitchOptions {
        let t = &self.terminal;
        SwitchOptions {
            max_idle: Duration::from_secs(t.max_idle_minutes * 60),
            max_session_time: Duration::from_secs(t.max_session_hours * 60 * 60),
            heartbeat: Duration::from_secs(t.heartbeat_secs),
            keepalive: Duration::from_secs(t.keepalive_secs),
            expire: ExpireInfo::never(),
            room: self.room.room_options(),
        }
    }

    /// Lets the environment win over the file:
    /// - `KUBEJUMP_LOG_LEVEL` replaces the log level
    /// - `KUBEJUMP_MAX_IDLE_MINUTES` replaces the idle limit
    /// - `SERVER_HOSTNAME` prefixes the gateway name with the host it runs on
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("KUBEJUMP_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.gateway.log_level = level;
            }
        }

        if let Ok(minutes) = std::env::var("KUBEJUMP_MAX_IDLE_MINUTES") {
            match minutes.parse::<u64>() {
                Ok(minutes) => {
                    tracing::info!("Overriding max_idle_minutes from environment: {}", minutes);
                    self.terminal.max_idle_minutes = minutes;
                }
                Err(_) if minutes.is_empty() => {}
                Err(e) => {
                    tracing::warn!("Ignoring KUBEJUMP_MAX_IDLE_MINUTES={:?}: {}", minutes, e);
                }
            }
        }

        if let Ok(hostname) = std::env::var("SERVER_HOSTNAME") {
            if !hostname.is_empty() {
                self.gateway.name = format!("[{}]-{}", hostname, self.gateway.name);
            }
        }
    }

    /// Checks every value against its allowed range and that the shell can
    /// be found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }

        let t = &self.terminal;
        if !(1..=10_080).contains(&t.max_idle_minutes) {
            return Err(ConfigError::InvalidMaxIdle(t.max_idle_minutes));
        }
        if !(1..=720).contains(&t.max_session_hours) {
            return Err(ConfigError::InvalidMaxSessionHours(t.max_session_hours));
        }
        if !(1..=3600).contains(&t.heartbeat_secs) {
            return Err(ConfigError::InvalidHeartbeat(t.heartbeat_secs));
        }
        if !(1..=3600).contains(&t.keepalive_secs) {
            return Err(ConfigError::InvalidKeepalive(t.keepalive_secs));
        }
        if t.default_width == 0 || t.default_height == 0 {
            return Err(ConfigError::InvalidDefaultWindow(
                t.default_width,
                t.default_height,
            ));
        }

        if self.room.replay_size > 1000 {
            return Err(ConfigError::InvalidReplaySize(self.room.replay_size));
        }
        if !(1..=3600).contains(&self.room.idle_check_secs) {
            return Err(ConfigError::InvalidIdleCheck(self.room.idle_check_secs));
        }

        let shell_path = Path::new(&self.backend.shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&self.backend.shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(self.backend.shell.clone()));
        }

        let level = self.gateway.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.gateway.log_level.clone()));
        }

        Ok(())
    }

    /// Reads the gateway configuration at `path`.
    ///
    /// A missing file yields the defaults, so a fresh host runs without
    /// any setup.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No gateway config, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot read {}", path.display()));
            }
        };

        Self::from_toml(&contents).with_context(|| format!("Bad gateway config in {}", path.display()))
    }

    /// Parses a TOML document. Unknown keys are ignored.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| anyhow!("Malformed TOML: {}", describe_toml_error(&e)))
    }

    /// Writes the configuration to `path`, creating missing directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create {}", dir.display()))?;
        }

        fs::write(path, self.to_toml()?)
            .with_context(|| format!("Cannot write {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Gateway config written");
        Ok(())
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Cannot render gateway config")
    }
}

fn describe_toml_error(error: &toml::de::Error) -> String {
    match error.span() {
        Some(span) => format!("{} (bytes {}..{})", error.message(), span.start, span.end),
        None => error.message().to_string(),
    }
}
