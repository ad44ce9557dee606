//! Configuration parsing, validation, and environment overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::retry::Backoff;
use crate::{AppError, Result};

/// Environment variable that disables reaping for every session when `true`.
pub const ENV_REAPER_DISABLED: &str = "BERTH_REAPER_DISABLED";

/// Environment variable overriding the host used to reach mapped ports.
pub const ENV_HOST: &str = "BERTH_HOST";

/// File name looked up in the user's home directory by [`BerthConfig::discover`].
pub const CONFIG_FILE_NAME: &str = ".berth.toml";

/// Reaper provisioning and watchdog settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ReaperConfig {
    /// Disable reaping globally. Resources are then only cleaned up by explicit terminate.
    #[serde(default)]
    pub disabled: bool,
    /// Image the reaper resource is created from.
    #[serde(default = "default_reaper_image")]
    pub image: String,
    /// Control port the reaper listens on inside its resource.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// How long to keep dialing the control port while the reaper boots.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    /// Interval between client keep-alive pings.
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_seconds: u64,
    /// Silence after which the reaper considers a control connection lost.
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_seconds: u64,
    /// Delay between losing the last connection and sweeping; 0 sweeps immediately.
    #[serde(default)]
    pub sweep_grace_seconds: u64,
    /// Reaper exits if no connection arrives within this window.
    #[serde(default = "default_initial_connect_timeout")]
    pub initial_connect_timeout_seconds: u64,
}

fn default_reaper_image() -> String {
    "berth/reaper:0.1".into()
}

fn default_control_port() -> u16 {
    8080
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_keepalive_interval() -> u64 {
    10
}

fn default_peer_timeout() -> u64 {
    60
}

fn default_initial_connect_timeout() -> u64 {
    60
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            image: default_reaper_image(),
            control_port: default_control_port(),
            connect_timeout_seconds: default_connect_timeout(),
            keepalive_interval_seconds: default_keepalive_interval(),
            peer_timeout_seconds: default_peer_timeout(),
            sweep_grace_seconds: 0,
            initial_connect_timeout_seconds: default_initial_connect_timeout(),
        }
    }
}

impl ReaperConfig {
    /// Dial window for the control connection.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Keep-alive ping interval.
    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_seconds)
    }

    /// Peer liveness timeout enforced by the reaper.
    #[must_use]
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_seconds)
    }

    /// Grace period before a sweep.
    #[must_use]
    pub fn sweep_grace(&self) -> Duration {
        Duration::from_secs(self.sweep_grace_seconds)
    }

    /// Window for the first connection to arrive.
    #[must_use]
    pub fn initial_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.initial_connect_timeout_seconds)
    }
}

/// Log producer reconnection settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LogsConfig {
    /// Attempts to re-issue the log request after a transient failure.
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    /// First retry delay.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_millis: u64,
    /// Retry delay cap.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_millis: u64,
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    5_000
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: default_reconnect_attempts(),
            initial_backoff_millis: default_initial_backoff(),
            max_backoff_millis: default_max_backoff(),
        }
    }
}

impl LogsConfig {
    /// Backoff policy for re-issuing log requests.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.initial_backoff_millis),
            Duration::from_millis(self.max_backoff_millis),
            self.reconnect_attempts,
        )
    }
}

/// Crate configuration parsed from `~/.berth.toml` or an explicit path.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BerthConfig {
    /// Host used to reach mapped ports; falls back to the engine's daemon host.
    #[serde(default)]
    pub host: Option<String>,
    /// Reaper settings.
    #[serde(default)]
    pub reaper: ReaperConfig,
    /// Log producer settings.
    #[serde(default)]
    pub logs: LogsConfig,
}

impl BerthConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `~/.berth.toml` when present, otherwise defaults, then apply
    /// environment overrides.
    ///
    /// A present but invalid file is reported, never silently replaced.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file exists but is invalid.
    pub fn discover() -> Result<Self> {
        let mut config = match home_config_path() {
            Some(path) if path.is_file() => {
                debug!(path = %path.display(), "loading berth config");
                Self::load_from_path(&path)?
            }
            _ => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply environment-style overrides using `lookup` to read variables.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup(ENV_REAPER_DISABLED) {
            match value.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => self.reaper.disabled = true,
                "false" | "0" | "" => self.reaper.disabled = false,
                other => warn!(
                    value = other,
                    "ignoring unrecognized {ENV_REAPER_DISABLED} value"
                ),
            }
        }

        if let Some(host) = lookup(ENV_HOST) {
            let host = host.trim();
            if !host.is_empty() {
                self.host = Some(host.to_owned());
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.reaper.image.trim().is_empty() {
            return Err(AppError::Config("reaper.image must not be empty".into()));
        }

        if self.reaper.control_port == 0 {
            return Err(AppError::Config(
                "reaper.control_port must be greater than zero".into(),
            ));
        }

        if self.reaper.keepalive_interval_seconds == 0 {
            return Err(AppError::Config(
                "reaper.keepalive_interval_seconds must be greater than zero".into(),
            ));
        }

        if self.reaper.keepalive_interval_seconds >= self.reaper.peer_timeout_seconds {
            return Err(AppError::Config(
                "reaper.keepalive_interval_seconds must be less than reaper.peer_timeout_seconds"
                    .into(),
            ));
        }

        if self.logs.initial_backoff_millis > self.logs.max_backoff_millis {
            return Err(AppError::Config(
                "logs.initial_backoff_millis must not exceed logs.max_backoff_millis".into(),
            ));
        }

        Ok(())
    }
}

fn home_config_path() -> Option<PathBuf> {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(|home| PathBuf::from(home).join(CONFIG_FILE_NAME))
}
