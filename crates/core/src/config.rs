//! TOML-based configuration for repotrack.
//!
//! Every field has a default, so an absent or empty file yields a working
//! configuration. Use [`AppConfig::load_or_default`] for optional files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::models::BackendKind;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Change saver settings.
    #[serde(default)]
    pub saver: SaverConfig,

    /// Repository tracker settings.
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Notification sinks.
    #[serde(default)]
    pub notifications: NotificationConfig,
}

fn default_log_level() -> String {
    "warn".into()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            saver: SaverConfig::default(),
            tracker: TrackerConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Saver
// ---------------------------------------------------------------------------

/// Change saver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaverConfig {
    /// Which backend sets changes aside.
    #[serde(default)]
    pub backend: BackendKind,

    /// Marker embedded in stash messages so open sets can be found again.
    #[serde(default = "default_marker")]
    pub marker: String,

    /// Also save untracked (non-ignored) files.
    #[serde(default = "default_true")]
    pub include_untracked: bool,

    /// Where shelf files go. Defaults to `<git dir>/repotrack/shelf`.
    #[serde(default)]
    pub shelf_dir: Option<PathBuf>,
}

fn default_marker() -> String {
    "[repotrack]".into()
}
fn default_true() -> bool {
    true
}

impl Default for SaverConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            marker: default_marker(),
            include_untracked: true,
            shelf_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Repository tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Seconds between `update()` calls in watch mode (default 2).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval() -> u64 {
    2
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
        }
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Notification sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Emit notifications through the tracing log.
    #[serde(default = "default_true")]
    pub log: bool,

    /// Command run for every notification (body on stdin).
    #[serde(default)]
    pub hook_command: Option<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            log: true,
            hook_command: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise return the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            let config = Self::load_from_file(path)?;
            config.validate()?;
            Ok(config)
        } else {
            debug!(path = %path.display(), "no configuration file, using defaults");
            Ok(Self::default())
        }
    }

    /// Validate that values are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "log_level".into(),
                detail: format!("expected one of {}", LOG_LEVELS.join(", ")),
            });
        }
        if self.saver.marker.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "saver.marker".into(),
                detail: "marker must not be empty".into(),
            });
        }
        if self.tracker.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tracker.poll_interval_secs".into(),
                detail: "poll interval must be > 0".into(),
            });
        }
        if let Some(ref cmd) = self.notifications.hook_command {
            if cmd.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "notifications.hook_command".into(),
                    detail: "hook command must not be blank".into(),
                });
            }
        }
        Ok(())
    }

    /// Serialize to pretty TOML (used by `repotrack init`).
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}
