//! Bridge configuration
//!
//! Defaults used by the russh transport when a session does not set the
//! corresponding option. Stored as JSON next to the other OxideTerm config
//! files: `~/.oxideterm/ssh-bridge.json` (`%APPDATA%\OxideTerm` on Windows).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn default_timeout() -> u64 {
    30
}

fn default_keepalive() -> u64 {
    30
}

fn default_ssh_dir() -> PathBuf {
    PathBuf::from("~/.ssh")
}

fn default_log_filter() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Connect timeout when the session sets no `timeout`
    #[serde(default = "default_timeout")]
    pub connect_timeout_secs: u64,

    /// Interval of transport-level keepalives once connected
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,

    #[serde(default = "default_ssh_dir")]
    pub ssh_dir: PathBuf,

    /// Known hosts file; `<ssh_dir>/known_hosts` when unset
    #[serde(default)]
    pub known_hosts: Option<PathBuf>,

    /// Default `tracing` filter, see [`BridgeConfig::init_logging`]
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_timeout(),
            keepalive_interval_secs: default_keepalive(),
            ssh_dir: default_ssh_dir(),
            known_hosts: None,
            log_filter: default_log_filter(),
        }
    }
}

/// Expand ~ to home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

/// OxideTerm configuration directory
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("OxideTerm"));
        }
    }

    dirs::home_dir()
        .map(|home| home.join(".oxideterm"))
        .ok_or(ConfigError::NoConfigDir)
}

impl BridgeConfig {
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(config_dir()?.join("ssh-bridge.json"))
    }

    /// Load from the default location
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load from `path`
    ///
    /// A missing file gives the defaults. A corrupted file is logged and
    /// also gives the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<BridgeConfig>(&contents) {
                Ok(config) => Ok(config),
                Err(e) => {
                    tracing::warn!("Config file {:?} corrupted, using defaults: {}", path, e);
                    Ok(Self::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Like [`BridgeConfig::load`], but never fails
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load bridge config: {}", e);
            Self::default()
        })
    }

    /// Save to `path` (write to temp file, then rename)
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, serde_json::to_string_pretty(self)?)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// SSH directory with `~` expanded
    pub fn ssh_dir(&self) -> PathBuf {
        expand_tilde(&self.ssh_dir)
    }

    /// Known hosts file with `~` expanded
    pub fn known_hosts_path(&self) -> PathBuf {
        match &self.known_hosts {
            Some(path) => expand_tilde(path),
            None => self.ssh_dir().join("known_hosts"),
        }
    }

    /// Install the logging subscriber with this config's filter
    pub fn init_logging(&self) {
        crate::logging::init_logging(&self.log_filter);
    }
}
