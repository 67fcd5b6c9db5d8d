use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::models::Platform;

/// Errors raised while reading or writing the configuration file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Configuration for the authwatch daemon
///
/// Read once at startup and passed by reference to whatever needs it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log source and detection settings
    pub detection: DetectionConfig,
    /// Desktop notification settings
    pub notifications: NotificationConfig,
    /// Audit log settings
    pub logging: LoggingConfig,
}

/// Log source and detection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Watch the systemd journal on Linux
    pub linux_enabled: bool,
    /// Watch the Security event log on Windows
    pub windows_enabled: bool,
    /// Systemd units whose journal is followed
    pub journal_units: Vec<String>,
    /// Interval between security log polls in milliseconds
    pub poll_interval_ms: u64,
    /// First delay before respawning a dead journal follower
    pub respawn_initial_delay_ms: u64,
    /// Upper bound for the respawn delay
    pub respawn_max_delay_ms: u64,
    /// Consecutive failed respawns tolerated before giving up
    pub respawn_max_attempts: u32,
    /// Uptime after which a follower that dies no longer counts as a failed respawn
    pub respawn_healthy_after_ms: u64,
}

/// Desktop notification settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub title: String,
}

/// Audit log settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    /// Directory holding the audit log, created when missing
    pub directory: PathBuf,
    pub file_name: String,
    /// Write JSON lines instead of plain text
    pub json_format: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        DetectionConfig {
            linux_enabled: true,
            windows_enabled: true,
            journal_units: vec!["ssh".to_string(), "sshd".to_string()],
            poll_interval_ms: 1000,
            respawn_initial_delay_ms: 250,
            respawn_max_delay_ms: 30_000,
            respawn_max_attempts: 8,
            respawn_healthy_after_ms: 10_000,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        NotificationConfig {
            enabled: true,
            title: "Intrusion Alert".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            enabled: true,
            directory: PathBuf::from("logs"),
            file_name: "intrusion_detection.log".to_string(),
            json_format: false,
        }
    }
}

impl DetectionConfig {
    /// Whether detection is enabled for the given platform
    pub fn platform_enabled(&self, platform: Platform) -> bool {
        match platform {
            Platform::Linux => self.linux_enabled,
            Platform::Windows => self.windows_enabled,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl LoggingConfig {
    /// Full path of the audit log file
    pub fn file_path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults
    ///
    /// A missing file is not an error. An unreadable or invalid file is
    /// reported and replaced by the defaults.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            log::info!("Config file {:?} not found, using defaults", path);
            return Config::default();
        }

        match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Could not load config {:?}: {}. Using defaults", path, e);
                Config::default()
            }
        }
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}
