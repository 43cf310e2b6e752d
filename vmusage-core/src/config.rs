//! Configuration management.
//!
//! The daemon reads a JSON file with camelCase keys. Every key is optional.

use crate::error::{Result, UsageError};
use crate::paths;
use crate::scheduler::TickPlan;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration for vmusage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Directory holding the hourly usage logs and their archives.
    pub usage_log_directory: PathBuf,
    /// Legacy single-rate mode: collect and write every `interval_seconds`.
    pub interval_seconds: Option<u64>,
    /// Legacy single-rate mode: compaction cadence.
    pub rotate_interval_seconds: Option<u64>,
    pub log_level: String,
    /// Serve Prometheus metrics on this port when set.
    pub metrics_port: Option<u16>,
    /// Program printing host identity as JSON.
    pub sysinfo_command: PathBuf,
    /// Program printing one JSON usage object per VM per line.
    pub collector_command: PathBuf,
    pub collector_args: Vec<String>,
    /// Cap on every host command invocation.
    pub command_timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            usage_log_directory: paths::default_usage_log_dir(),
            interval_seconds: None,
            rotate_interval_seconds: None,
            log_level: "info".to_string(),
            metrics_port: None,
            sysinfo_command: PathBuf::from("/usr/bin/sysinfo"),
            collector_command: PathBuf::from("/usr/libexec/vmusage-collect"),
            collector_args: Vec::new(),
            command_timeout_seconds: 60,
        }
    }
}

impl Config {
    /// Load configuration from an explicit path, or from the default location.
    ///
    /// A missing file at the default location yields the defaults; a missing
    /// file that was asked for explicitly is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = paths::config_path();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| UsageError::InvalidConfig {
            reason: format!("Failed to read config {}: {}", path.display(), e),
        })?;
        serde_json::from_str(&content).map_err(|e| UsageError::InvalidConfig {
            reason: format!("Failed to parse config {}: {}", path.display(), e),
        })
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.usage_log_directory.as_os_str().is_empty() {
            return Err(UsageError::InvalidConfig {
                reason: "usageLogDirectory must not be empty".to_string(),
            });
        }
        for (key, value) in [
            ("intervalSeconds", self.interval_seconds),
            ("rotateIntervalSeconds", self.rotate_interval_seconds),
            ("commandTimeoutSeconds", Some(self.command_timeout_seconds)),
        ] {
            if value == Some(0) {
                return Err(UsageError::InvalidConfig {
                    reason: format!("{} must be greater than zero", key),
                });
            }
        }
        Ok(())
    }

    /// Scheduler cadence: quarter-minute ticks with a write each minute, or a
    /// single rate when `intervalSeconds` is set.
    pub fn tick_plan(&self) -> TickPlan {
        match self.interval_seconds {
            Some(secs) => TickPlan::single_rate(secs),
            None => TickPlan::default(),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let json = r#"{ "usageLogDirectory": "/var/run/sdc-usage", "intervalSeconds": 60 }"#;
        std::fs::write(&path, json).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.usage_log_directory, PathBuf::from("/var/run/sdc-usage"));
        assert_eq!(config.interval_seconds, Some(60));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.command_timeout(), Duration::from_secs(60));
        assert_eq!(config.tick_plan(), TickPlan::single_rate(60));
    }

    #[test]
    fn test_default_plan_is_quarter_minute() {
        assert_eq!(Config::default().tick_plan(), TickPlan::default());
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(Some(&dir.path().join("nope.json"))).unwrap_err();
        assert!(matches!(err, UsageError::InvalidConfig { .. }));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = Config { interval_seconds: Some(0), ..Config::default() };
        assert!(config.validate().is_err());

        let config = Config { usage_log_directory: PathBuf::new(), ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_json_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(Config::from_file(&path).is_err());
    }
}
