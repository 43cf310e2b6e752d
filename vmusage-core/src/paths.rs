//! Centralized path configuration for vmusage.
//!
//! The daemon and the CLI resolve default locations through this module so
//! both agree on where the config and the usage logs live.

use std::path::PathBuf;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "VMUSAGE_CONFIG";

/// Get the config file path.
///
/// Resolution order:
/// 1. `VMUSAGE_CONFIG` environment variable
/// 2. `/etc/vmusage/config.json`
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/vmusage/config.json"))
}

/// Default directory for hourly usage logs.
pub fn default_usage_log_dir() -> PathBuf {
    PathBuf::from("/var/log/vmusage")
}
