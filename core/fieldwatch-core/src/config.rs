//! Runtime configuration.
//!
//! Loaded from `~/.fieldwatch/daemon/fieldwatch.toml` (or `FIELDWATCH_CONFIG`).
//! Every section and key is optional; missing values take the defaults below.

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use crate::error::{FieldwatchError, Result};

pub const CONFIG_ENV: &str = "FIELDWATCH_CONFIG";
const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".fieldwatch/daemon/fieldwatch.toml";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FieldwatchConfig {
    pub location: LocationConfig,
    pub compliance: ComplianceConfig,
    pub alerts: AlertConfig,
    pub dispatcher: DispatcherConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LocationConfig {
    pub accuracy_threshold_m: f64,
    pub history_capacity: usize,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            accuracy_threshold_m: 50.0,
            history_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ComplianceConfig {
    pub tick_interval_secs: u64,
    pub emergency_debounce_secs: i64,
    pub check_in_debounce_secs: i64,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            emergency_debounce_secs: 3,
            check_in_debounce_secs: 10,
        }
    }
}

impl ComplianceConfig {
    pub fn tick_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.tick_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AlertConfig {
    pub escalation_window_secs: i64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            escalation_window_secs: 5 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    pub mailbox_capacity: usize,
    pub max_delivery_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            mailbox_capacity: 256,
            max_delivery_attempts: 5,
            retry_base_ms: 250,
            retry_max_ms: 10_000,
        }
    }
}

/// Which alert families are pushed to supervisor sessions.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct NotificationConfig {
    pub emergency_alerts: bool,
    pub missed_check_ins: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            emergency_alerts: true,
            missed_check_ins: true,
        }
    }
}

/// Returns the config path, honoring `FIELDWATCH_CONFIG`.
pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(path) = env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::home_dir().map(|home| home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

/// Loads configuration from `path` (or the default location).
///
/// A missing file is not an error: defaults are returned.
pub fn load_config(path: Option<&Path>) -> Result<FieldwatchConfig> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) => path,
            None => return Ok(FieldwatchConfig::default()),
        },
    };

    if !config_path.exists() {
        return Ok(FieldwatchConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| FieldwatchError::Io {
        context: format!("reading {}", config_path.display()),
        source,
    })?;
    parse_config(&content).map_err(|details| FieldwatchError::ConfigMalformed {
        path: config_path,
        details,
    })
}

pub fn parse_config(content: &str) -> std::result::Result<FieldwatchConfig, String> {
    let config: FieldwatchConfig = toml::from_str(content).map_err(|err| err.to_string())?;
    let threshold = config.location.accuracy_threshold_m;
    if threshold.is_nan() || threshold <= 0.0 {
        return Err("location.accuracy_threshold_m must be positive".to_string());
    }
    if config.location.history_capacity == 0 {
        return Err("location.history_capacity must be at least 1".to_string());
    }
    if config.dispatcher.queue_capacity == 0 || config.dispatcher.mailbox_capacity == 0 {
        return Err("dispatcher capacities must be at least 1".to_string());
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("missing.toml");
        let config = load_config(Some(&path)).expect("load config");
        assert_eq!(config, FieldwatchConfig::default());
        assert_eq!(config.location.accuracy_threshold_m, 50.0);
        assert_eq!(config.compliance.tick_interval_secs, 60);
        assert_eq!(config.alerts.escalation_window_secs, 300);
    }

    #[test]
    fn partial_file_overrides_only_given_keys() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("fieldwatch.toml");
        fs_err::write(
            &path,
            r#"
[location]
accuracy_threshold_m = 25.0

[compliance]
tick_interval_secs = 15

[notifications]
missed_check_ins = false
"#,
        )
        .expect("write config");

        let config = load_config(Some(&path)).expect("load config");
        assert_eq!(config.location.accuracy_threshold_m, 25.0);
        assert_eq!(config.location.history_capacity, 100);
        assert_eq!(config.compliance.tick_interval_secs, 15);
        assert_eq!(config.compliance.emergency_debounce_secs, 3);
        assert!(config.notifications.emergency_alerts);
        assert!(!config.notifications.missed_check_ins);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("fieldwatch.toml");
        fs_err::write(&path, "[location]\nradius = 3\n").expect("write config");

        let err = load_config(Some(&path)).expect_err("should fail");
        assert!(matches!(err, FieldwatchError::ConfigMalformed { .. }));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = parse_config("[location]\nhistory_capacity = 0\n").expect_err("should fail");
        assert!(err.contains("history_capacity"));
    }
}
