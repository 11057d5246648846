//! Configuration file parsing for Mooring
//!
//! Parses `mooring.toml` using serde, then applies the environment
//! overrides (`SEND_NOTIFICATIONS`, `EMAIL_*`) on top.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mooring/mooring.toml";

/// Load configuration from a file
///
/// A missing file is only an error when the path was given explicitly;
/// otherwise the built-in defaults apply.
pub fn load(path: &Path, explicit: bool) -> Result<MooringConfig> {
    let mut config = if !explicit && !path.exists() {
        MooringConfig::default()
    } else {
        let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content)?
    };

    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;

    Ok(config)
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MooringConfig {
    /// Global settings
    #[serde(default)]
    pub config: GlobalConfig,

    /// Operator notifications
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Backoff between remount attempts
    #[serde(default)]
    pub retry: RetryConfig,

    /// Alert-storm throttle
    #[serde(default)]
    pub throttle: ThrottleConfig,
}

impl MooringConfig {
    /// Apply environment-style overrides through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let notify = &mut self.notifications;

        if let Some(value) = lookup("SEND_NOTIFICATIONS") {
            notify.enabled = parse_flag(&value);
        }
        if let Some(value) = lookup("EMAIL_SERVER") {
            notify.server = value.trim().to_string();
        }
        if let Some(value) = lookup("EMAIL_PORT") {
            notify.port = value.trim().parse().map_err(|_| {
                Error::ConfigValidation(format!("EMAIL_PORT is not a valid port: {}", value))
            })?;
        }
        if let Some(value) = lookup("EMAIL_FROM") {
            notify.from = value.trim().to_string();
        }
        if let Some(value) = lookup("EMAIL_TO") {
            notify.to = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let global = &self.config;

        if global.max_attempts == 0 {
            return Err(Error::ConfigValidation(
                "max_attempts must be at least 1".into(),
            ));
        }

        if global.probe_timeout_secs == 0
            || global.unmount_timeout_secs == 0
            || global.mount_timeout_secs == 0
        {
            return Err(Error::ConfigValidation(
                "timeouts must be greater than zero".into(),
            ));
        }

        if global.sentinel_file.is_empty() || global.sentinel_file.contains('/') {
            return Err(Error::ConfigValidation(format!(
                "Invalid sentinel file name: '{}'",
                global.sentinel_file
            )));
        }

        if !(1..=59).contains(&global.cron_interval) {
            return Err(Error::ConfigValidation(format!(
                "cron_interval must be between 1 and 59 minutes, got {}",
                global.cron_interval
            )));
        }

        if self.notifications.enabled && self.notifications.to.is_empty() {
            return Err(Error::ConfigValidation(
                "Notifications are enabled but no recipients are configured".into(),
            ));
        }

        if self.throttle.burst < 1.0 || self.throttle.refill_per_hour < 0.0 {
            return Err(Error::ConfigValidation(
                "throttle burst must be >= 1 and refill_per_hour >= 0".into(),
            ));
        }

        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Global configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    /// Static mount table listing the shares to watch
    #[serde(default = "default_fstab")]
    pub fstab: PathBuf,

    /// Live kernel mount table
    #[serde(default = "default_live_table")]
    pub live_table: PathBuf,

    /// Operator-placed marker file at each share root
    #[serde(default = "default_sentinel_file")]
    pub sentinel_file: String,

    /// Bound on each filesystem probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Bound on each unmount stage
    #[serde(default = "default_unmount_timeout")]
    pub unmount_timeout_secs: u64,

    /// Bound on each mount command
    #[serde(default = "default_mount_timeout")]
    pub mount_timeout_secs: u64,

    /// Pause after mount table changes before verifying them
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Remount attempts per mount per cycle
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,

    /// Residual files listed after an unmount
    #[serde(default = "default_residual_listing")]
    pub residual_listing: usize,

    /// Create missing mountpoint directories before probing
    #[serde(default = "default_true")]
    pub create_missing_mountpoints: bool,

    /// Last-known status ledger
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Append-only audit log
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,

    /// Lock held for the duration of a cycle
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// Optional JSON log file (in addition to stderr)
    pub log_file: Option<PathBuf>,

    /// Scheduler interval in minutes
    #[serde(default = "default_cron_interval")]
    pub cron_interval: u32,
}

impl GlobalConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn unmount_timeout(&self) -> Duration {
        Duration::from_secs(self.unmount_timeout_secs)
    }

    pub fn mount_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            fstab: default_fstab(),
            live_table: default_live_table(),
            sentinel_file: default_sentinel_file(),
            probe_timeout_secs: default_probe_timeout(),
            unmount_timeout_secs: default_unmount_timeout(),
            mount_timeout_secs: default_mount_timeout(),
            settle_ms: default_settle_ms(),
            max_attempts: default_max_attempts(),
            residual_listing: default_residual_listing(),
            create_missing_mountpoints: true,
            state_file: default_state_file(),
            audit_log: default_audit_log(),
            lock_file: default_lock_file(),
            log_file: None,
            cron_interval: default_cron_interval(),
        }
    }
}

fn default_fstab() -> PathBuf {
    PathBuf::from("/etc/fstab")
}

fn default_live_table() -> PathBuf {
    PathBuf::from("/proc/self/mounts")
}

fn default_sentinel_file() -> String {
    ".checkMount".to_string()
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_unmount_timeout() -> u64 {
    30
}

fn default_mount_timeout() -> u64 {
    60
}

fn default_settle_ms() -> u64 {
    2000
}

fn default_max_attempts() -> u8 {
    3
}

fn default_residual_listing() -> usize {
    20
}

fn default_true() -> bool {
    true
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/mooring/status.json")
}

fn default_audit_log() -> PathBuf {
    PathBuf::from("/var/log/mooring/audit.jsonl")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/run/mooring.lock")
}

fn default_cron_interval() -> u32 {
    5
}

/// Which outcomes produce a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NotifyPolicy {
    /// Only status changes against the last-known status ledger
    #[default]
    Transitions,
    /// Every broken or failed-remount outcome, every cycle
    EveryFailure,
}

/// Notification settings
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// Send email at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// SMTP relay host
    #[serde(default = "default_server")]
    pub server: String,

    /// SMTP relay port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Sender address
    #[serde(default = "default_from")]
    pub from: String,

    /// Recipient addresses
    #[serde(default = "default_to")]
    pub to: Vec<String>,

    /// Transition-only or every-failure alerting
    #[serde(default, alias = "notify_policy")]
    pub policy: NotifyPolicy,

    /// SMTP conversation timeout in seconds
    #[serde(default = "default_smtp_timeout")]
    pub timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server: default_server(),
            port: default_port(),
            from: default_from(),
            to: default_to(),
            policy: NotifyPolicy::default(),
            timeout_secs: default_smtp_timeout(),
        }
    }
}

fn default_server() -> String {
    "mail".to_string()
}

fn default_port() -> u16 {
    25
}

fn default_from() -> String {
    "noreply@example.com".to_string()
}

fn default_to() -> Vec<String> {
    vec!["admin@example.com".to_string()]
}

fn default_smtp_timeout() -> u64 {
    30
}

/// Exponential backoff between remount attempts
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Base delay in milliseconds before the second attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds between attempts
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter factor (0.0-1.0) to randomize delays
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

/// Token bucket limiting summary emails
#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    /// Emails that may go out back to back
    #[serde(default = "default_burst")]
    pub burst: f64,

    /// Tokens regained per hour
    #[serde(default = "default_refill_per_hour")]
    pub refill_per_hour: f64,
}

impl ThrottleConfig {
    /// Refill rate in tokens per second
    pub fn refill_rate(&self) -> f64 {
        self.refill_per_hour / 3600.0
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            burst: default_burst(),
            refill_per_hour: default_refill_per_hour(),
        }
    }
}

fn default_burst() -> f64 {
    5.0
}

fn default_refill_per_hour() -> f64 {
    4.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = MooringConfig::default();
        assert_eq!(config.config.sentinel_file, ".checkMount");
        assert_eq!(config.config.max_attempts, 3);
        assert_eq!(config.config.cron_interval, 5);
        assert_eq!(config.notifications.port, 25);
        assert_eq!(config.notifications.policy, NotifyPolicy::Transitions);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_file() {
        let toml = r#"
[config]
max_attempts = 1
probe_timeout_secs = 3
sentinel_file = ".alive"

[notifications]
server = "smtp.internal"
to = ["ops@example.com", "oncall@example.com"]
policy = "every_failure"

[throttle]
burst = 2.0
"#;

        let config: MooringConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.config.max_attempts, 1);
        assert_eq!(config.config.probe_timeout(), Duration::from_secs(3));
        assert_eq!(config.config.sentinel_file, ".alive");
        assert_eq!(config.config.fstab, PathBuf::from("/etc/fstab"));
        assert_eq!(config.notifications.server, "smtp.internal");
        assert_eq!(config.notifications.to.len(), 2);
        assert_eq!(config.notifications.policy, NotifyPolicy::EveryFailure);
        assert_eq!(config.throttle.burst, 2.0);
        assert_eq!(config.throttle.refill_per_hour, 4.0);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SEND_NOTIFICATIONS", "no"),
            ("EMAIL_SERVER", "relay"),
            ("EMAIL_PORT", "2525"),
            ("EMAIL_FROM", "mounts@host"),
            ("EMAIL_TO", "a@example.com, b@example.com,"),
        ]
        .into_iter()
        .collect();

        let mut config = MooringConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert!(!config.notifications.enabled);
        assert_eq!(config.notifications.server, "relay");
        assert_eq!(config.notifications.port, 2525);
        assert_eq!(config.notifications.from, "mounts@host");
        assert_eq!(
            config.notifications.to,
            vec!["a@example.com".to_string(), "b@example.com".to_string()]
        );
    }

    #[test]
    fn test_env_bad_port() {
        let mut config = MooringConfig::default();
        let result = config.apply_env(|key| (key == "EMAIL_PORT").then(|| "smtp".to_string()));
        assert!(matches!(result, Err(Error::ConfigValidation(_))));
    }

    #[test]
    fn test_flag_parsing() {
        for yes in ["1", "true", "YES", "on"] {
            assert!(parse_flag(yes));
        }
        for no in ["0", "false", "off", ""] {
            assert!(!parse_flag(no));
        }
    }

    #[test]
    fn test_validation_failures() {
        let mut config = MooringConfig::default();
        config.config.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = MooringConfig::default();
        config.config.sentinel_file = "a/b".to_string();
        assert!(config.validate().is_err());

        let mut config = MooringConfig::default();
        config.config.cron_interval = 60;
        assert!(config.validate().is_err());

        let mut config = MooringConfig::default();
        config.notifications.to.clear();
        assert!(config.validate().is_err());
        config.notifications.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_default_uses_defaults() {
        let config = load(Path::new("/nonexistent/mooring.toml"), false).unwrap();
        assert_eq!(config.config.max_attempts, 3);
    }

    #[test]
    fn test_load_missing_explicit_fails() {
        let err = load(Path::new("/nonexistent/mooring.toml"), true).unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }
}
