//! Configuration for a [`QueueManager`](crate::QueueManager).
//!
//! Settings cover polling cadence, job defaults applied at publish time,
//! the background maintenance sweep, handler error reporting and logging.
//! Configuration can be built in code, loaded from TOML, or read from
//! `JOBWARDEN_*` environment variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serializes `std::time::Duration` as human-readable strings.
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(D::Error::custom)
    }
}

/// Parse a duration string like `"500ms"`, `"30s"`, `"5m"`, `"1h"`, `"2d"` or `"90"` (seconds).
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    if let Some(millis) = s.strip_suffix("ms") {
        return millis
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| format!("Invalid number in duration: {}", millis));
    }

    if s.len() < 2 {
        return Err(format!("Invalid duration format: {}", s));
    }

    let (num_str, suffix) = s.split_at(s.len() - 1);
    let num: u64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

    let unit = match suffix {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => {
            return Err(format!(
                "Invalid duration suffix: {}. Use ms, s, m, h, or d",
                suffix
            ));
        }
    };

    num.checked_mul(unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("Duration out of range: {}", s))
}

fn parse_var<T>(key: &str, value: &str) -> crate::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| crate::JobwardenError::Config(format!("{}: {} ({})", key, e, value)))
}

/// Inverse of [`parse_duration`] using the largest whole unit.
pub fn format_duration(duration: Duration) -> String {
    if duration.subsec_millis() != 0 || (duration.as_secs() == 0 && !duration.is_zero()) {
        return format!("{}ms", duration.as_millis());
    }

    let secs = duration.as_secs();
    if secs == 0 {
        "0s".to_string()
    } else if secs % 86400 == 0 {
        format!("{}d", secs / 86400)
    } else if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Main configuration for a queue manager.
///
/// # Examples
///
/// ```rust
/// use jobwarden::config::ManagerConfig;
/// use std::time::Duration;
///
/// let config = ManagerConfig::new()
///     .with_new_job_check_interval(Duration::from_millis(500))
///     .with_expire_in(Duration::from_secs(300))
///     .with_retry_limit(2);
///
/// assert_eq!(config.defaults.retry_limit, 2);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ManagerConfig {
    /// What happens to errors returned or raised by subscriber handlers.
    pub callback_errors: CallbackErrorPolicy,
    pub polling: PollingConfig,
    pub defaults: JobDefaults,
    pub maintenance: MaintenanceConfig,
    pub logging: LoggingConfig,
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_new_job_check_interval(mut self, interval: Duration) -> Self {
        self.polling.new_job_check_interval = interval;
        self
    }

    pub fn with_error_channel_capacity(mut self, capacity: usize) -> Self {
        self.polling.error_channel_capacity = capacity;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.defaults.retry_limit = retry_limit;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.defaults.retry_delay = delay;
        self
    }

    pub fn with_expire_in(mut self, expire_in: Duration) -> Self {
        self.defaults.expire_in = expire_in;
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance.interval = interval;
        self
    }

    pub fn with_maintenance_enabled(mut self, enabled: bool) -> Self {
        self.maintenance.enabled = enabled;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.maintenance.retention = retention;
        self
    }

    pub fn with_callback_errors(mut self, policy: CallbackErrorPolicy) -> Self {
        self.callback_errors = policy;
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &str) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from environment variables
    pub fn from_env() -> crate::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup using the `JOBWARDEN_*` names.
    pub fn from_lookup<F>(lookup: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let duration = |key: &str| -> crate::Result<Option<Duration>> {
            lookup(key)
                .map(|value| {
                    parse_duration(&value)
                        .map_err(|e| crate::JobwardenError::Config(format!("{}: {}", key, e)))
                })
                .transpose()
        };

        if let Some(interval) = duration("JOBWARDEN_NEW_JOB_CHECK_INTERVAL")? {
            config.polling.new_job_check_interval = interval;
        }
        if let Some(capacity) = lookup("JOBWARDEN_ERROR_CHANNEL_CAPACITY") {
            config.polling.error_channel_capacity =
                parse_var("JOBWARDEN_ERROR_CHANNEL_CAPACITY", &capacity)?;
        }

        if let Some(retry_limit) = lookup("JOBWARDEN_RETRY_LIMIT") {
            config.defaults.retry_limit = parse_var("JOBWARDEN_RETRY_LIMIT", &retry_limit)?;
        }
        if let Some(delay) = duration("JOBWARDEN_RETRY_DELAY")? {
            config.defaults.retry_delay = delay;
        }
        if let Some(expire_in) = duration("JOBWARDEN_EXPIRE_IN")? {
            config.defaults.expire_in = expire_in;
        }

        if let Some(enabled) = lookup("JOBWARDEN_MAINTENANCE_ENABLED") {
            config.maintenance.enabled = parse_var("JOBWARDEN_MAINTENANCE_ENABLED", &enabled)?;
        }
        if let Some(interval) = duration("JOBWARDEN_MAINTENANCE_INTERVAL")? {
            config.maintenance.interval = interval;
        }
        if let Some(retention) = duration("JOBWARDEN_RETENTION")? {
            config.maintenance.retention = retention;
        }

        if let Some(policy) = lookup("JOBWARDEN_CALLBACK_ERRORS") {
            config.callback_errors = match policy.to_lowercase().as_str() {
                "report" => CallbackErrorPolicy::Report,
                "ignore" => CallbackErrorPolicy::Ignore,
                other => {
                    return Err(crate::JobwardenError::Config(format!(
                        "JOBWARDEN_CALLBACK_ERRORS: unknown policy {}",
                        other
                    )));
                }
            };
        }

        if let Some(level) = lookup("JOBWARDEN_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(json) = lookup("JOBWARDEN_LOG_JSON") {
            config.logging.json = parse_var("JOBWARDEN_LOG_JSON", &json)?;
        }

        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollingConfig {
    /// Default poll cadence for subscriptions that do not override it.
    #[serde(with = "duration_str")]
    pub new_job_check_interval: Duration,
    /// Buffered error events per manager before slow receivers start lagging.
    pub error_channel_capacity: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            new_job_check_interval: Duration::from_secs(1),
            error_channel_capacity: 256,
        }
    }
}

/// Defaults applied to published jobs that leave an option unset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobDefaults {
    pub retry_limit: u32,
    #[serde(with = "duration_str")]
    pub retry_delay: Duration,
    pub retry_backoff: bool,
    #[serde(with = "duration_str")]
    pub expire_in: Duration,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            retry_limit: 0,
            retry_delay: Duration::ZERO,
            retry_backoff: false,
            expire_in: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    #[serde(with = "duration_str")]
    pub interval: Duration,
    /// Terminal jobs older than this are purged.
    #[serde(with = "duration_str")]
    pub retention: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            retention: Duration::from_secs(7 * 86400),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallbackErrorPolicy {
    /// Publish handler failures on the manager's error channel.
    #[default]
    Report,
    /// Log handler failures at debug level only.
    Ignore,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            with_target: true,
        }
    }
}
