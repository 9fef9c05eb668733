//! Argument checks run before any store interaction.

use crate::{
    JobwardenError, Result,
    job::{COMPLETION_SUFFIX, JobId, PublishOptions},
};
use std::time::Duration;

pub const MAX_NAME_LENGTH: usize = 255;
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Largest singleton window, 100 years of 365 days.
pub const MAX_SINGLETON_SECONDS: u64 = 100 * 365 * 86_400;

pub fn queue_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(JobwardenError::validation("job name is required"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(JobwardenError::validation(format!(
            "job name exceeds {} characters",
            MAX_NAME_LENGTH
        )));
    }
    Ok(())
}

/// Names that may receive published jobs. Completion channels are read-only.
pub fn publish_name(name: &str) -> Result<()> {
    queue_name(name)?;
    if name.ends_with(COMPLETION_SUFFIX) {
        return Err(JobwardenError::validation(format!(
            "job names ending in {} are reserved for completion channels",
            COMPLETION_SUFFIX
        )));
    }
    Ok(())
}

pub fn publish_options(options: &PublishOptions) -> Result<()> {
    let windows = [
        ("singleton_seconds", options.singleton_seconds),
        ("singleton_minutes", options.singleton_minutes),
        ("singleton_hours", options.singleton_hours),
        ("singleton_days", options.singleton_days),
    ];
    for (field, value) in windows {
        if value == Some(0) {
            return Err(JobwardenError::validation(format!(
                "{} must be greater than 0",
                field
            )));
        }
    }
    if let Some(window) = options.singleton_window_seconds() {
        if window > MAX_SINGLETON_SECONDS {
            return Err(JobwardenError::validation(format!(
                "singleton window of {}s exceeds the maximum of {}s",
                window, MAX_SINGLETON_SECONDS
            )));
        }
    }
    if let Some(key) = &options.singleton_key {
        if key.is_empty() {
            return Err(JobwardenError::validation("singleton_key must not be empty"));
        }
    }
    if options.expire_in == Some(Duration::ZERO) {
        return Err(JobwardenError::validation("expire_in must be greater than 0"));
    }
    Ok(())
}

pub fn batch_size(batch_size: usize) -> Result<()> {
    if batch_size == 0 {
        return Err(JobwardenError::validation("batch_size must be at least 1"));
    }
    Ok(())
}

pub fn poll_interval(interval: Duration) -> Result<()> {
    if interval < MIN_POLL_INTERVAL {
        return Err(JobwardenError::validation(format!(
            "new_job_check_interval must be at least {}ms",
            MIN_POLL_INTERVAL.as_millis()
        )));
    }
    Ok(())
}

/// Periods driving a timer loop must be non-zero.
pub fn timer_period(field: &str, period: Duration) -> Result<()> {
    if period.is_zero() {
        return Err(JobwardenError::validation(format!(
            "{} must be greater than 0",
            field
        )));
    }
    Ok(())
}

pub fn job_ids(ids: &[JobId]) -> Result<()> {
    if ids.is_empty() {
        return Err(JobwardenError::validation("at least one job id is required"));
    }
    if ids.iter().any(|id| id.is_empty()) {
        return Err(JobwardenError::validation("job ids must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert!(queue_name("email").is_ok());
        assert!(queue_name("").is_err());
        assert!(queue_name("   ").is_err());
        assert!(queue_name(&"x".repeat(256)).is_err());

        assert!(publish_name("email").is_ok());
        assert!(publish_name("email__state__completed").is_err());
        assert!(queue_name("email__state__completed").is_ok());
    }

    #[test]
    fn test_publish_options() {
        assert!(publish_options(&PublishOptions::new()).is_ok());
        assert!(publish_options(&PublishOptions::new().with_singleton_seconds(0)).is_err());
        assert!(publish_options(&PublishOptions::new().with_singleton_key("")).is_err());
        assert!(publish_options(&PublishOptions::new().with_expire_in(Duration::ZERO)).is_err());
        assert!(
            publish_options(&PublishOptions::new().with_singleton_seconds(i64::MAX as u64))
                .is_err()
        );
        assert!(publish_options(&PublishOptions::new().with_singleton_days(u64::MAX)).is_err());
        assert!(
            publish_options(&PublishOptions::new().with_singleton_days(100 * 365)).is_ok()
        );
        assert!(
            publish_options(
                &PublishOptions::new()
                    .with_singleton_key("k")
                    .with_singleton_hours(1)
            )
            .is_ok()
        );
    }

    #[test]
    fn test_batch_and_interval() {
        assert!(batch_size(0).is_err());
        assert!(batch_size(1).is_ok());
        assert!(poll_interval(Duration::from_millis(99)).is_err());
        assert!(poll_interval(Duration::from_millis(100)).is_ok());
        assert!(timer_period("maintenance.interval", Duration::ZERO).is_err());
        assert!(timer_period("maintenance.interval", Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn test_job_ids() {
        assert!(job_ids(&[]).is_err());
        assert!(job_ids(&["".to_string()]).is_err());
        assert!(job_ids(&["a".to_string(), "b".to_string()]).is_ok());
    }
}
