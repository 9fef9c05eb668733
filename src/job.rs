//! Job model, lifecycle states and publish options.
//!
//! A [`Job`] is the persisted unit of work. It moves through the lifecycle
//!
//! ```text
//! created ──► active ──► completed | failed | expired
//!    │          │
//!    └──────────┴──► cancelled
//! ```
//!
//! and never leaves a terminal state. [`NewJob`] is the insert request handed
//! to a [`JobStore`](crate::store::JobStore); stores resolve its relative
//! start delay and singleton slot against their own clock.

use crate::{JobwardenError, Result, config::JobDefaults};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{fmt, str::FromStr, time::Duration};

/// Opaque job identifier produced by an [`IdGenerator`](crate::id::IdGenerator).
pub type JobId = String;

/// Suffix appended to a job name to address its completion channel.
pub const COMPLETION_SUFFIX: &str = "__state__completed";

/// Name of the completion channel for `name`.
pub fn completion_name(name: &str) -> String {
    format!("{}{}", name, COMPLETION_SUFFIX)
}

/// Returns the source job name when `name` addresses a completion channel.
pub fn completion_source(name: &str) -> Option<&str> {
    name.strip_suffix(COMPLETION_SUFFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Created,
    Active,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl JobState {
    pub const NON_TERMINAL: [JobState; 2] = [JobState::Created, JobState::Active];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Created | JobState::Active)
    }

    /// Whether the lifecycle graph permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Created, JobState::Active)
                | (JobState::Created, JobState::Cancelled)
                | (JobState::Active, JobState::Completed)
                | (JobState::Active, JobState::Failed)
                | (JobState::Active, JobState::Expired)
                | (JobState::Active, JobState::Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobwardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(JobState::Created),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            "expired" => Ok(JobState::Expired),
            other => Err(JobwardenError::Store {
                message: format!("unknown job state: {}", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub data: Value,
    pub priority: i32,
    pub state: JobState,
    pub retry_limit: u32,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub retry_backoff: bool,
    /// The failed or expired attempt this job retries.
    pub retry_of: Option<JobId>,
    pub start_after: DateTime<Utc>,
    pub expire_in: Duration,
    pub singleton_key: Option<String>,
    pub singleton_seconds: Option<u64>,
    /// Start of the singleton window slot this job occupies.
    pub singleton_on: Option<DateTime<Utc>>,
    /// Normalized payload attached by `complete` or `fail`.
    pub output: Option<Value>,
    pub created_on: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub completed_on: Option<DateTime<Utc>>,
    /// When the outcome was delivered on the completion channel.
    pub outcome_fetched_on: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Created && self.start_after <= now
    }

    /// An active job whose `expire_in` has elapsed since it was claimed.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        if self.state != JobState::Active {
            return false;
        }
        match (self.started_on, chrono::Duration::from_std(self.expire_in)) {
            (Some(started), Ok(expire_in)) => started + expire_in <= now,
            _ => false,
        }
    }

    /// Delay before the next retry attempt, or `None` once the retry limit is used up.
    pub fn next_retry_delay(&self) -> Option<Duration> {
        if self.retry_count >= self.retry_limit {
            return None;
        }
        if self.retry_backoff {
            let factor = 2u32.saturating_pow(self.retry_count);
            Some(self.retry_delay.saturating_mul(factor))
        } else {
            Some(self.retry_delay)
        }
    }
}

/// When a newly inserted job becomes claimable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartAfter {
    #[default]
    Immediately,
    /// Relative to the store's clock at insert time.
    In(Duration),
    At(DateTime<Utc>),
}

impl StartAfter {
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            StartAfter::Immediately => now,
            StartAfter::In(delay) => chrono::Duration::from_std(*delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(now),
            StartAfter::At(at) => *at,
        }
    }
}

/// Insert request for a [`JobStore`](crate::store::JobStore).
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: JobId,
    pub name: String,
    pub data: Value,
    pub priority: i32,
    pub retry_limit: u32,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub retry_backoff: bool,
    pub retry_of: Option<JobId>,
    pub start: StartAfter,
    pub expire_in: Duration,
    pub singleton_key: Option<String>,
    pub singleton_seconds: Option<u64>,
}

impl NewJob {
    pub fn new(id: JobId, name: impl Into<String>, data: Value) -> Self {
        let defaults = JobDefaults::default();
        Self {
            id,
            name: name.into(),
            data,
            priority: 0,
            retry_limit: defaults.retry_limit,
            retry_count: 0,
            retry_delay: defaults.retry_delay,
            retry_backoff: defaults.retry_backoff,
            retry_of: None,
            start: StartAfter::Immediately,
            expire_in: defaults.expire_in,
            singleton_key: None,
            singleton_seconds: None,
        }
    }

    /// Builds an insert request from publish options, falling back to `defaults`.
    pub fn from_options(
        id: JobId,
        name: &str,
        data: Value,
        options: &PublishOptions,
        defaults: &JobDefaults,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            data,
            priority: options.priority.unwrap_or(0),
            retry_limit: options.retry_limit.unwrap_or(defaults.retry_limit),
            retry_count: 0,
            retry_delay: options.retry_delay.unwrap_or(defaults.retry_delay),
            retry_backoff: options.retry_backoff.unwrap_or(defaults.retry_backoff),
            retry_of: None,
            start: options.start_after.unwrap_or_default(),
            expire_in: options.expire_in.unwrap_or(defaults.expire_in),
            singleton_key: options.singleton_key.clone(),
            singleton_seconds: options.singleton_window_seconds(),
        }
    }

    /// The successor attempt for a failed or expired job.
    pub fn retry_of(failed: &Job, id: JobId, delay: Duration) -> Self {
        Self {
            id,
            name: failed.name.clone(),
            data: failed.data.clone(),
            priority: failed.priority,
            retry_limit: failed.retry_limit,
            retry_count: failed.retry_count + 1,
            retry_delay: failed.retry_delay,
            retry_backoff: failed.retry_backoff,
            retry_of: Some(failed.id.clone()),
            start: StartAfter::In(delay),
            expire_in: failed.expire_in,
            singleton_key: failed.singleton_key.clone(),
            singleton_seconds: failed.singleton_seconds,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_start(mut self, start: StartAfter) -> Self {
        self.start = start;
        self
    }

    pub fn with_expire_in(mut self, expire_in: Duration) -> Self {
        self.expire_in = expire_in;
        self
    }

    pub fn with_singleton(mut self, key: Option<&str>, seconds: Option<u64>) -> Self {
        self.singleton_key = key.map(str::to_string);
        self.singleton_seconds = seconds;
        self
    }

    /// Whether this job takes part in singleton deduplication.
    pub fn is_singleton(&self) -> bool {
        self.singleton_key.is_some() || self.singleton_seconds.is_some()
    }

    /// Materializes the stored row as of `now`.
    pub fn into_job(self, now: DateTime<Utc>, singleton_on: Option<DateTime<Utc>>) -> Job {
        Job {
            id: self.id,
            name: self.name,
            data: self.data,
            priority: self.priority,
            state: JobState::Created,
            retry_limit: self.retry_limit,
            retry_count: self.retry_count,
            retry_delay: self.retry_delay,
            retry_backoff: self.retry_backoff,
            retry_of: self.retry_of,
            start_after: self.start.resolve(now),
            expire_in: self.expire_in,
            singleton_key: self.singleton_key,
            singleton_seconds: self.singleton_seconds,
            singleton_on,
            output: None,
            created_on: now,
            started_on: None,
            completed_on: None,
            outcome_fetched_on: None,
        }
    }
}

/// Options accepted by [`QueueManager::publish`](crate::QueueManager::publish).
///
/// Unset fields fall back to the manager's [`JobDefaults`].
///
/// ```rust
/// use jobwarden::PublishOptions;
/// use std::time::Duration;
///
/// let options = PublishOptions::new()
///     .with_priority(5)
///     .with_singleton_key("daily-report")
///     .with_singleton_hours(1)
///     .with_expire_in(Duration::from_secs(60));
/// assert_eq!(options.singleton_window_seconds(), Some(3600));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    pub start_after: Option<StartAfter>,
    pub retry_limit: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub retry_backoff: Option<bool>,
    pub expire_in: Option<Duration>,
    pub priority: Option<i32>,
    pub singleton_key: Option<String>,
    pub singleton_seconds: Option<u64>,
    pub singleton_minutes: Option<u64>,
    pub singleton_hours: Option<u64>,
    pub singleton_days: Option<u64>,
    /// Defer a duplicate publish to the next window instead of dropping it.
    pub singleton_next_slot: bool,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start_in(mut self, delay: Duration) -> Self {
        self.start_after = Some(StartAfter::In(delay));
        self
    }

    /// Delay given as seconds or a duration string such as `"90"`, `"30s"` or `"5m"`.
    pub fn with_start_in_str(self, delay: &str) -> Result<Self> {
        let delay = crate::config::parse_duration(delay).map_err(JobwardenError::validation)?;
        Ok(self.with_start_in(delay))
    }

    pub fn with_start_after(mut self, at: DateTime<Utc>) -> Self {
        self.start_after = Some(StartAfter::At(at));
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = Some(retry_limit);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: bool) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }

    pub fn with_expire_in(mut self, expire_in: Duration) -> Self {
        self.expire_in = Some(expire_in);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_singleton_key(mut self, key: impl Into<String>) -> Self {
        self.singleton_key = Some(key.into());
        self
    }

    pub fn with_singleton_seconds(mut self, seconds: u64) -> Self {
        self.singleton_seconds = Some(seconds);
        self
    }

    pub fn with_singleton_minutes(mut self, minutes: u64) -> Self {
        self.singleton_minutes = Some(minutes);
        self
    }

    pub fn with_singleton_hours(mut self, hours: u64) -> Self {
        self.singleton_hours = Some(hours);
        self
    }

    pub fn with_singleton_days(mut self, days: u64) -> Self {
        self.singleton_days = Some(days);
        self
    }

    pub fn with_singleton_next_slot(mut self, next_slot: bool) -> Self {
        self.singleton_next_slot = next_slot;
        self
    }

    /// Window size in seconds, from the first of seconds, minutes, hours, days that is set.
    pub fn singleton_window_seconds(&self) -> Option<u64> {
        self.singleton_seconds
            .or_else(|| self.singleton_minutes.map(|m| m.saturating_mul(60)))
            .or_else(|| self.singleton_hours.map(|h| h.saturating_mul(3600)))
            .or_else(|| self.singleton_days.map(|d| d.saturating_mul(86_400)))
    }
}

/// Result of a bulk `complete`, `fail` or `cancel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkResponse {
    pub jobs: Vec<JobId>,
    pub requested: usize,
    pub updated: usize,
}

/// Normalizes a completion or failure payload before it is stored.
///
/// Absent and `null` payloads are stored as `None`, objects verbatim, and any
/// other value is wrapped as `{"value": ...}`.
pub fn normalize_output(payload: Option<Value>) -> Option<Value> {
    match payload {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(Value::Object(map)),
        Some(other) => Some(json!({ "value": other })),
    }
}
