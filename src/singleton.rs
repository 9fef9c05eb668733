//! Singleton deduplication at publish time.
//!
//! Jobs carrying a singleton key, a singleton window, or both compete for a
//! slot identified by `(name, singleton_key, slot_start)`. Only one
//! non-terminal job may occupy a slot; the store rejects the rest. The slot
//! start is a pure function of the store clock, the window size and an offset
//! so that concurrent publishers agree on window boundaries:
//!
//! ```text
//! slot_start = floor((epoch(now) + offset) / window) * window
//! ```
//!
//! With `singleton_next_slot` a rejected publish is retried once against the
//! following window (offset = window, start delay = window) instead of being
//! dropped.

use crate::{
    JobwardenError, Result,
    job::{JobId, NewJob, StartAfter},
    store::JobStore,
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

/// Start of the window containing `now + offset`, aligned to the Unix epoch.
///
/// Fails when the window or the shifted instant leaves the representable range.
pub fn slot_start(now: DateTime<Utc>, window_seconds: u64, offset: i64) -> Result<DateTime<Utc>> {
    let out_of_range = || {
        JobwardenError::validation(format!(
            "singleton window of {}s is out of range",
            window_seconds
        ))
    };

    let window = i64::try_from(window_seconds.max(1)).map_err(|_| out_of_range())?;
    let shifted = now.timestamp().checked_add(offset).ok_or_else(out_of_range)?;
    let slot = shifted
        .div_euclid(window)
        .checked_mul(window)
        .ok_or_else(out_of_range)?;
    DateTime::from_timestamp(slot, 0).ok_or_else(out_of_range)
}

/// Attempts made by [`create_job`]: the first insert plus at most one next-slot retry.
pub const MAX_INSERT_ATTEMPTS: usize = 2;

/// Inserts `job`, applying the dedup rules.
///
/// Returns the job id when a row was inserted and `None` when the publish
/// collided with an occupied slot and was dropped.
pub async fn create_job<S>(store: &S, job: NewJob, next_slot: bool) -> Result<Option<JobId>>
where
    S: JobStore + ?Sized,
{
    let mut job = job;
    let mut offset = 0i64;
    let mut next_slot = next_slot;

    for _ in 0..MAX_INSERT_ATTEMPTS {
        if store.insert(&job, offset).await? == 1 {
            return Ok(Some(job.id));
        }

        match job.singleton_seconds {
            Some(window) if next_slot => {
                debug!(
                    "Singleton slot taken for {} (key {:?}); deferring to next {}s window",
                    job.name, job.singleton_key, window
                );
                next_slot = false;
                offset = i64::try_from(window).map_err(|_| {
                    JobwardenError::validation(format!(
                        "singleton window of {}s is out of range",
                        window
                    ))
                })?;
                job.start = StartAfter::In(Duration::from_secs(window));
            }
            _ => break,
        }
    }

    debug!(
        "Dropped duplicate publish for {} (key {:?})",
        job.name, job.singleton_key
    );
    Ok(None)
}
