//! Persistence contract for jobs.
//!
//! The queue manager never touches storage directly; everything goes through
//! the [`JobStore`] trait. Any store (SQL, embedded, distributed) can back a
//! manager as long as it upholds the guarantees documented on each method.
//! Two implementations ship with the crate:
//!
//! - [`memory::MemoryStore`]: in-process store with a controllable clock
//! - `postgres::PostgresStore` (feature `postgres`): sqlx-backed store

use crate::{
    Result,
    job::{Job, JobId, NewJob},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Storage operations required by the queue manager.
///
/// Every method is atomic with respect to concurrent callers. Bulk transitions
/// return the jobs they actually moved; the length of that vector is the
/// affected row count.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job, resolving its start time and singleton slot against the
    /// store clock shifted by `singleton_offset` seconds.
    ///
    /// Returns `0` when a non-terminal job with the same name, singleton key
    /// and slot already exists. A conflict is never reported as an error.
    async fn insert(&self, job: &NewJob, singleton_offset: i64) -> Result<u64>;

    /// Claim up to `batch_size` jobs in state `created` whose start time has
    /// passed, ordered by priority descending then creation time ascending,
    /// and move them to `active`. No job is ever returned to two callers.
    async fn claim_next(&self, names: &[String], batch_size: usize) -> Result<Vec<Job>>;

    /// Claim up to `batch_size` completed or failed jobs whose outcome has not
    /// been delivered yet, marking them delivered.
    async fn claim_outcomes(&self, names: &[String], batch_size: usize) -> Result<Vec<Job>>;

    /// Move `active` jobs to `completed`, storing `output` verbatim. Other ids
    /// are ignored. The manager normalizes `output` before the call.
    async fn complete(&self, ids: &[JobId], output: Option<Value>) -> Result<Vec<Job>>;

    /// Move `active` jobs to `failed`, storing `output` verbatim. Other ids are
    /// ignored. The manager normalizes `output` before the call.
    async fn fail(&self, ids: &[JobId], output: Option<Value>) -> Result<Vec<Job>>;

    /// Move `created` or `active` jobs to `cancelled`. Other ids are ignored.
    async fn cancel(&self, ids: &[JobId]) -> Result<Vec<Job>>;

    async fn get_job(&self, id: &str) -> Result<Option<Job>>;

    /// Move every `active` job whose `expire_in` has elapsed to `expired`.
    async fn expire_active(&self) -> Result<Vec<Job>>;

    /// Delete terminal jobs that finished before `older_than`.
    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// The store's notion of the current time.
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
