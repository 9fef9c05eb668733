//! In-memory job store.
//!
//! [`MemoryStore`] implements [`JobStore`] entirely in process memory. All
//! mutations run under one write lock, which gives claims the same
//! exclusivity a row-locking database provides. Time is read from a
//! [`MockClock`], so delayed jobs, singleton windows and expiration can be
//! exercised deterministically:
//!
//! ```rust
//! # #[tokio::main]
//! # async fn main() -> jobwarden::Result<()> {
//! use jobwarden::job::{NewJob, StartAfter};
//! use jobwarden::store::{JobStore, memory::{MemoryStore, MockClock}};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let clock = MockClock::new();
//! let store = MemoryStore::with_clock(clock.clone());
//!
//! let job = NewJob::new("j1".to_string(), "email", json!({}))
//!     .with_start(StartAfter::In(Duration::from_secs(7200)));
//! store.insert(&job, 0).await?;
//!
//! assert!(store.claim_next(&["email".to_string()], 1).await?.is_empty());
//! clock.advance(chrono::Duration::hours(2));
//! assert_eq!(store.claim_next(&["email".to_string()], 1).await?.len(), 1);
//! # Ok(())
//! # }
//! ```

use crate::{
    Result,
    job::{Job, JobId, JobState, NewJob},
    singleton,
    store::JobStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::RwLock;

/// Controllable clock shared between a store and its tests.
#[derive(Clone, Debug)]
pub struct MockClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Starts at the current wall-clock time.
    pub fn new() -> Self {
        Self {
            current_time: Arc::new(Mutex::new(Utc::now())),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut time = self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *time += duration;
    }

    pub fn set_time(&self, time: DateTime<Utc>) {
        *self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct StoredJob {
    job: Job,
    /// Insertion order, breaks `created_on` ties under a frozen clock.
    seq: u64,
}

#[derive(Debug, Default)]
struct MemoryStorage {
    jobs: HashMap<JobId, StoredJob>,
    next_seq: u64,
    insert_attempts: u64,
}

impl MemoryStorage {
    /// Whether a non-terminal job already occupies the singleton slot of `candidate`.
    fn slot_taken(&self, candidate: &Job) -> bool {
        self.jobs.values().any(|stored| {
            let job = &stored.job;
            !job.state.is_terminal()
                && job.name == candidate.name
                && (job.singleton_key.is_some() || job.singleton_seconds.is_some())
                && job.singleton_key == candidate.singleton_key
                && job.singleton_on == candidate.singleton_on
        })
    }

    /// Applies `next` to every listed job currently in one of `from`.
    fn transition(
        &mut self,
        ids: &[JobId],
        from: &[JobState],
        next: JobState,
        output: Option<Value>,
        now: DateTime<Utc>,
    ) -> Vec<Job> {
        let mut moved = Vec::new();
        for id in ids {
            let Some(stored) = self.jobs.get_mut(id) else {
                continue;
            };
            let job = &mut stored.job;
            if !from.contains(&job.state) || !job.state.can_transition_to(next) {
                continue;
            }
            job.state = next;
            job.completed_on = Some(now);
            if output.is_some() {
                job.output = output.clone();
            }
            moved.push(job.clone());
        }
        moved
    }
}

/// In-memory [`JobStore`].
#[derive(Clone)]
pub struct MemoryStore {
    storage: Arc<RwLock<MemoryStorage>>,
    clock: MockClock,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(MockClock::new())
    }

    pub fn with_clock(clock: MockClock) -> Self {
        Self {
            storage: Arc::new(RwLock::new(MemoryStorage::default())),
            clock,
        }
    }

    pub fn clock(&self) -> &MockClock {
        &self.clock
    }

    /// Every stored job, oldest first.
    pub async fn jobs(&self) -> Vec<Job> {
        let storage = self.storage.read().await;
        let mut stored: Vec<&StoredJob> = storage.jobs.values().collect();
        stored.sort_by_key(|stored| stored.seq);
        stored.into_iter().map(|stored| stored.job.clone()).collect()
    }

    pub async fn jobs_in_state(&self, name: &str, state: JobState) -> Vec<Job> {
        self.jobs()
            .await
            .into_iter()
            .filter(|job| job.name == name && job.state == state)
            .collect()
    }

    /// Number of `insert` calls, including rejected ones.
    pub async fn insert_attempts(&self) -> u64 {
        self.storage.read().await.insert_attempts
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, job: &NewJob, singleton_offset: i64) -> Result<u64> {
        let now = self.clock.now();
        let singleton_on = job
            .singleton_seconds
            .map(|seconds| singleton::slot_start(now, seconds, singleton_offset))
            .transpose()?;
        let candidate = job.clone().into_job(now, singleton_on);

        let mut storage = self.storage.write().await;
        storage.insert_attempts += 1;

        if storage.jobs.contains_key(&candidate.id) {
            return Ok(0);
        }
        if job.is_singleton() && storage.slot_taken(&candidate) {
            return Ok(0);
        }

        let seq = storage.next_seq;
        storage.next_seq += 1;
        storage.jobs.insert(
            candidate.id.clone(),
            StoredJob {
                job: candidate,
                seq,
            },
        );
        Ok(1)
    }

    async fn claim_next(&self, names: &[String], batch_size: usize) -> Result<Vec<Job>> {
        let now = self.clock.now();
        let mut storage = self.storage.write().await;

        let mut eligible: Vec<(i32, DateTime<Utc>, u64, JobId)> = storage
            .jobs
            .values()
            .filter(|stored| names.contains(&stored.job.name) && stored.job.is_claimable_at(now))
            .map(|stored| {
                (
                    stored.job.priority,
                    stored.job.created_on,
                    stored.seq,
                    stored.job.id.clone(),
                )
            })
            .collect();

        eligible.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        eligible.truncate(batch_size);

        let mut claimed = Vec::with_capacity(eligible.len());
        for (_, _, _, id) in eligible {
            if let Some(stored) = storage.jobs.get_mut(&id) {
                stored.job.state = JobState::Active;
                stored.job.started_on = Some(now);
                claimed.push(stored.job.clone());
            }
        }
        Ok(claimed)
    }

    async fn claim_outcomes(&self, names: &[String], batch_size: usize) -> Result<Vec<Job>> {
        let now = self.clock.now();
        let mut storage = self.storage.write().await;

        let mut ready: Vec<(DateTime<Utc>, u64, JobId)> = storage
            .jobs
            .values()
            .filter(|stored| {
                names.contains(&stored.job.name)
                    && matches!(stored.job.state, JobState::Completed | JobState::Failed)
                    && stored.job.outcome_fetched_on.is_none()
            })
            .map(|stored| {
                (
                    stored.job.completed_on.unwrap_or(stored.job.created_on),
                    stored.seq,
                    stored.job.id.clone(),
                )
            })
            .collect();

        ready.sort();
        ready.truncate(batch_size);

        let mut delivered = Vec::with_capacity(ready.len());
        for (_, _, id) in ready {
            if let Some(stored) = storage.jobs.get_mut(&id) {
                stored.job.outcome_fetched_on = Some(now);
                delivered.push(stored.job.clone());
            }
        }
        Ok(delivered)
    }

    async fn complete(&self, ids: &[JobId], output: Option<Value>) -> Result<Vec<Job>> {
        let now = self.clock.now();
        let mut storage = self.storage.write().await;
        Ok(storage.transition(
            ids,
            &[JobState::Active],
            JobState::Completed,
            output,
            now,
        ))
    }

    async fn fail(&self, ids: &[JobId], output: Option<Value>) -> Result<Vec<Job>> {
        let now = self.clock.now();
        let mut storage = self.storage.write().await;
        Ok(storage.transition(
            ids,
            &[JobState::Active],
            JobState::Failed,
            output,
            now,
        ))
    }

    async fn cancel(&self, ids: &[JobId]) -> Result<Vec<Job>> {
        let now = self.clock.now();
        let mut storage = self.storage.write().await;
        Ok(storage.transition(
            ids,
            &JobState::NON_TERMINAL,
            JobState::Cancelled,
            None,
            now,
        ))
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let storage = self.storage.read().await;
        Ok(storage.jobs.get(id).map(|stored| stored.job.clone()))
    }

    async fn expire_active(&self) -> Result<Vec<Job>> {
        let now = self.clock.now();
        let mut storage = self.storage.write().await;

        let stale: Vec<JobId> = storage
            .jobs
            .values()
            .filter(|stored| stored.job.is_stale_at(now))
            .map(|stored| stored.job.id.clone())
            .collect();

        Ok(storage.transition(&stale, &[JobState::Active], JobState::Expired, None, now))
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut storage = self.storage.write().await;
        let before = storage.jobs.len();
        storage.jobs.retain(|_, stored| {
            !(stored.job.state.is_terminal()
                && stored.job.completed_on.is_some_and(|done| done < older_than))
        });
        Ok((before - storage.jobs.len()) as u64)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
