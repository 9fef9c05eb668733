//! The queue manager façade.
//!
//! [`QueueManager`] composes a [`JobStore`], the singleton dedup planner,
//! one [`Poller`] per subscription and an optional maintenance loop. It is
//! cheap to clone; clones share the same store, subscriptions and error
//! channel.
//!
//! ```rust
//! # #[tokio::main]
//! # async fn main() -> jobwarden::Result<()> {
//! use jobwarden::{ManagerConfig, PublishOptions, QueueManager, store::memory::MemoryStore};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let manager = QueueManager::new(Arc::new(MemoryStore::new()), ManagerConfig::default());
//!
//! let id = manager
//!     .publish("email", json!({"to": "a@b.com"}), PublishOptions::new())
//!     .await?
//!     .expect("not a duplicate");
//!
//! let job = manager.fetch("email").await?.expect("job is ready");
//! assert_eq!(job.id, id);
//!
//! let response = manager.complete(&[id], Some(json!({"sent": true}))).await?;
//! assert_eq!(response.updated, 1);
//! # Ok(())
//! # }
//! ```

use crate::{
    JobwardenError, Result,
    config::ManagerConfig,
    events::{ErrorChannel, ErrorSource, QueueError},
    id::{IdGenerator, UuidGenerator},
    job::{
        BulkResponse, Job, JobId, NewJob, PublishOptions, StartAfter, completion_name,
        completion_source, normalize_output,
    },
    registry::SubscriptionRegistry,
    singleton,
    store::JobStore,
    validate,
    worker::{FetchFn, JobHandler, JobResolver, Poller},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

/// Options accepted by [`QueueManager::subscribe`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub batch_size: Option<usize>,
    /// Alias for `batch_size`, used when `batch_size` is unset.
    pub team_size: Option<usize>,
    pub new_job_check_interval: Option<Duration>,
    pub new_job_check_interval_seconds: Option<u64>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_team_size(mut self, team_size: usize) -> Self {
        self.team_size = Some(team_size);
        self
    }

    pub fn with_new_job_check_interval(mut self, interval: Duration) -> Self {
        self.new_job_check_interval = Some(interval);
        self
    }

    pub fn with_new_job_check_interval_seconds(mut self, seconds: u64) -> Self {
        self.new_job_check_interval_seconds = Some(seconds);
        self
    }

    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.or(self.team_size).unwrap_or(1)
    }

    pub fn effective_interval(&self, default: Duration) -> Duration {
        self.new_job_check_interval
            .or_else(|| self.new_job_check_interval_seconds.map(Duration::from_secs))
            .unwrap_or(default)
    }
}

/// Outcome of one maintenance sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub retried: usize,
    pub purged: u64,
}

struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner<S> {
    store: Arc<S>,
    config: ManagerConfig,
    ids: Arc<dyn IdGenerator>,
    registry: SubscriptionRegistry,
    errors: ErrorChannel,
    maintenance: Mutex<Option<MaintenanceHandle>>,
}

impl<S: JobStore + 'static> Inner<S> {
    /// Claims from regular names first, then from completion channels.
    async fn claim(&self, names: &[String], batch_size: usize) -> Result<Vec<Job>> {
        let (channels, queues): (Vec<&String>, Vec<&String>) = names
            .iter()
            .partition(|name| completion_source(name).is_some());

        let mut jobs = Vec::new();
        if !queues.is_empty() {
            let queues: Vec<String> = queues.into_iter().cloned().collect();
            jobs = self.store.claim_next(&queues, batch_size).await?;
        }

        let remaining = batch_size.saturating_sub(jobs.len());
        if !channels.is_empty() && remaining > 0 {
            let sources: Vec<String> = channels
                .into_iter()
                .filter_map(|name| completion_source(name))
                .map(str::to_string)
                .collect();
            jobs.extend(self.store.claim_outcomes(&sources, remaining).await?);
        }

        Ok(jobs)
    }

    async fn complete(&self, ids: &[JobId], data: Option<Value>) -> Result<BulkResponse> {
        validate::job_ids(ids)?;
        let completed = self.store.complete(ids, normalize_output(data)).await?;
        debug!("Completed {}/{} job(s)", completed.len(), ids.len());
        Ok(bulk_response(ids, completed.len()))
    }

    async fn fail(&self, ids: &[JobId], data: Option<Value>) -> Result<BulkResponse> {
        validate::job_ids(ids)?;
        let failed = self.store.fail(ids, normalize_output(data)).await?;
        debug!("Failed {}/{} job(s)", failed.len(), ids.len());
        self.schedule_retries(&failed).await;
        Ok(bulk_response(ids, failed.len()))
    }

    /// Publishes the successor attempt of every job with retries left.
    ///
    /// Errors are reported on the error channel; the failure that triggered
    /// the retry has already been recorded.
    async fn schedule_retries(&self, jobs: &[Job]) -> usize {
        let mut scheduled = 0;
        for job in jobs {
            let Some(delay) = job.next_retry_delay() else {
                continue;
            };
            let retry = NewJob::retry_of(job, self.ids.generate(), delay);
            let attempt = retry.retry_count;
            match singleton::create_job(self.store.as_ref(), retry, false).await {
                Ok(Some(id)) => {
                    info!(
                        "Scheduled retry {}/{} of job {} as {} in {:?}",
                        attempt, job.retry_limit, job.id, id, delay
                    );
                    scheduled += 1;
                }
                Ok(None) => debug!("Retry of job {} dropped by singleton slot", job.id),
                Err(e) => self.errors.report(
                    QueueError::new(ErrorSource::Retry, &job.name, e).with_job_id(job.id.clone()),
                ),
            }
        }
        scheduled
    }

    async fn maintain(&self) -> Result<MaintenanceReport> {
        let expired = self.store.expire_active().await?;
        if !expired.is_empty() {
            warn!("Expired {} stale active job(s)", expired.len());
        }
        let retried = self.schedule_retries(&expired).await;

        let retention = self.config.maintenance.retention;
        let purged = match chrono::Duration::from_std(retention) {
            Ok(retention) if !retention.is_zero() => {
                self.store.purge_terminal(self.store.now() - retention).await?
            }
            _ => 0,
        };

        Ok(MaintenanceReport {
            expired: expired.len(),
            retried,
            purged,
        })
    }

    fn stop_maintenance(&self) {
        let handle = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(true);
            drop(handle.task);
            info!("Maintenance loop stopped");
        }
    }
}

fn bulk_response(ids: &[JobId], updated: usize) -> BulkResponse {
    BulkResponse {
        jobs: ids.to_vec(),
        requested: ids.len(),
        updated,
    }
}

/// Settles dispatched jobs through a manager that may already be gone.
struct ManagerResolver<S> {
    inner: Weak<Inner<S>>,
}

impl<S: JobStore + 'static> ManagerResolver<S> {
    fn inner(&self) -> Result<Arc<Inner<S>>> {
        self.inner.upgrade().ok_or_else(|| JobwardenError::Worker {
            message: "queue manager has been dropped".to_string(),
        })
    }
}

#[async_trait]
impl<S: JobStore + 'static> JobResolver for ManagerResolver<S> {
    async fn complete(&self, id: &str, output: Option<Value>) -> Result<()> {
        self.inner()?.complete(&[id.to_string()], output).await?;
        Ok(())
    }

    async fn fail(&self, id: &str, output: Option<Value>) -> Result<()> {
        self.inner()?.fail(&[id.to_string()], output).await?;
        Ok(())
    }
}

pub struct QueueManager<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for QueueManager<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: JobStore + 'static> QueueManager<S> {
    pub fn new(store: Arc<S>, config: ManagerConfig) -> Self {
        Self::with_id_generator(store, config, Arc::new(UuidGenerator))
    }

    pub fn with_id_generator(
        store: Arc<S>,
        config: ManagerConfig,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let errors = ErrorChannel::new(config.polling.error_channel_capacity);
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                ids,
                registry: SubscriptionRegistry::new(),
                errors,
                maintenance: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Receives unattended failures: fetch errors, handler failures (under
    /// [`CallbackErrorPolicy::Report`](crate::CallbackErrorPolicy::Report)),
    /// retry scheduling and maintenance errors.
    pub fn errors(&self) -> broadcast::Receiver<QueueError> {
        self.inner.errors.subscribe()
    }

    /// Publishes a job. Returns `None` when the publish was dropped as a
    /// singleton duplicate.
    pub async fn publish(
        &self,
        name: &str,
        data: Value,
        options: PublishOptions,
    ) -> Result<Option<JobId>> {
        validate::publish_name(name)?;
        validate::publish_options(&options)?;

        let job = NewJob::from_options(
            self.inner.ids.generate(),
            name,
            data,
            &options,
            &self.inner.config.defaults,
        );
        let id = singleton::create_job(self.inner.store.as_ref(), job, options.singleton_next_slot)
            .await?;
        if let Some(id) = &id {
            debug!("Published job {} to {}", id, name);
        }
        Ok(id)
    }

    /// Publishes a job that becomes claimable at `start`.
    pub async fn publish_after(
        &self,
        name: &str,
        data: Value,
        options: PublishOptions,
        start: StartAfter,
    ) -> Result<Option<JobId>> {
        let options = PublishOptions {
            start_after: Some(start),
            ..options
        };
        self.publish(name, data, options).await
    }

    /// At most one non-terminal job per `(name, key)`.
    pub async fn publish_once(
        &self,
        name: &str,
        data: Value,
        options: PublishOptions,
        key: &str,
    ) -> Result<Option<JobId>> {
        self.publish(name, data, options.with_singleton_key(key))
            .await
    }

    /// At most one job per `seconds` window; extra publishes are dropped.
    pub async fn publish_throttled(
        &self,
        name: &str,
        data: Value,
        options: PublishOptions,
        seconds: u64,
        key: Option<&str>,
    ) -> Result<Option<JobId>> {
        let mut options = options
            .with_singleton_seconds(seconds)
            .with_singleton_next_slot(false);
        if let Some(key) = key {
            options = options.with_singleton_key(key);
        }
        self.publish(name, data, options).await
    }

    /// Like [`QueueManager::publish_throttled`] but a publish landing in an
    /// occupied window is deferred to the next one.
    pub async fn publish_debounced(
        &self,
        name: &str,
        data: Value,
        options: PublishOptions,
        seconds: u64,
        key: Option<&str>,
    ) -> Result<Option<JobId>> {
        let mut options = options
            .with_singleton_seconds(seconds)
            .with_singleton_next_slot(true);
        if let Some(key) = key {
            options = options.with_singleton_key(key);
        }
        self.publish(name, data, options).await
    }

    /// Claims the next ready job for `name`.
    pub async fn fetch(&self, name: &str) -> Result<Option<Job>> {
        Ok(self
            .fetch_batch(name, 1)
            .await?
            .and_then(|jobs| jobs.into_iter().next()))
    }

    /// Claims up to `batch_size` ready jobs. `None` when nothing is ready.
    pub async fn fetch_batch(&self, name: &str, batch_size: usize) -> Result<Option<Vec<Job>>> {
        self.fetch_many(&[name.to_string()], batch_size).await
    }

    /// Claims up to `batch_size` ready jobs across `names`.
    pub async fn fetch_many(
        &self,
        names: &[String],
        batch_size: usize,
    ) -> Result<Option<Vec<Job>>> {
        if names.is_empty() {
            return Err(JobwardenError::validation("at least one job name is required"));
        }
        for name in names {
            validate::queue_name(name)?;
        }
        validate::batch_size(batch_size)?;

        let jobs = self.inner.claim(names, batch_size).await?;
        Ok((!jobs.is_empty()).then_some(jobs))
    }

    pub async fn fetch_completed(&self, name: &str) -> Result<Option<Job>> {
        self.fetch(&completion_name(name)).await
    }

    pub async fn fetch_completed_batch(
        &self,
        name: &str,
        batch_size: usize,
    ) -> Result<Option<Vec<Job>>> {
        self.fetch_batch(&completion_name(name), batch_size).await
    }

    pub async fn complete(&self, ids: &[JobId], data: Option<Value>) -> Result<BulkResponse> {
        self.inner.complete(ids, data).await
    }

    /// Fails active jobs and schedules retries for those with attempts left.
    pub async fn fail(&self, ids: &[JobId], data: Option<Value>) -> Result<BulkResponse> {
        self.inner.fail(ids, data).await
    }

    pub async fn cancel(&self, ids: &[JobId]) -> Result<BulkResponse> {
        validate::job_ids(ids)?;
        let cancelled = self.inner.store.cancel(ids).await?;
        debug!("Cancelled {}/{} job(s)", cancelled.len(), ids.len());
        Ok(bulk_response(ids, cancelled.len()))
    }

    pub async fn get_job_by_id(&self, id: &str) -> Result<Option<Job>> {
        if id.is_empty() {
            return Err(JobwardenError::validation("job id is required"));
        }
        self.inner.store.get_job(id).await
    }

    /// Starts polling `name` and dispatching jobs to `handler`.
    ///
    /// Names ending in the completion suffix subscribe to a completion
    /// channel; their jobs are already settled and `Done` is a no-op.
    /// Must be called from within a tokio runtime.
    pub fn subscribe(
        &self,
        name: &str,
        options: SubscribeOptions,
        handler: JobHandler,
    ) -> Result<()> {
        validate::queue_name(name)?;
        let batch_size = options.effective_batch_size();
        validate::batch_size(batch_size)?;
        let poll_interval =
            options.effective_interval(self.inner.config.polling.new_job_check_interval);
        validate::poll_interval(poll_interval)?;

        if tokio::runtime::Handle::try_current().is_err() {
            return Err(JobwardenError::Worker {
                message: "subscribe requires a running tokio runtime".to_string(),
            });
        }

        let weak = Arc::downgrade(&self.inner);
        let names = vec![name.to_string()];
        let fetch: FetchFn = Arc::new(move || {
            let weak = weak.clone();
            let names = names.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(inner) => inner.claim(&names, batch_size).await,
                    None => Ok(Vec::new()),
                }
            })
        });

        let mut poller = Poller::new(name, fetch, handler)
            .with_poll_interval(poll_interval)
            .with_error_channel(self.inner.errors.clone())
            .with_callback_errors(self.inner.config.callback_errors);
        if completion_source(name).is_none() {
            poller = poller.with_resolver(Arc::new(ManagerResolver {
                inner: Arc::downgrade(&self.inner),
            }));
        }

        let poller = Arc::new(poller);
        self.inner.registry.register(poller.clone())?;
        poller.start()?;

        info!(
            "Subscribed to {} (batch size {}, every {:?})",
            name, batch_size, poll_interval
        );
        Ok(())
    }

    /// Stops polling `name`. Jobs already dispatched keep running.
    pub fn unsubscribe(&self, name: &str) -> Result<()> {
        let poller = self.inner.registry.remove(name)?;
        poller.stop();
        info!("Unsubscribed from {}", name);
        Ok(())
    }

    /// Subscribes to the completion channel of `name`.
    pub fn on_complete(
        &self,
        name: &str,
        options: SubscribeOptions,
        handler: JobHandler,
    ) -> Result<()> {
        self.subscribe(&completion_name(name), options, handler)
    }

    pub fn off_complete(&self, name: &str) -> Result<()> {
        self.unsubscribe(&completion_name(name))
    }

    /// Names with an active subscription, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    /// Runs one sweep: expire stale active jobs, schedule their retries and
    /// purge terminal jobs older than the retention period.
    pub async fn maintain(&self) -> Result<MaintenanceReport> {
        self.inner.maintain().await
    }

    /// Spawns the periodic maintenance loop when enabled in the config.
    /// Calling it again while the loop runs is a no-op.
    pub fn start(&self) -> Result<()> {
        let maintenance = &self.inner.config.maintenance;
        if !maintenance.enabled {
            debug!("Maintenance disabled; not starting loop");
            return Ok(());
        }
        validate::timer_period("maintenance.interval", maintenance.interval)?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(JobwardenError::Worker {
                message: "start requires a running tokio runtime".to_string(),
            });
        }

        let mut slot = self
            .inner
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let weak = Arc::downgrade(&self.inner);
        let period = maintenance.interval;

        let task = tokio::spawn(async move {
            info!("Maintenance loop started (every {:?})", period);
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        match inner.maintain().await {
                            Ok(report) => debug!("Maintenance sweep: {:?}", report),
                            Err(e) => inner
                                .errors
                                .report(QueueError::new(ErrorSource::Maintenance, "*", e)),
                        }
                    }
                }
            }
        });

        *slot = Some(MaintenanceHandle { shutdown, task });
        Ok(())
    }

    /// Unsubscribes everything and stops maintenance. Safe to call repeatedly.
    pub fn stop(&self) {
        let pollers = self.inner.registry.drain();
        for poller in &pollers {
            poller.stop();
        }
        if !pollers.is_empty() {
            info!("Stopped {} subscription(s)", pollers.len());
        }
        self.inner.stop_maintenance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_options_resolution() {
        let defaults = SubscribeOptions::new();
        assert_eq!(defaults.effective_batch_size(), 1);
        assert_eq!(
            defaults.effective_interval(Duration::from_secs(2)),
            Duration::from_secs(2)
        );

        let team = SubscribeOptions::new().with_team_size(4);
        assert_eq!(team.effective_batch_size(), 4);
        assert_eq!(team.with_batch_size(2).effective_batch_size(), 2);

        let seconds = SubscribeOptions::new().with_new_job_check_interval_seconds(5);
        assert_eq!(
            seconds.effective_interval(Duration::from_secs(1)),
            Duration::from_secs(5)
        );
        let both = seconds.with_new_job_check_interval(Duration::from_millis(250));
        assert_eq!(
            both.effective_interval(Duration::from_secs(1)),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_bulk_response_echoes_request() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let response = bulk_response(&ids, 1);
        assert_eq!(response.jobs, ids);
        assert_eq!(response.requested, 2);
        assert_eq!(response.updated, 1);
    }
}
