//! Polling loop of a single subscription.
//!
//! A [`Poller`] ticks on a fixed interval. Every tick spawns an independent
//! fetch task, so a slow store round trip never delays the next tick; claim
//! exclusivity in the store is what keeps overlapping fetches from
//! dispatching the same job twice. Each fetched job is handed to the
//! subscriber's [`JobHandler`] on its own task together with a [`Done`]
//! resolver. A handler that errors or panics affects only its own job.
//!
//! ```rust
//! use jobwarden::worker::{JobContext, JobHandler};
//! use std::sync::Arc;
//!
//! let handler: JobHandler = Arc::new(|ctx: JobContext| {
//!     Box::pin(async move {
//!         let to = ctx.job.data["to"].as_str().unwrap_or_default().to_string();
//!         ctx.done.complete(Some(serde_json::json!({ "sent_to": to }))).await
//!     })
//! });
//! # let _ = handler;
//! ```

use crate::{
    JobwardenError, Result,
    config::CallbackErrorPolicy,
    events::{ErrorChannel, ErrorSource, QueueError},
    job::{Job, JobId},
    validate,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::{
    any::Any,
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, error, info, warn};

pub type JobHandler = Arc<
    dyn Fn(JobContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync,
>;

/// Claims the next batch for a poller.
pub type FetchFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<Vec<Job>>> + Send>> + Send + Sync>;

/// Settles a dispatched job.
#[async_trait]
pub trait JobResolver: Send + Sync {
    async fn complete(&self, id: &str, output: Option<Value>) -> Result<()>;
    async fn fail(&self, id: &str, output: Option<Value>) -> Result<()>;
}

/// One-shot resolver handed to the handler with each job.
///
/// The first call to [`Done::complete`] or [`Done::fail`] settles the job;
/// the poller settles it afterwards only if the handler did not. Jobs
/// delivered on a completion channel carry a resolver-less `Done` whose
/// calls are no-ops.
pub struct Done {
    job_id: JobId,
    resolver: Option<Arc<dyn JobResolver>>,
    resolved: Arc<AtomicBool>,
}

impl Done {
    fn new(job_id: JobId, resolver: Option<Arc<dyn JobResolver>>) -> Self {
        Self {
            job_id,
            resolver,
            resolved: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn complete(self, response: Option<Value>) -> Result<()> {
        if self.resolved.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match &self.resolver {
            Some(resolver) => resolver.complete(&self.job_id, response).await,
            None => Ok(()),
        }
    }

    pub async fn fail(self, error: Option<Value>) -> Result<()> {
        if self.resolved.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match &self.resolver {
            Some(resolver) => resolver.fail(&self.job_id, error).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Done")
            .field("job_id", &self.job_id)
            .field("resolved", &self.resolved.load(Ordering::SeqCst))
            .finish()
    }
}

#[derive(Debug)]
pub struct JobContext {
    pub job: Job,
    pub done: Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Polling,
    Stopped,
}

struct PollerShared {
    name: String,
    fetch: FetchFn,
    handler: JobHandler,
    resolver: Option<Arc<dyn JobResolver>>,
    errors: Option<ErrorChannel>,
    callback_errors: CallbackErrorPolicy,
    state: Arc<Mutex<PollerState>>,
    in_flight: AtomicUsize,
}

impl PollerShared {
    fn state(&self) -> PollerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves between idle and polling; a stopped poller stays stopped.
    fn set_active_state(&self, next: PollerState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != PollerState::Stopped {
            *state = next;
        }
    }

    fn report(&self, event: QueueError) {
        match &self.errors {
            Some(errors) => errors.report(event),
            None => error!("{}", event),
        }
    }

    async fn poll_once(self: Arc<Self>) {
        if self.state() == PollerState::Stopped {
            return;
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.set_active_state(PollerState::Polling);
        let result = (self.fetch)().await;
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.set_active_state(PollerState::Idle);
        }

        match result {
            Ok(jobs) => {
                if !jobs.is_empty() {
                    debug!("Fetched {} job(s) for {}", jobs.len(), self.name);
                }
                for job in jobs {
                    Self::dispatch(self.clone(), job);
                }
            }
            Err(e) => self.report(QueueError::new(ErrorSource::Fetch, &self.name, e)),
        }
    }

    /// Runs the handler for `job` on its own task, settling the job afterwards
    /// if the handler left it unresolved.
    fn dispatch(shared: Arc<Self>, job: Job) {
        tokio::spawn(async move {
            let job_id = job.id.clone();
            let done = Done::new(job_id.clone(), shared.resolver.clone());
            let resolved = done.resolved.clone();
            let handler = shared.handler.clone();

            let outcome =
                tokio::spawn(async move { handler(JobContext { job, done }).await }).await;
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(join_error) if join_error.is_panic() => Some(format!(
                    "handler panicked: {}",
                    panic_message(join_error.into_panic())
                )),
                Err(_) => Some("handler task was cancelled".to_string()),
            };

            if let Some(message) = &failure {
                match shared.callback_errors {
                    CallbackErrorPolicy::Report => shared.report(
                        QueueError::new(ErrorSource::Handler, &shared.name, message)
                            .with_job_id(job_id.clone()),
                    ),
                    CallbackErrorPolicy::Ignore => {
                        debug!("Handler for job {} on {} failed: {}", job_id, shared.name, message)
                    }
                }
            }

            let Some(resolver) = &shared.resolver else {
                return;
            };
            if resolved.swap(true, Ordering::SeqCst) {
                return;
            }

            let settled = match failure {
                None => resolver.complete(&job_id, None).await,
                Some(message) => resolver.fail(&job_id, Some(json!({ "message": message }))).await,
            };
            if let Err(e) = settled {
                shared.report(
                    QueueError::new(ErrorSource::Resolve, &shared.name, e).with_job_id(job_id),
                );
            }
        });
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Timer-driven fetch loop owned by one subscription.
pub struct Poller {
    name: String,
    fetch: FetchFn,
    handler: JobHandler,
    resolver: Option<Arc<dyn JobResolver>>,
    errors: Option<ErrorChannel>,
    callback_errors: CallbackErrorPolicy,
    poll_interval: Duration,
    state: Arc<Mutex<PollerState>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Poller {
    pub fn new(name: impl Into<String>, fetch: FetchFn, handler: JobHandler) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name: name.into(),
            fetch,
            handler,
            resolver: None,
            errors: None,
            callback_errors: CallbackErrorPolicy::default(),
            poll_interval: Duration::from_secs(1),
            state: Arc::new(Mutex::new(PollerState::Idle)),
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn JobResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_error_channel(mut self, errors: ErrorChannel) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn with_callback_errors(mut self, policy: CallbackErrorPolicy) -> Self {
        self.callback_errors = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn state(&self) -> PollerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the timer loop. Must be called within a tokio runtime.
    ///
    /// Starting a running poller is a no-op; a stopped poller cannot restart.
    pub fn start(&self) -> Result<()> {
        validate::timer_period("poll_interval", self.poll_interval)?;
        if self.state() == PollerState::Stopped {
            return Err(JobwardenError::Worker {
                message: format!("poller for {} has been stopped", self.name),
            });
        }

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Ok(());
        }

        let shared = Arc::new(PollerShared {
            name: self.name.clone(),
            fetch: self.fetch.clone(),
            handler: self.handler.clone(),
            resolver: self.resolver.clone(),
            errors: self.errors.clone(),
            callback_errors: self.callback_errors,
            state: self.state.clone(),
            in_flight: AtomicUsize::new(0),
        });
        let period = self.poll_interval;
        let mut shutdown = self.shutdown.subscribe();

        *task = Some(tokio::spawn(async move {
            info!("Poller started for {} (every {:?})", shared.name, period);
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        tokio::spawn(shared.clone().poll_once());
                    }
                }
            }

            info!("Poller stopped for {}", shared.name);
        }));

        Ok(())
    }

    /// Cancels the timer. In-flight fetches and dispatched handlers drain on
    /// their own. Safe to call more than once.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == PollerState::Stopped {
                return;
            }
            *state = PollerState::Stopped;
        }

        if self.shutdown.send(true).is_err() {
            // loop never started
            debug!("Poller for {} stopped before starting", self.name);
        }
    }

    /// Waits for the timer loop to exit after [`Poller::stop`].
    pub async fn join(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Poller task for {} ended abnormally: {}", self.name, e);
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("name", &self.name)
            .field("poll_interval", &self.poll_interval)
            .field("state", &self.state())
            .finish()
    }
}
