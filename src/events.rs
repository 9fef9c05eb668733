//! Error channel for unattended work.
//!
//! Pollers and the maintenance loop run without a caller to return errors to.
//! Their failures are logged and published as [`QueueError`] events on a
//! bounded broadcast channel owned by each manager. Receivers that fall more
//! than the channel capacity behind observe `RecvError::Lagged`.

use crate::job::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    /// A poller's fetch against the store failed.
    Fetch,
    /// A subscriber handler returned an error or panicked.
    Handler,
    /// Resolving a dispatched job (complete/fail) failed.
    Resolve,
    /// Publishing the retry attempt of a failed job failed.
    Retry,
    /// The expiration/purge sweep failed.
    Maintenance,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorSource::Fetch => "fetch",
            ErrorSource::Handler => "handler",
            ErrorSource::Resolve => "resolve",
            ErrorSource::Retry => "retry",
            ErrorSource::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueError {
    pub source: ErrorSource,
    /// Subscription or job name the error belongs to.
    pub queue: String,
    pub job_id: Option<JobId>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl QueueError {
    pub fn new(source: ErrorSource, queue: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            source,
            queue: queue.into(),
            job_id: None,
            message: message.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<JobId>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.job_id {
            Some(id) => write!(
                f,
                "{} error on {} (job {}): {}",
                self.source, self.queue, id, self.message
            ),
            None => write!(f, "{} error on {}: {}", self.source, self.queue, self.message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorChannel {
    sender: broadcast::Sender<QueueError>,
}

impl ErrorChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueError> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Logs the error and delivers it to every current receiver.
    pub fn report(&self, event: QueueError) {
        error!("{}", event);
        if self.sender.send(event).is_err() {
            debug!("No error observers registered; event dropped");
        }
    }
}
