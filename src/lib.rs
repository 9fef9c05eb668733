//! # Jobwarden
//!
//! A durable, storage-agnostic job queue for Rust.
//!
//! Producers publish named jobs with a JSON payload and scheduling options;
//! consumers subscribe to a name and receive jobs through periodic polling
//! against a backing store. Jobs move through a one-directional lifecycle
//! (`created → active → completed | failed | expired`, or `cancelled`) and
//! support singleton deduplication windows, delayed start, expiration and
//! retries.
//!
//! ## Features
//!
//! - **Pluggable storage**: everything goes through the [`JobStore`] trait;
//!   an in-memory store ships by default, PostgreSQL behind the `postgres` feature
//! - **Exclusive claims**: a job is dispatched to at most one consumer
//! - **Singleton windows**: deterministic dedup slots keyed by name, key and time window
//! - **Completion channels**: observe outcomes of another queue via `on_complete`
//! - **Unattended error reporting**: poller and maintenance failures arrive on a
//!   broadcast channel instead of disappearing
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use jobwarden::{
//!     ManagerConfig, PublishOptions, QueueManager, SubscribeOptions,
//!     store::memory::MemoryStore,
//!     worker::{JobContext, JobHandler},
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> jobwarden::Result<()> {
//!     let manager = QueueManager::new(Arc::new(MemoryStore::new()), ManagerConfig::default());
//!
//!     let handler: JobHandler = Arc::new(|ctx: JobContext| {
//!         Box::pin(async move {
//!             println!("Sending email to {}", ctx.job.data["to"]);
//!             ctx.done.complete(None).await
//!         })
//!     });
//!     manager.subscribe("email", SubscribeOptions::new().with_batch_size(10), handler)?;
//!
//!     manager
//!         .publish("email", json!({"to": "a@b.com"}), PublishOptions::new())
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     manager.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Deduplication
//!
//! A publish carrying `singleton_key` and/or a singleton window competes for
//! the slot `(name, key, floor((now + offset) / window) * window)`. Duplicates
//! return `None`; with `singleton_next_slot` the publish is deferred once to
//! the following window instead.

pub mod config;
pub mod error;
pub mod events;
pub mod id;
pub mod job;
pub mod logging;
pub mod manager;
pub mod registry;
pub mod singleton;
pub mod store;
pub mod validate;
pub mod worker;

pub use config::{CallbackErrorPolicy, ManagerConfig};
pub use error::JobwardenError;
pub use events::{ErrorSource, QueueError};
pub use id::{IdGenerator, UuidGenerator};
pub use job::{BulkResponse, Job, JobId, JobState, PublishOptions, StartAfter};
pub use manager::{MaintenanceReport, QueueManager, SubscribeOptions};
pub use store::JobStore;
pub use worker::{Done, JobContext, JobHandler};

#[cfg(feature = "postgres")]
pub use store::postgres::PostgresStore;

pub type Result<T> = std::result::Result<T, JobwardenError>;
