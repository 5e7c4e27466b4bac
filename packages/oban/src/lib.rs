//! Durable background job processing on PostgreSQL.
//!
//! Producers insert job rows; a cluster of worker processes pulls them,
//! executes registered handlers, and records the outcome. The database is
//! the single source of truth: row-level locking orders dispatch, a
//! bitmap-guarded partial unique index deduplicates inserts, and an
//! expiring row claim elects the one node that runs the scheduler, pruner,
//! and lifeline.
//!
//! # Architecture
//!
//! ```text
//! Engine::insert(spec)
//!     │
//!     └─► unique rewrite (fingerprint + state bitmap in meta) ─► oban_jobs row
//!
//! Producer (per node, queue)
//!     │
//!     ├─► fetch: available → executing (FOR UPDATE SKIP LOCKED)
//!     ├─► dispatch: registry handler, optional timeout
//!     └─► ack: batched outcomes → completed/retryable/discarded/cancelled
//!
//! Leader (one node, expiring lease)
//!     ├─► scheduler: stage due rows, materialize cron jobs per minute
//!     ├─► pruner: delete old terminal rows
//!     └─► lifeline: rescue executing rows whose producer died
//! ```
//!
//! # Example
//!
//! ```ignore
//! use oban::{Config, Engine, JobSpec, Outcome, Registry, WorkerOpts};
//!
//! let mut registry = Registry::new();
//! registry.register("mailer.deliver", WorkerOpts::default(), |job, _cancel| async move {
//!     let to: String = job.args_as()?;
//!     // ... deliver ...
//!     Ok(Outcome::Complete)
//! })?;
//!
//! let engine = Engine::connect(Config::from_env()?, registry).await?;
//! engine.insert(JobSpec::new("mailer.deliver")).await?;
//! engine.run().await?;
//! ```

pub mod config;
pub mod cron;
pub mod engine;
pub mod error;
pub mod job;
pub mod leader;
pub mod notifier;
pub mod plugins;
pub mod producer;
mod service;
pub mod store;
pub mod unique;
pub mod worker;

pub use config::{Config, LeaderConfig, LifelineConfig, PrunerConfig};
pub use cron::CronExpr;
pub use engine::Engine;
pub use error::{Error, Result};
pub use job::{Job, JobError, JobSpec, JobState};
pub use store::{InsertResult, JobAck, Store};
pub use unique::{UniqueField, UniqueSpec};
pub use worker::{Backoff, Outcome, Registry, SharedRegistry, WorkerOpts};
