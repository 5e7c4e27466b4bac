//! Structured error types for the engine.
//!
//! `Error` provides pattern-matchable errors instead of generic `anyhow::Error`.
//! `anyhow` stays internal to worker handlers, where it is the ergonomic
//! transport for user code; everything the engine itself surfaces is one of
//! the variants below.

use thiserror::Error;

/// Errors surfaced by the engine and its submission API.
#[derive(Debug, Error)]
pub enum Error {
    /// A cron expression failed to parse. Raised at worker registration so a
    /// bad expression fails startup instead of silently never firing.
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },

    /// The engine configuration is unusable (empty queue name, zero limit).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A submitted job spec is malformed.
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),

    /// A worker name was registered twice.
    #[error("worker {0:?} already registered")]
    WorkerAlreadyRegistered(String),

    /// A unique insert kept colliding with rows that vanished before they
    /// could be fetched back again.
    #[error("unique insert did not converge for fingerprint {0:?}")]
    UniqueConflictUnresolved(String),

    /// A supervised service task died instead of draining cleanly.
    #[error("service task failed: {0}")]
    Runtime(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
