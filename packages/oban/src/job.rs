//! Job model and submission specs.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use crate::unique::UniqueSpec;

/// Execution state of a job row.
///
/// `Completed`, `Discarded`, and `Cancelled` are terminal; rows never leave
/// them. `Suspended` is reserved: it is never fetched, never staged, and sits
/// outside the default uniqueness group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "oban_job_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    #[default]
    Available,
    Executing,
    Retryable,
    Completed,
    Discarded,
    Cancelled,
    Suspended,
}

impl JobState {
    /// Whether a job in this state will never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Discarded | JobState::Cancelled)
    }

    /// Bit position in the uniqueness-group bitmap. `Suspended` has no bit:
    /// the bitmap covers the seven dispatchable-or-terminal states only.
    pub fn bit(&self) -> Option<u8> {
        match self {
            JobState::Scheduled => Some(0),
            JobState::Available => Some(1),
            JobState::Executing => Some(2),
            JobState::Retryable => Some(3),
            JobState::Completed => Some(4),
            JobState::Discarded => Some(5),
            JobState::Cancelled => Some(6),
            JobState::Suspended => None,
        }
    }

    /// Wire name, matching the `oban_job_state` enum labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Available => "available",
            JobState::Executing => "executing",
            JobState::Retryable => "retryable",
            JobState::Completed => "completed",
            JobState::Discarded => "discarded",
            JobState::Cancelled => "cancelled",
            JobState::Suspended => "suspended",
        }
    }
}

/// One failure record, appended to a job's `errors` on each failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// The attempt that produced this error.
    pub attempt: i32,
    pub at: DateTime<Utc>,
    pub error: String,
}

/// A persisted job row.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub state: JobState,
    pub queue: String,
    pub worker: String,
    pub attempt: i32,
    pub max_attempts: i32,
    pub priority: i32,
    pub args: Value,
    pub meta: Value,
    pub tags: Vec<String>,
    pub errors: Json<Vec<JobError>>,
    /// Node identifiers, appended per attempt. The tail is the node that
    /// currently owns the row when `state = executing`.
    pub attempted_by: Vec<String>,
    pub inserted_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub discarded_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Deserialize `args` into a typed payload.
    pub fn args_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.args.clone())
            .map_err(|e| anyhow!("failed to deserialize args for job {}: {e}", self.id))
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// A job submission, accepted by [`Engine::insert`](crate::engine::Engine::insert).
///
/// Fields left unset fall back to the registered worker's options, then to
/// global defaults (`queue = "default"`, `priority = 0`, `max_attempts = 20`).
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobSpec {
    pub worker: String,
    #[builder(default, setter(strip_option))]
    pub queue: Option<String>,
    #[builder(default = serde_json::json!({}))]
    pub args: Value,
    #[builder(default = serde_json::json!({}))]
    pub meta: Value,
    #[builder(default)]
    pub tags: Vec<String>,
    #[builder(default, setter(strip_option))]
    pub priority: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub max_attempts: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Seconds from now; ignored when `scheduled_at` is set.
    #[builder(default, setter(strip_option))]
    pub schedule_in: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub unique: Option<UniqueSpec>,
}

impl JobSpec {
    /// Minimal spec for a worker, everything else defaulted.
    pub fn new(worker: impl Into<String>) -> Self {
        Self::builder().worker(worker.into()).build()
    }

    /// Resolve the initial state and scheduled time for this spec.
    ///
    /// A spec aimed at the future starts `scheduled`; otherwise it is
    /// `available` immediately.
    pub(crate) fn resolve_schedule(&self, now: DateTime<Utc>) -> (JobState, DateTime<Utc>) {
        let at = match (self.scheduled_at, self.schedule_in) {
            (Some(at), _) => at,
            (None, Some(secs)) => now + Duration::seconds(secs),
            (None, None) => now,
        };
        if at > now {
            (JobState::Scheduled, at)
        } else {
            (JobState::Available, at)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_exactly_three() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Discarded.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Scheduled.is_terminal());
        assert!(!JobState::Available.is_terminal());
        assert!(!JobState::Executing.is_terminal());
        assert!(!JobState::Retryable.is_terminal());
        assert!(!JobState::Suspended.is_terminal());
    }

    #[test]
    fn suspended_has_no_bitmap_bit() {
        assert_eq!(JobState::Suspended.bit(), None);
        assert_eq!(JobState::Scheduled.bit(), Some(0));
        assert_eq!(JobState::Cancelled.bit(), Some(6));
    }

    #[test]
    fn spec_defaults() {
        let spec = JobSpec::new("reports.build");
        assert_eq!(spec.worker, "reports.build");
        assert_eq!(spec.queue, None);
        assert_eq!(spec.args, serde_json::json!({}));
        assert!(spec.tags.is_empty());
        assert!(spec.unique.is_none());
    }

    #[test]
    fn future_schedule_starts_scheduled() {
        let now = Utc::now();
        let spec = JobSpec::builder()
            .worker("w")
            .schedule_in(60i64)
            .build();
        let (state, at) = spec.resolve_schedule(now);
        assert_eq!(state, JobState::Scheduled);
        assert_eq!(at, now + Duration::seconds(60));
    }

    #[test]
    fn immediate_schedule_starts_available() {
        let now = Utc::now();
        let (state, at) = JobSpec::new("w").resolve_schedule(now);
        assert_eq!(state, JobState::Available);
        assert_eq!(at, now);
    }

    #[test]
    fn explicit_past_schedule_is_available_at_that_instant() {
        let now = Utc::now();
        let past = now - Duration::seconds(30);
        let spec = JobSpec::builder().worker("w").scheduled_at(past).build();
        let (state, at) = spec.resolve_schedule(now);
        assert_eq!(state, JobState::Available);
        assert_eq!(at, past);
    }

    #[test]
    fn scheduled_at_wins_over_schedule_in() {
        let now = Utc::now();
        let at = now + Duration::seconds(120);
        let spec = JobSpec::builder()
            .worker("w")
            .scheduled_at(at)
            .schedule_in(5i64)
            .build();
        let (state, resolved) = spec.resolve_schedule(now);
        assert_eq!(state, JobState::Scheduled);
        assert_eq!(resolved, at);
    }
}
