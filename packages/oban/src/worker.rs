//! Worker registry, execution outcomes, and retry backoff.
//!
//! The registry maps worker identifiers (e.g. `"mailer.deliver"`) to boxed
//! async handlers plus the options the engine consults when inserting and
//! dispatching jobs for them. User code fills the registry at startup; the
//! engine only reads it afterwards.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;

use crate::cron::CronExpr;
use crate::error::Error;
use crate::job::Job;
use crate::unique::UniqueSpec;

/// What a worker's `process` reported for one attempt.
///
/// Handlers return `Ok(Outcome)` for deliberate results; an `Err` or a panic
/// is treated as a retryable failure until attempts run out.
#[derive(Debug)]
pub enum Outcome {
    /// The attempt succeeded.
    Complete,
    /// Reschedule this many seconds out without consuming the attempt.
    Snooze(i64),
    /// Retry explicitly, before attempts are exhausted.
    Retry(Option<String>),
    /// Stop permanently, regardless of remaining attempts.
    Discard(String),
    /// Stop permanently because the work is no longer wanted.
    Cancel(String),
}

/// Exponential backoff applied between failed attempts:
/// `min(max, base * 2^(attempt-1))` seconds, plus uniform jitter in
/// `[0, base]` when enabled.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub base: u64,
    pub max: u64,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: 15,
            max: 7 * 24 * 60 * 60,
            jitter: true,
        }
    }
}

impl Backoff {
    /// Delay in seconds before the given (1-based) failed attempt retries.
    pub fn delay(&self, attempt: i32) -> u64 {
        let exp = (attempt - 1).clamp(0, 62) as u32;
        let raw = self
            .base
            .saturating_mul(2u64.saturating_pow(exp))
            .min(self.max);
        if self.jitter {
            raw + fastrand::u64(0..=self.base)
        } else {
            raw
        }
    }
}

/// Per-worker options consulted at insert and dispatch time.
#[derive(Debug, Clone)]
pub struct WorkerOpts {
    pub queue: String,
    pub priority: i32,
    pub max_attempts: i32,
    pub backoff: Backoff,
    /// Per-attempt execution cap; exceeding it requests cooperative
    /// cancellation, then records a failure.
    pub timeout: Option<Duration>,
    /// Cron expression; set when the worker is a recurring one.
    pub cron: Option<String>,
    /// Overrides the engine-wide zone for this worker's cron evaluation.
    pub cron_timezone: Option<Tz>,
    pub unique: Option<UniqueSpec>,
}

impl Default for WorkerOpts {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            priority: 0,
            max_attempts: 20,
            backoff: Backoff::default(),
            timeout: None,
            cron: None,
            cron_timezone: None,
            unique: None,
        }
    }
}

type BoxedHandler = Box<
    dyn Fn(Job, CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<Outcome>> + Send>>
        + Send
        + Sync,
>;

/// A registered worker: its handler plus resolved options.
pub struct WorkerEntry {
    pub(crate) handler: BoxedHandler,
    pub opts: WorkerOpts,
    pub(crate) cron: Option<CronExpr>,
}

impl WorkerEntry {
    pub(crate) fn call(
        &self,
        job: Job,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Outcome>> + Send>> {
        (self.handler)(job, cancel)
    }
}

/// Process-wide map from worker identifier to executable unit.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<String, WorkerEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker under a stable identifier.
    ///
    /// The handler receives the full job row (use [`Job::args_as`] for a
    /// typed payload) and a token that is cancelled on timeout or shutdown.
    /// A bad cron expression in `opts` is rejected here so startup fails
    /// loudly instead of a recurring job never firing.
    pub fn register<F, Fut>(
        &mut self,
        name: impl Into<String>,
        opts: WorkerOpts,
        handler: F,
    ) -> Result<(), Error>
    where
        F: Fn(Job, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Outcome>> + Send + 'static,
    {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(Error::WorkerAlreadyRegistered(name));
        }

        let cron = match &opts.cron {
            Some(expr) => Some(expr.parse::<CronExpr>()?),
            None => None,
        };

        let boxed: BoxedHandler =
            Box::new(move |job, cancel| Box::pin(handler(job, cancel)));

        self.entries.insert(
            name,
            WorkerEntry {
                handler: boxed,
                opts,
                cron,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&WorkerEntry> {
        self.entries.get(name)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn registered_workers(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Workers carrying a cron expression, for the scheduler's minute loop.
    pub(crate) fn cron_workers(&self) -> impl Iterator<Item = (&str, &CronExpr, Option<Tz>)> {
        self.entries.iter().filter_map(|(name, entry)| {
            entry
                .cron
                .as_ref()
                .map(|expr| (name.as_str(), expr, entry.opts.cron_timezone))
        })
    }
}

/// Thread-safe registry handle shared across producers and plugins.
pub type SharedRegistry = Arc<Registry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use chrono::Utc;
    use serde_json::json;
    use sqlx::types::Json;

    fn sample_job() -> Job {
        let now = Utc::now();
        Job {
            id: 7,
            state: JobState::Executing,
            queue: "default".to_string(),
            worker: "w".to_string(),
            attempt: 1,
            max_attempts: 3,
            priority: 0,
            args: json!({"id": 7}),
            meta: json!({}),
            tags: Vec::new(),
            errors: Json(Vec::new()),
            attempted_by: vec!["node-1".to_string()],
            inserted_at: now,
            scheduled_at: now,
            attempted_at: Some(now),
            completed_at: None,
            cancelled_at: None,
            discarded_at: None,
        }
    }

    #[test]
    fn backoff_doubles_from_base() {
        let backoff = Backoff {
            base: 15,
            max: 3600,
            jitter: false,
        };
        assert_eq!(backoff.delay(1), 15);
        assert_eq!(backoff.delay(2), 30);
        assert_eq!(backoff.delay(3), 60);
        assert_eq!(backoff.delay(5), 240);
    }

    #[test]
    fn backoff_caps_at_max() {
        let backoff = Backoff {
            base: 15,
            max: 120,
            jitter: false,
        };
        assert_eq!(backoff.delay(10), 120);
        assert_eq!(backoff.delay(200), 120);
    }

    #[test]
    fn jitter_stays_within_one_base() {
        let backoff = Backoff {
            base: 10,
            max: 3600,
            jitter: true,
        };
        for _ in 0..100 {
            let delay = backoff.delay(2);
            assert!((20..=30).contains(&delay));
        }
    }

    #[test]
    fn register_rejects_duplicates() {
        let mut registry = Registry::new();
        registry
            .register("w", WorkerOpts::default(), |_, _| async { Ok(Outcome::Complete) })
            .unwrap();
        let err = registry
            .register("w", WorkerOpts::default(), |_, _| async { Ok(Outcome::Complete) })
            .unwrap_err();
        assert!(matches!(err, Error::WorkerAlreadyRegistered(_)));
    }

    #[test]
    fn register_rejects_bad_cron() {
        let mut registry = Registry::new();
        let opts = WorkerOpts {
            cron: Some("not a cron".to_string()),
            ..WorkerOpts::default()
        };
        let err = registry
            .register("w", opts, |_, _| async { Ok(Outcome::Complete) })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCron { .. }));
    }

    #[test]
    fn cron_workers_only_lists_recurring_entries() {
        let mut registry = Registry::new();
        registry
            .register("plain", WorkerOpts::default(), |_, _| async {
                Ok(Outcome::Complete)
            })
            .unwrap();
        let opts = WorkerOpts {
            cron: Some("*/5 * * * *".to_string()),
            ..WorkerOpts::default()
        };
        registry
            .register("recurring", opts, |_, _| async { Ok(Outcome::Complete) })
            .unwrap();

        let cron: Vec<&str> = registry.cron_workers().map(|(name, _, _)| name).collect();
        assert_eq!(cron, vec!["recurring"]);
    }

    #[tokio::test]
    async fn registered_handler_receives_the_job() {
        let mut registry = Registry::new();
        registry
            .register("w", WorkerOpts::default(), |job, _| async move {
                let id = job.args["id"].as_i64().unwrap_or_default();
                Ok(Outcome::Discard(format!("saw {id}")))
            })
            .unwrap();

        let entry = registry.get("w").unwrap();
        let outcome = entry
            .call(sample_job(), CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Discard(reason) if reason == "saw 7"));
    }

    #[tokio::test]
    async fn handlers_observe_their_cancel_token() {
        let mut registry = Registry::new();
        registry
            .register("w", WorkerOpts::default(), |_, cancel| async move {
                if cancel.is_cancelled() {
                    return Ok(Outcome::Cancel("shutting down".to_string()));
                }
                Ok(Outcome::Complete)
            })
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let outcome = registry
            .get("w")
            .unwrap()
            .call(sample_job(), token)
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Cancel(_)));
    }
}
