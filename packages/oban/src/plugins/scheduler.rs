//! Staging sweeps and cron materialization.
//!
//! Staging runs on a short interval and moves due `scheduled`/`retryable`
//! rows to `available` in bulk, then notifies the producers of every queue
//! that gained work. Cron runs once per minute boundary: each registered
//! recurring worker whose expression matches the boundary (in its zone) gets
//! one job inserted through the uniqueness protocol, fingerprinted on
//! (worker, minute bucket) so duplicate ticks and leader handovers never
//! double-insert.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::engine::assemble;
use crate::error::Result;
use crate::job::{JobSpec, JobState};
use crate::notifier::Notifier;
use crate::service::Service;
use crate::store::Store;
use crate::unique::UniqueSpec;
use crate::worker::SharedRegistry;

const STAGE_BATCH: i64 = 10_000;

pub struct Scheduler {
    store: Store,
    notifier: Notifier,
    registry: SharedRegistry,
    timezone: Tz,
    stage_interval: Duration,
    leader: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        store: Store,
        notifier: Notifier,
        registry: SharedRegistry,
        timezone: Tz,
        stage_interval: Duration,
        leader: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            notifier,
            registry,
            timezone,
            stage_interval,
            leader,
        }
    }
}

#[async_trait]
impl Service for Scheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut leader = self.leader.clone();
        let mut stage_tick = tokio::time::interval(self.stage_interval);
        stage_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if !*leader.borrow() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = leader.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            let boundary = next_minute(Utc::now());
            let until = (boundary - Utc::now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = leader.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = stage_tick.tick() => self.stage().await,
                _ = tokio::time::sleep(until) => self.materialize(boundary).await,
            }
        }
        Ok(())
    }
}

impl Scheduler {
    /// One staging sweep, batched until the backlog is drained.
    async fn stage(&self) {
        let mut queues = BTreeSet::new();
        loop {
            match self.store.stage_jobs(STAGE_BATCH).await {
                Ok(staged) => {
                    let count = staged.len() as i64;
                    queues.extend(staged);
                    if count < STAGE_BATCH {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "staging sweep failed");
                    break;
                }
            }
        }

        if queues.is_empty() {
            return;
        }
        debug!(queues = ?queues, "staged jobs");
        for queue in queues {
            if let Err(e) = self.notifier.notify(&queue).await {
                warn!(queue = %queue, error = %e, "failed to notify staged queue");
            }
        }
    }

    /// Insert one job per cron worker whose expression matches `boundary`.
    async fn materialize(&self, boundary: DateTime<Utc>) {
        for (name, expr, zone) in self.registry.cron_workers() {
            let local = boundary.with_timezone(&zone.unwrap_or(self.timezone));
            if !expr.matches(&local) {
                continue;
            }

            let spec = JobSpec::builder()
                .worker(name.to_string())
                .meta(json!({"cron": true, "cron_expr": expr.to_string()}))
                .unique(UniqueSpec::for_cron())
                .build();

            let new = match assemble(&spec, &self.registry, boundary) {
                Ok(new) => new,
                Err(e) => {
                    error!(worker = name, error = %e, "could not assemble cron job");
                    continue;
                }
            };

            match self.store.insert_job(&new).await {
                Ok(result) if result.conflicted => {
                    debug!(worker = name, "cron job already inserted for this minute");
                }
                Ok(result) => {
                    debug!(worker = name, job_id = result.job.id, "materialized cron job");
                    if result.job.state == JobState::Available {
                        if let Err(e) = self.notifier.notify(&result.job.queue).await {
                            warn!(queue = %result.job.queue, error = %e, "failed to notify cron queue");
                        }
                    }
                }
                Err(e) => error!(worker = name, error = %e, "cron insert failed"),
            }
        }
    }
}

fn next_minute(now: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = now
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    truncated + chrono::Duration::minutes(1)
}
