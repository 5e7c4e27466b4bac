//! Per-queue producer: fetch, dispatch, acknowledge.
//!
//! One producer runs per (node, queue), holding a bounded concurrency
//! budget. Each loop turn it computes its demand, claims that many
//! `available` rows (already moved to `executing` by the fetch statement),
//! and spawns one supervised task per job. Outcomes funnel through an ack
//! queue and are flushed in batches.
//!
//! ```text
//! Producer
//!     │
//!     ├─► fetch (demand = limit − in_flight, SKIP LOCKED)
//!     ├─► dispatch (one task per job, optional timeout + cancel token)
//!     └─► ack (buffered, flushed as a single statement)
//! ```
//!
//! Shutdown drains cooperatively: fetching stops, in-flight jobs get their
//! cancel token, and whatever ignores it past the grace window is abandoned
//! still `executing` for the lifeline to rescue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as Delay, Utc};
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::job::{Job, JobError};
use crate::service::Service;
use crate::store::{JobAck, Store};
use crate::worker::{Backoff, Outcome, SharedRegistry};

/// Tuning for one producer.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub queue: String,
    /// Concurrency budget: maximum in-flight jobs.
    pub limit: usize,
    pub node: String,
    pub fetch_interval: Duration,
    pub ack_flush_interval: Duration,
    /// Buffer size that forces an early ack flush.
    pub ack_batch: usize,
    pub heartbeat_interval: Duration,
    /// How long draining waits for in-flight jobs before abandoning them.
    pub shutdown_grace: Duration,
    /// How long a timed-out job gets to honor its cancel token before the
    /// task is abandoned and a failure is recorded.
    pub timeout_grace: Duration,
}

impl ProducerConfig {
    pub fn new(queue: impl Into<String>, limit: usize, node: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            limit,
            node: node.into(),
            fetch_interval: Duration::from_secs(1),
            ack_flush_interval: Duration::from_millis(200),
            ack_batch: 100,
            heartbeat_interval: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(15),
            timeout_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProducerState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl ProducerState {
    fn as_str(&self) -> &'static str {
        match self {
            ProducerState::Starting => "starting",
            ProducerState::Running => "running",
            ProducerState::Draining => "draining",
            ProducerState::Stopped => "stopped",
        }
    }
}

/// How one attempt ended, before mapping to an acknowledgement.
enum Execution {
    Returned(anyhow::Result<Outcome>),
    Panicked(String),
    TimedOut,
}

impl Execution {
    fn from_join(joined: Result<anyhow::Result<Outcome>, JoinError>) -> Self {
        match joined {
            Ok(result) => Execution::Returned(result),
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Execution::Panicked(message)
            }
            Err(_) => Execution::Panicked("task aborted".to_string()),
        }
    }
}

pub struct Producer {
    store: Store,
    registry: SharedRegistry,
    config: ProducerConfig,
    /// Pinged by the notification router when this queue gains work.
    wakeup: Arc<Notify>,
    paused: Arc<AtomicBool>,
    uuid: Uuid,
}

impl Producer {
    pub fn new(
        store: Store,
        registry: SharedRegistry,
        config: ProducerConfig,
        wakeup: Arc<Notify>,
        paused: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            wakeup,
            paused,
            uuid: Uuid::new_v4(),
        }
    }

    fn set_state(&self, state: ProducerState) {
        info!(queue = %self.config.queue, state = state.as_str(), "producer state");
    }
}

#[async_trait]
impl Service for Producer {
    fn name(&self) -> &'static str {
        "producer"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        self.set_state(ProducerState::Starting);

        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<JobAck>();
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut ack_buffer: Vec<JobAck> = Vec::new();
        let cancel_jobs = CancellationToken::new();

        let mut fetch_tick = tokio::time::interval(self.config.fetch_interval);
        let mut flush_tick = tokio::time::interval(self.config.ack_flush_interval);
        let mut heartbeat_tick = tokio::time::interval(self.config.heartbeat_interval);

        self.heartbeat(0).await;
        self.set_state(ProducerState::Running);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = fetch_tick.tick() => {
                    self.fetch_and_dispatch(&mut tasks, &ack_tx, &cancel_jobs).await;
                }
                _ = self.wakeup.notified() => {
                    self.fetch_and_dispatch(&mut tasks, &ack_tx, &cancel_jobs).await;
                }
                Some(ack) = ack_rx.recv() => {
                    ack_buffer.push(ack);
                    while let Ok(more) = ack_rx.try_recv() {
                        ack_buffer.push(more);
                    }
                    if ack_buffer.len() >= self.config.ack_batch {
                        self.flush_acks(&mut ack_buffer).await;
                    }
                }
                _ = flush_tick.tick() => {
                    if !ack_buffer.is_empty() {
                        self.flush_acks(&mut ack_buffer).await;
                    }
                }
                _ = heartbeat_tick.tick() => {
                    self.heartbeat(tasks.len()).await;
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        self.set_state(ProducerState::Draining);
        cancel_jobs.cancel();

        let deadline = tokio::time::sleep(self.config.shutdown_grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                joined = tasks.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
            }
        }
        if !tasks.is_empty() {
            // Their rows stay `executing`; the lifeline brings them back.
            warn!(
                queue = %self.config.queue,
                abandoned = tasks.len(),
                "abandoning jobs that ignored cancellation"
            );
            tasks.abort_all();
        }

        while let Ok(ack) = ack_rx.try_recv() {
            ack_buffer.push(ack);
        }
        if !ack_buffer.is_empty() {
            self.flush_acks(&mut ack_buffer).await;
        }

        if let Err(e) = self.store.delete_producer(self.uuid).await {
            warn!(queue = %self.config.queue, error = %e, "failed to remove producer row");
        }
        self.set_state(ProducerState::Stopped);
        Ok(())
    }
}

impl Producer {
    async fn fetch_and_dispatch(
        &self,
        tasks: &mut JoinSet<()>,
        ack_tx: &mpsc::UnboundedSender<JobAck>,
        cancel_jobs: &CancellationToken,
    ) {
        if self.paused.load(Ordering::Relaxed) {
            return;
        }
        let demand = self.config.limit.saturating_sub(tasks.len());
        if demand == 0 {
            return;
        }

        let jobs = match self
            .store
            .fetch_available(&self.config.queue, &self.config.node, demand as i64)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                // Transient; the next tick retries.
                error!(queue = %self.config.queue, error = %e, "fetch failed");
                return;
            }
        };
        if jobs.is_empty() {
            return;
        }

        debug!(queue = %self.config.queue, count = jobs.len(), "dispatching jobs");
        for job in jobs {
            self.dispatch(job, tasks, ack_tx, cancel_jobs);
        }
    }

    fn dispatch(
        &self,
        job: Job,
        tasks: &mut JoinSet<()>,
        ack_tx: &mpsc::UnboundedSender<JobAck>,
        cancel_jobs: &CancellationToken,
    ) {
        let entry = match self.registry.get(&job.worker) {
            Some(entry) => entry,
            None => {
                error!(
                    queue = %self.config.queue,
                    job_id = job.id,
                    worker = %job.worker,
                    "no worker registered, discarding"
                );
                let error =
                    execution_error(&job, format!("no worker registered for {:?}", job.worker));
                let _ = ack_tx.send(JobAck::discarded(job.id, error));
                return;
            }
        };

        let token = cancel_jobs.child_token();
        let fut = entry.call(job.clone(), token.clone());
        let timeout = entry.opts.timeout;
        let backoff = entry.opts.backoff.clone();
        let grace = self.config.timeout_grace;
        let ack_tx = ack_tx.clone();

        tasks.spawn(async move {
            // The handler runs in its own task so a panic or an abort stays
            // contained and still produces an acknowledgement.
            let mut handle = tokio::spawn(fut);
            let execution = match timeout {
                Some(limit) => {
                    tokio::select! {
                        joined = &mut handle => Execution::from_join(joined),
                        _ = tokio::time::sleep(limit) => {
                            token.cancel();
                            match tokio::time::timeout(grace, &mut handle).await {
                                Ok(joined) => Execution::from_join(joined),
                                Err(_) => {
                                    handle.abort();
                                    Execution::TimedOut
                                }
                            }
                        }
                    }
                }
                None => Execution::from_join((&mut handle).await),
            };
            let _ = ack_tx.send(ack_for(&job, execution, &backoff));
        });
    }

    async fn flush_acks(&self, buffer: &mut Vec<JobAck>) {
        match self.store.ack_jobs(buffer).await {
            Ok(acked) => {
                debug!(
                    queue = %self.config.queue,
                    flushed = buffer.len(),
                    acked,
                    "flushed acks"
                );
                buffer.clear();
            }
            Err(e) => {
                // Keep the buffer; the next flush retries it whole.
                error!(queue = %self.config.queue, error = %e, "ack flush failed");
            }
        }
    }

    async fn heartbeat(&self, in_flight: usize) {
        let meta = json!({
            "limit": self.config.limit,
            "paused": self.paused.load(Ordering::Relaxed),
            "running": in_flight,
        });
        if let Err(e) = self
            .store
            .upsert_producer(self.uuid, &self.config.node, &self.config.queue, &meta)
            .await
        {
            warn!(queue = %self.config.queue, error = %e, "producer heartbeat failed");
        }
    }
}

/// Map one finished attempt to its acknowledgement, per the outcome table:
/// success completes, cancel/discard are terminal, everything else retries
/// with backoff until the attempt budget is spent.
fn ack_for(job: &Job, execution: Execution, backoff: &Backoff) -> JobAck {
    match execution {
        Execution::Returned(Ok(Outcome::Complete)) => JobAck::completed(job.id),
        Execution::Returned(Ok(Outcome::Cancel(_))) => JobAck::cancelled(job.id),
        Execution::Returned(Ok(Outcome::Discard(reason))) => {
            JobAck::discarded(job.id, execution_error(job, reason))
        }
        Execution::Returned(Ok(Outcome::Snooze(secs))) => {
            JobAck::snoozed(job.id, Utc::now() + Delay::seconds(secs.max(0)))
        }
        Execution::Returned(Ok(Outcome::Retry(reason))) => failure(
            job,
            reason.unwrap_or_else(|| "retry requested".to_string()),
            backoff,
        ),
        Execution::Returned(Err(e)) => failure(job, format!("{e:#}"), backoff),
        Execution::Panicked(message) => failure(job, format!("panic: {message}"), backoff),
        Execution::TimedOut => failure(job, "execution timed out".to_string(), backoff),
    }
}

fn failure(job: &Job, reason: String, backoff: &Backoff) -> JobAck {
    let error = execution_error(job, reason);
    if job.attempt < job.max_attempts {
        let delay = backoff.delay(job.attempt) as i64;
        JobAck::retryable(job.id, error, Utc::now() + Delay::seconds(delay))
    } else {
        JobAck::discarded(job.id, error)
    }
}

fn execution_error(job: &Job, reason: String) -> JobError {
    JobError {
        attempt: job.attempt,
        at: Utc::now(),
        error: reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use sqlx::types::Json;

    fn executing_job(attempt: i32, max_attempts: i32) -> Job {
        let now = Utc::now();
        Job {
            id: 42,
            state: JobState::Executing,
            queue: "default".to_string(),
            worker: "w".to_string(),
            attempt,
            max_attempts,
            priority: 0,
            args: json!({}),
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

    fn no_jitter() -> Backoff {
        Backoff {
            base: 15,
            max: 3600,
            jitter: false,
        }
    }

    #[test]
    fn success_completes() {
        let job = executing_job(1, 3);
        let ack = ack_for(&job, Execution::Returned(Ok(Outcome::Complete)), &no_jitter());
        assert_eq!(ack.state, JobState::Completed);
        assert!(ack.error.is_none());
    }

    #[test]
    fn cancel_is_terminal_without_an_error() {
        let job = executing_job(1, 3);
        let execution = Execution::Returned(Ok(Outcome::Cancel("stale".to_string())));
        let ack = ack_for(&job, execution, &no_jitter());
        assert_eq!(ack.state, JobState::Cancelled);
        assert!(ack.error.is_none());
    }

    #[test]
    fn discard_is_terminal_regardless_of_budget() {
        let job = executing_job(1, 20);
        let execution = Execution::Returned(Ok(Outcome::Discard("bad input".to_string())));
        let ack = ack_for(&job, execution, &no_jitter());
        assert_eq!(ack.state, JobState::Discarded);
        assert_eq!(ack.error.as_ref().map(|e| e.error.as_str()), Some("bad input"));
    }

    #[test]
    fn failure_with_budget_left_retries_with_backoff() {
        let job = executing_job(2, 5);
        let before = Utc::now();
        let execution = Execution::Returned(Err(anyhow::anyhow!("connection reset")));
        let ack = ack_for(&job, execution, &no_jitter());
        assert_eq!(ack.state, JobState::Retryable);
        let at = ack.reschedule_at.unwrap();
        // attempt 2 with base 15 backs off 30 seconds
        assert!(at >= before + Delay::seconds(30));
        assert!(at <= Utc::now() + Delay::seconds(31));
        let error = ack.error.unwrap();
        assert_eq!(error.attempt, 2);
        assert!(error.error.contains("connection reset"));
    }

    #[test]
    fn failure_on_last_attempt_discards() {
        let job = executing_job(3, 3);
        let execution = Execution::Returned(Err(anyhow::anyhow!("boom")));
        let ack = ack_for(&job, execution, &no_jitter());
        assert_eq!(ack.state, JobState::Discarded);
        assert!(ack.error.is_some());
    }

    #[test]
    fn single_attempt_failure_goes_straight_to_discarded() {
        let job = executing_job(1, 1);
        let execution = Execution::Returned(Err(anyhow::anyhow!("boom")));
        let ack = ack_for(&job, execution, &no_jitter());
        assert_eq!(ack.state, JobState::Discarded);
    }

    #[test]
    fn panic_is_a_retryable_failure() {
        let job = executing_job(1, 3);
        let ack = ack_for(&job, Execution::Panicked("index out of bounds".to_string()), &no_jitter());
        assert_eq!(ack.state, JobState::Retryable);
        assert!(ack.error.unwrap().error.contains("panic"));
    }

    #[test]
    fn timeout_is_a_failure() {
        let job = executing_job(1, 2);
        let ack = ack_for(&job, Execution::TimedOut, &no_jitter());
        assert_eq!(ack.state, JobState::Retryable);
        assert!(ack.error.unwrap().error.contains("timed out"));
    }

    #[test]
    fn snooze_reschedules_and_refunds_the_attempt() {
        let job = executing_job(1, 3);
        let execution = Execution::Returned(Ok(Outcome::Snooze(90)));
        let ack = ack_for(&job, execution, &no_jitter());
        assert_eq!(ack.state, JobState::Scheduled);
        assert_eq!(ack.attempt_delta, -1);
        assert!(ack.reschedule_at.unwrap() > Utc::now() + Delay::seconds(60));
    }
}
