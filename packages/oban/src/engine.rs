//! Engine assembly: configuration, registry, pool, and every running
//! service, held in one explicit value.
//!
//! ```text
//! Engine
//!     │
//!     ├─► notification router (LISTEN → per-queue wakeups)
//!     ├─► leadership loop (lease claim/renew, watch flag)
//!     ├─► scheduler / pruner / lifeline (gated on the flag)
//!     └─► one producer per configured queue
//! ```
//!
//! Callers submit jobs through [`Engine::insert`] / [`Engine::insert_all`];
//! the engine resolves registry defaults, rewrites unique specs into meta
//! fingerprints, and writes the row. The database remains the single source
//! of truth for job state.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::job::{JobSpec, JobState};
use crate::leader::Leadership;
use crate::notifier::{NotificationRouter, Notifier};
use crate::plugins::{Lifeline, Pruner, Scheduler};
use crate::producer::{Producer, ProducerConfig};
use crate::service::{ServiceExit, ServiceHost};
use crate::store::{InsertResult, NewJob, Store};
use crate::unique;
use crate::worker::{Registry, SharedRegistry};

pub struct Engine {
    store: Store,
    notifier: Notifier,
    registry: SharedRegistry,
    config: Config,
    wakers: Arc<HashMap<String, Arc<Notify>>>,
    paused: HashMap<String, Arc<AtomicBool>>,
    shutdown: CancellationToken,
    services: Mutex<ServiceHost>,
    started: AtomicBool,
}

impl Engine {
    /// Connect to the database, run migrations, and build an engine.
    pub async fn connect(config: Config, registry: Registry) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Self::new(pool, config, registry)
    }

    /// Build an engine over an existing pool. The schema must already be in
    /// place (see [`Engine::connect`]).
    pub fn new(pool: PgPool, config: Config, registry: Registry) -> Result<Self> {
        for (queue, limit) in &config.queues {
            if queue.is_empty() {
                return Err(Error::Config("queue names must be non-empty".to_string()));
            }
            if *limit == 0 {
                return Err(Error::Config(format!(
                    "queue {queue:?} must have a limit of at least 1"
                )));
            }
        }

        let wakers: HashMap<String, Arc<Notify>> = config
            .queues
            .keys()
            .map(|queue| (queue.clone(), Arc::new(Notify::new())))
            .collect();
        let paused = config
            .queues
            .keys()
            .map(|queue| (queue.clone(), Arc::new(AtomicBool::new(false))))
            .collect();

        Ok(Self {
            store: Store::new(pool.clone()),
            notifier: Notifier::new(pool),
            registry: Arc::new(registry),
            config,
            wakers: Arc::new(wakers),
            paused,
            shutdown: CancellationToken::new(),
            services: Mutex::new(ServiceHost::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Spawn every service. Idempotent; later calls are no-ops.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let queues: Vec<&String> = self.config.queues.keys().collect();
        info!(node = %self.config.node, queues = ?queues, "engine starting");

        let mut services = self.services.lock().await;

        let router = NotificationRouter::new(self.notifier.clone(), self.wakers.clone());
        services.spawn(Box::new(router), self.shutdown.clone());

        let leadership = Leadership::new(
            self.store.clone(),
            self.config.node.clone(),
            &self.config.leader,
        );
        let leader_watch = leadership.watch();
        services.spawn(Box::new(leadership), self.shutdown.clone());

        let scheduler = Scheduler::new(
            self.store.clone(),
            self.notifier.clone(),
            self.registry.clone(),
            self.config.timezone,
            self.config.stage_interval,
            leader_watch.clone(),
        );
        services.spawn(Box::new(scheduler), self.shutdown.clone());

        let pruner = Pruner::new(
            self.store.clone(),
            self.config.pruner.clone(),
            leader_watch.clone(),
        );
        services.spawn(Box::new(pruner), self.shutdown.clone());

        let lifeline = Lifeline::new(
            self.store.clone(),
            self.config.lifeline.clone(),
            leader_watch,
        );
        services.spawn(Box::new(lifeline), self.shutdown.clone());

        for (queue, limit) in &self.config.queues {
            let (Some(waker), Some(paused)) = (self.wakers.get(queue), self.paused.get(queue))
            else {
                continue;
            };
            let mut producer_config =
                ProducerConfig::new(queue.clone(), *limit, self.config.node.clone());
            producer_config.shutdown_grace = self.config.shutdown_grace;
            let producer = Producer::new(
                self.store.clone(),
                self.registry.clone(),
                producer_config,
                waker.clone(),
                paused.clone(),
            );
            services.spawn(Box::new(producer), self.shutdown.clone());
        }

        Ok(())
    }

    /// Run until shutdown is initiated or a service dies.
    ///
    /// Returns `Ok` after a graceful drain and `Err` when a supervised
    /// service panicked, which is unrecoverable for this process.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        let mut services = self.services.lock().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let deadline = self.config.shutdown_grace + Duration::from_secs(10);
                    if tokio::time::timeout(deadline, services.drain()).await.is_err() {
                        warn!("services did not drain in time, aborting the rest");
                        services.abort_all();
                    }
                    info!("engine stopped");
                    return Ok(());
                }
                exit = services.join_next() => match exit {
                    Some(ServiceExit::Clean { name, result: Ok(()) }) => {
                        debug!(service = name, "service stopped");
                    }
                    Some(ServiceExit::Clean { name, result: Err(e) }) => {
                        error!(service = name, error = %e, "service failed");
                        self.shutdown.cancel();
                        return Err(Error::Runtime(format!("{name}: {e}")));
                    }
                    Some(ServiceExit::Panicked(message)) => {
                        error!(error = %message, "service panicked");
                        self.shutdown.cancel();
                        return Err(Error::Runtime(message));
                    }
                    Some(ServiceExit::Aborted) => {}
                    None => return Ok(()),
                }
            }
        }
    }

    /// Request a graceful shutdown; `run` (or [`Engine::stop`]) completes the
    /// drain.
    pub fn initiate_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Shut down and wait for every service to drain.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let mut services = self.services.lock().await;
        services.drain().await;
    }

    // ------------------------------------------------------------------
    // Submission API
    // ------------------------------------------------------------------

    /// Insert one job, honoring its unique spec.
    pub async fn insert(&self, spec: JobSpec) -> Result<InsertResult> {
        let new = assemble(&spec, &self.registry, Utc::now())?;
        let result = self.store.insert_job(&new).await?;
        if !result.conflicted && result.job.state == JobState::Available {
            self.notify_quietly(&result.job.queue).await;
        }
        Ok(result)
    }

    /// Insert many jobs with per-row conflict resolution.
    pub async fn insert_all(&self, specs: Vec<JobSpec>) -> Result<Vec<InsertResult>> {
        let now = Utc::now();
        let mut rows = Vec::with_capacity(specs.len());
        for spec in &specs {
            rows.push(assemble(spec, &self.registry, now)?);
        }

        let results = self.store.insert_all(&rows).await?;

        let queues: BTreeSet<&str> = results
            .iter()
            .filter(|r| !r.conflicted && r.job.state == JobState::Available)
            .map(|r| r.job.queue.as_str())
            .collect();
        for queue in queues {
            self.notify_quietly(queue).await;
        }
        Ok(results)
    }

    /// Cancel a job that is not currently executing. Executing jobs are
    /// cancelled cooperatively by their owning producer.
    pub async fn cancel_job(&self, id: i64) -> Result<bool> {
        self.store.cancel_job(id).await
    }

    /// Stage a waiting (`scheduled`/`retryable`) job immediately.
    pub async fn retry_job(&self, id: i64) -> Result<bool> {
        let retried = self.store.retry_job(id).await?;
        if retried {
            if let Ok(job) = self.store.fetch_job(id).await {
                self.notify_quietly(&job.queue).await;
            }
        }
        Ok(retried)
    }

    /// Stop the local producer for `queue` from fetching. Jobs keep
    /// accumulating as `available`.
    pub fn pause_queue(&self, queue: &str) -> bool {
        match self.paused.get(queue) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                info!(queue = %queue, "queue paused");
                true
            }
            None => false,
        }
    }

    pub fn resume_queue(&self, queue: &str) -> bool {
        match self.paused.get(queue) {
            Some(flag) => {
                flag.store(false, Ordering::Relaxed);
                info!(queue = %queue, "queue resumed");
                if let Some(waker) = self.wakers.get(queue) {
                    waker.notify_one();
                }
                true
            }
            None => false,
        }
    }

    /// Notification loss only costs latency (producers poll), so inserts
    /// never fail on it.
    async fn notify_quietly(&self, queue: &str) {
        if let Err(e) = self.notifier.notify(queue).await {
            warn!(queue = %queue, error = %e, "failed to notify queue");
        }
    }
}

/// Resolve a spec into an insertable row: registry defaults fill unset
/// fields, and a unique spec (from the submission or the worker's options)
/// becomes a fingerprint stamped into `meta`.
pub(crate) fn assemble(
    spec: &JobSpec,
    registry: &Registry,
    now: DateTime<Utc>,
) -> Result<NewJob> {
    if spec.worker.is_empty() {
        return Err(Error::InvalidSpec("worker must be non-empty".to_string()));
    }
    if !spec.args.is_object() {
        return Err(Error::InvalidSpec("args must be a JSON object".to_string()));
    }
    if !spec.meta.is_object() {
        return Err(Error::InvalidSpec("meta must be a JSON object".to_string()));
    }

    // Jobs may target workers registered only on other nodes, so a missing
    // entry is not an error here; it only means global defaults apply.
    let entry = registry.get(&spec.worker);
    let opts = entry.map(|e| &e.opts);

    let queue = spec
        .queue
        .clone()
        .or_else(|| opts.map(|o| o.queue.clone()))
        .unwrap_or_else(|| "default".to_string());
    if queue.is_empty() {
        return Err(Error::InvalidSpec("queue must be non-empty".to_string()));
    }

    let priority = spec
        .priority
        .or(opts.map(|o| o.priority))
        .unwrap_or(0);
    if priority < 0 {
        return Err(Error::InvalidSpec("priority must be non-negative".to_string()));
    }

    let max_attempts = spec
        .max_attempts
        .or(opts.map(|o| o.max_attempts))
        .unwrap_or(20);
    if max_attempts < 1 {
        return Err(Error::InvalidSpec("max_attempts must be at least 1".to_string()));
    }

    let (state, scheduled_at) = spec.resolve_schedule(now);

    let mut meta = spec.meta.clone();
    let unique_spec = spec
        .unique
        .clone()
        .or_else(|| opts.and_then(|o| o.unique.clone()));
    let uniq_key = unique_spec.map(|u| {
        let key = u.fingerprint(spec, &queue, now);
        unique::apply_to_meta(&mut meta, key.clone(), u.bitmap());
        key
    });

    Ok(NewJob {
        state,
        queue,
        worker: spec.worker.clone(),
        args: spec.args.clone(),
        meta,
        tags: spec.tags.clone(),
        priority,
        max_attempts,
        scheduled_at,
        uniq_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unique::{UniqueSpec, META_BITMAP, META_KEY};
    use crate::worker::{Outcome, WorkerOpts};
    use serde_json::json;

    fn registry_with_mailer() -> Registry {
        let mut registry = Registry::new();
        let opts = WorkerOpts {
            queue: "mailers".to_string(),
            priority: 2,
            max_attempts: 5,
            unique: Some(UniqueSpec::default()),
            ..WorkerOpts::default()
        };
        registry
            .register("mailer.deliver", opts, |_, _| async { Ok(Outcome::Complete) })
            .unwrap();
        registry
    }

    #[test]
    fn unregistered_worker_gets_global_defaults() {
        let registry = Registry::new();
        let new = assemble(&JobSpec::new("remote.worker"), &registry, Utc::now()).unwrap();
        assert_eq!(new.queue, "default");
        assert_eq!(new.priority, 0);
        assert_eq!(new.max_attempts, 20);
        assert_eq!(new.state, JobState::Available);
        assert!(new.uniq_key.is_none());
    }

    #[test]
    fn registry_options_fill_unset_fields() {
        let registry = registry_with_mailer();
        let new = assemble(&JobSpec::new("mailer.deliver"), &registry, Utc::now()).unwrap();
        assert_eq!(new.queue, "mailers");
        assert_eq!(new.priority, 2);
        assert_eq!(new.max_attempts, 5);
        assert!(new.uniq_key.is_some());
        assert_eq!(new.meta[META_KEY], json!(new.uniq_key.clone().unwrap()));
        assert_eq!(new.meta[META_BITMAP], json!(0b0011111));
    }

    #[test]
    fn spec_fields_override_registry_options() {
        let registry = registry_with_mailer();
        let spec = JobSpec::builder()
            .worker("mailer.deliver")
            .queue("priority_mail")
            .priority(0)
            .max_attempts(1)
            .build();
        let new = assemble(&spec, &registry, Utc::now()).unwrap();
        assert_eq!(new.queue, "priority_mail");
        assert_eq!(new.priority, 0);
        assert_eq!(new.max_attempts, 1);
    }

    #[test]
    fn malformed_specs_are_rejected() {
        let registry = Registry::new();
        let empty_worker = JobSpec::builder().worker("").build();
        assert!(matches!(
            assemble(&empty_worker, &registry, Utc::now()),
            Err(Error::InvalidSpec(_))
        ));

        let bad_args = JobSpec::builder().worker("w").args(json!([1, 2])).build();
        assert!(matches!(
            assemble(&bad_args, &registry, Utc::now()),
            Err(Error::InvalidSpec(_))
        ));

        let bad_attempts = JobSpec::builder().worker("w").max_attempts(0).build();
        assert!(matches!(
            assemble(&bad_attempts, &registry, Utc::now()),
            Err(Error::InvalidSpec(_))
        ));
    }

    #[test]
    fn explicit_unique_spec_wins_over_registry() {
        let registry = registry_with_mailer();
        let unique = UniqueSpec {
            period: None,
            ..UniqueSpec::default()
        };
        let spec = JobSpec::builder()
            .worker("mailer.deliver")
            .unique(unique.clone())
            .build();
        let now = Utc::now();
        let new = assemble(&spec, &registry, now).unwrap();
        assert_eq!(
            new.uniq_key.as_deref(),
            Some(unique.fingerprint(&spec, "mailers", now).as_str())
        );
    }

    #[test]
    fn future_specs_assemble_as_scheduled() {
        let registry = Registry::new();
        let spec = JobSpec::builder().worker("w").schedule_in(300i64).build();
        let now = Utc::now();
        let new = assemble(&spec, &registry, now).unwrap();
        assert_eq!(new.state, JobState::Scheduled);
        assert_eq!(new.scheduled_at, now + chrono::Duration::seconds(300));
    }
}
