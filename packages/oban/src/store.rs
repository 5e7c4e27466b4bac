//! PostgreSQL access layer for the `oban_*` tables.
//!
//! Every statement the engine issues lives here. Row-level locking is the
//! only concurrency primitive: fetches take `FOR UPDATE SKIP LOCKED` so
//! producers never double-dispatch, acks reacquire `FOR UPDATE` on ids still
//! in `executing` so results for rescued rows are silently dropped.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::job::{Job, JobError, JobState};

const JOB_COLUMNS: &str = "id, state, queue, worker, attempt, max_attempts, priority, args, meta, \
     tags, errors, attempted_by, inserted_at, scheduled_at, attempted_at, completed_at, \
     cancelled_at, discarded_at";

/// A fully-resolved row ready for insertion. Built by the engine from a
/// [`JobSpec`](crate::job::JobSpec) plus registry defaults; `meta` already
/// carries the uniqueness stamp when `uniq_key` is set.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub state: JobState,
    pub queue: String,
    pub worker: String,
    pub args: Value,
    pub meta: Value,
    pub tags: Vec<String>,
    pub priority: i32,
    pub max_attempts: i32,
    pub scheduled_at: DateTime<Utc>,
    pub uniq_key: Option<String>,
}

/// Result of a single insert: the row that now exists for the spec, and
/// whether it was an already-present duplicate.
#[derive(Debug, Clone)]
pub struct InsertResult {
    pub job: Job,
    pub conflicted: bool,
}

/// One producer acknowledgement, flushed in batches.
#[derive(Debug, Clone)]
pub struct JobAck {
    pub id: i64,
    pub state: JobState,
    pub error: Option<JobError>,
    pub reschedule_at: Option<DateTime<Utc>>,
    /// Applied to `attempt`; `-1` returns a snoozed attempt to the budget.
    pub attempt_delta: i32,
}

impl JobAck {
    pub fn completed(id: i64) -> Self {
        Self {
            id,
            state: JobState::Completed,
            error: None,
            reschedule_at: None,
            attempt_delta: 0,
        }
    }

    pub fn cancelled(id: i64) -> Self {
        Self {
            id,
            state: JobState::Cancelled,
            error: None,
            reschedule_at: None,
            attempt_delta: 0,
        }
    }

    pub fn discarded(id: i64, error: JobError) -> Self {
        Self {
            id,
            state: JobState::Discarded,
            error: Some(error),
            reschedule_at: None,
            attempt_delta: 0,
        }
    }

    pub fn retryable(id: i64, error: JobError, at: DateTime<Utc>) -> Self {
        Self {
            id,
            state: JobState::Retryable,
            error: Some(error),
            reschedule_at: Some(at),
            attempt_delta: 0,
        }
    }

    pub fn snoozed(id: i64, at: DateTime<Utc>) -> Self {
        Self {
            id,
            state: JobState::Scheduled,
            error: None,
            reschedule_at: Some(at),
            attempt_delta: -1,
        }
    }
}

/// Thin handle over the pool; cheap to clone into every service.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Inserts
    // ------------------------------------------------------------------

    /// Insert one job, resolving unique conflicts per the fingerprint carried
    /// in `meta`. On a collision the existing row is fetched and returned
    /// with `conflicted = true`.
    pub async fn insert_job(&self, new: &NewJob) -> Result<InsertResult> {
        let sql = format!(
            r#"
            INSERT INTO oban_jobs (state, queue, worker, args, meta, tags, priority, max_attempts, scheduled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (uniq_key) WHERE uniq_key IS NOT NULL DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        );

        // A colliding row can be pruned between the failed insert and the
        // fetch-back, so the pair is retried a few times before giving up.
        for _ in 0..3 {
            let inserted = sqlx::query_as::<_, Job>(&sql)
                .bind(new.state)
                .bind(&new.queue)
                .bind(&new.worker)
                .bind(&new.args)
                .bind(&new.meta)
                .bind(&new.tags)
                .bind(new.priority)
                .bind(new.max_attempts)
                .bind(new.scheduled_at)
                .fetch_optional(&self.pool)
                .await?;

            if let Some(job) = inserted {
                return Ok(InsertResult {
                    job,
                    conflicted: false,
                });
            }

            let key = new
                .uniq_key
                .as_deref()
                .ok_or_else(|| Error::UniqueConflictUnresolved(String::new()))?;
            if let Some(job) = self.fetch_by_uniq_key(key).await? {
                return Ok(InsertResult {
                    job,
                    conflicted: true,
                });
            }
        }

        Err(Error::UniqueConflictUnresolved(
            new.uniq_key.clone().unwrap_or_default(),
        ))
    }

    /// Insert many jobs with per-row conflict resolution.
    pub async fn insert_all(&self, jobs: &[NewJob]) -> Result<Vec<InsertResult>> {
        let mut results = Vec::with_capacity(jobs.len());
        for job in jobs {
            results.push(self.insert_job(job).await?);
        }
        Ok(results)
    }

    async fn fetch_by_uniq_key(&self, key: &str) -> Result<Option<Job>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM oban_jobs
            WHERE uniq_key = $1
            LIMIT 1
            "#
        );
        Ok(sqlx::query_as::<_, Job>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn fetch_job(&self, id: i64) -> Result<Job> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM oban_jobs WHERE id = $1");
        Ok(sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await?)
    }

    // ------------------------------------------------------------------
    // Producer fetch / ack
    // ------------------------------------------------------------------

    /// Claim up to `limit` available jobs on a queue for `node`, moving them
    /// to `executing`. `SKIP LOCKED` guarantees no two producers receive the
    /// same row; rows come back in dispatch order.
    pub async fn fetch_available(&self, queue: &str, node: &str, limit: i64) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM oban_jobs
                WHERE state = 'available' AND queue = $1
                ORDER BY priority ASC, scheduled_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE oban_jobs j
            SET state = 'executing',
                attempted_at = NOW(),
                attempt = j.attempt + 1,
                attempted_by = array_append(j.attempted_by, $3)
            WHERE j.id IN (SELECT id FROM claimable)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let mut jobs = sqlx::query_as::<_, Job>(&sql)
            .bind(queue)
            .bind(limit)
            .bind(node)
            .fetch_all(&self.pool)
            .await?;

        // UPDATE ... RETURNING does not preserve the CTE's ordering.
        jobs.sort_by(|a, b| {
            (a.priority, a.scheduled_at, a.id).cmp(&(b.priority, b.scheduled_at, b.id))
        });
        Ok(jobs)
    }

    /// Flush a batch of acknowledgements in one statement.
    ///
    /// Only rows still in `executing` are touched: a row rescued by the
    /// lifeline in the meantime keeps its new state and the producer's
    /// result for it is dropped. Returns the number of rows acknowledged.
    pub async fn ack_jobs(&self, acks: &[JobAck]) -> Result<u64> {
        if acks.is_empty() {
            return Ok(0);
        }

        let mut ids = Vec::with_capacity(acks.len());
        let mut states = Vec::with_capacity(acks.len());
        let mut errors: Vec<Option<Value>> = Vec::with_capacity(acks.len());
        let mut reschedules = Vec::with_capacity(acks.len());
        let mut deltas = Vec::with_capacity(acks.len());
        for ack in acks {
            ids.push(ack.id);
            states.push(ack.state.as_str().to_string());
            errors.push(match &ack.error {
                Some(error) => Some(serde_json::to_value(error)?),
                None => None,
            });
            reschedules.push(ack.reschedule_at);
            deltas.push(ack.attempt_delta);
        }

        let result = sqlx::query(
            r#"
            WITH acks AS (
                SELECT * FROM UNNEST($1::bigint[], $2::text[], $3::jsonb[], $4::timestamptz[], $5::int[])
                    AS t(id, state, error, reschedule_at, attempt_delta)
            ),
            locked AS (
                SELECT j.id
                FROM oban_jobs j
                JOIN acks a ON a.id = j.id
                WHERE j.state = 'executing'
                FOR UPDATE OF j
            )
            UPDATE oban_jobs j
            SET state = a.state::oban_job_state,
                attempt = j.attempt + a.attempt_delta,
                errors = CASE WHEN a.error IS NULL THEN j.errors ELSE j.errors || a.error END,
                scheduled_at = COALESCE(a.reschedule_at, j.scheduled_at),
                completed_at = CASE WHEN a.state = 'completed' THEN NOW() ELSE j.completed_at END,
                cancelled_at = CASE WHEN a.state = 'cancelled' THEN NOW() ELSE j.cancelled_at END,
                discarded_at = CASE WHEN a.state = 'discarded' THEN NOW() ELSE j.discarded_at END
            FROM acks a
            WHERE j.id = a.id AND j.id IN (SELECT id FROM locked)
            "#,
        )
        .bind(&ids)
        .bind(&states)
        .bind(&errors)
        .bind(&reschedules)
        .bind(&deltas)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Leader plugins
    // ------------------------------------------------------------------

    /// Move due `scheduled`/`retryable` rows to `available`, returning the
    /// queue of each staged row so producers can be notified.
    pub async fn stage_jobs(&self, limit: i64) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            r#"
            WITH staged AS (
                SELECT id
                FROM oban_jobs
                WHERE state IN ('scheduled', 'retryable') AND scheduled_at <= NOW()
                ORDER BY scheduled_at ASC, id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE oban_jobs j
            SET state = 'available'
            WHERE j.id IN (SELECT id FROM staged)
            RETURNING j.queue
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Delete up to `limit` terminal rows older than `max_age`.
    pub async fn prune_jobs(&self, max_age: Duration, limit: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM oban_jobs
            WHERE id IN (
                SELECT id
                FROM oban_jobs
                WHERE (state = 'completed' AND completed_at < NOW() - make_interval(secs => $1))
                   OR (state = 'cancelled' AND cancelled_at < NOW() - make_interval(secs => $1))
                   OR (state = 'discarded' AND discarded_at < NOW() - make_interval(secs => $1))
                LIMIT $2
            )
            "#,
        )
        .bind(max_age.as_secs_f64())
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Return `executing` rows whose owning producer heartbeat is missing or
    /// stale to `available` (or `discarded` when the budget is spent),
    /// without touching `attempt`.
    pub async fn rescue_orphans(&self, stale_after: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE oban_jobs j
            SET state = CASE WHEN j.attempt < j.max_attempts THEN 'available' ELSE 'discarded' END::oban_job_state,
                discarded_at = CASE WHEN j.attempt < j.max_attempts THEN j.discarded_at ELSE NOW() END
            WHERE j.state = 'executing'
              AND NOT EXISTS (
                  SELECT 1
                  FROM oban_producers p
                  WHERE p.node = j.attempted_by[array_upper(j.attempted_by, 1)]
                    AND p.queue = j.queue
                    AND p.updated_at > NOW() - make_interval(secs => $1)
              )
            "#,
        )
        .bind(stale_after.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Leadership
    // ------------------------------------------------------------------

    /// Claim or renew the cluster lease. Returns whether this node is now
    /// the leader.
    pub async fn claim_leadership(&self, name: &str, node: &str, lease: Duration) -> Result<bool> {
        let row = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO oban_leaders (name, node, elected_at, expires_at)
            VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3))
            ON CONFLICT (name) DO UPDATE
            SET node = EXCLUDED.node,
                elected_at = NOW(),
                expires_at = NOW() + make_interval(secs => $3)
            WHERE oban_leaders.node = EXCLUDED.node
               OR oban_leaders.expires_at < NOW()
            RETURNING node
            "#,
        )
        .bind(name)
        .bind(node)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_deref() == Some(node))
    }

    /// Drop the lease on clean shutdown so another node can take over
    /// without waiting for expiry.
    pub async fn resign_leadership(&self, name: &str, node: &str) -> Result<()> {
        sqlx::query("DELETE FROM oban_leaders WHERE name = $1 AND node = $2")
            .bind(name)
            .bind(node)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Producer heartbeats
    // ------------------------------------------------------------------

    pub async fn upsert_producer(
        &self,
        uuid: Uuid,
        node: &str,
        queue: &str,
        meta: &Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO oban_producers (uuid, node, queue, meta, started_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            ON CONFLICT (uuid) DO UPDATE
            SET meta = EXCLUDED.meta,
                updated_at = NOW()
            "#,
        )
        .bind(uuid)
        .bind(node)
        .bind(queue)
        .bind(meta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_producer(&self, uuid: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM oban_producers WHERE uuid = $1")
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Operator controls
    // ------------------------------------------------------------------

    /// Cancel a job that is not executing and not already terminal.
    /// Executing jobs are cancelled cooperatively by their producer.
    pub async fn cancel_job(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE oban_jobs
            SET state = 'cancelled',
                cancelled_at = NOW()
            WHERE id = $1 AND state IN ('scheduled', 'available', 'retryable')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Stage a waiting job immediately, skipping its remaining backoff or
    /// schedule. Terminal rows are left alone.
    pub async fn retry_job(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE oban_jobs
            SET state = 'available',
                scheduled_at = NOW()
            WHERE id = $1 AND state IN ('scheduled', 'retryable')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
