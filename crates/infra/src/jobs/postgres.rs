//! Postgres-backed job store.
//!
//! All queues share the `leaseq_jobs` table, partitioned by the `queue`
//! column. Leasing relies on `FOR UPDATE SKIP LOCKED` so that competing
//! consumers never wait on (or double-lease) each other's rows.
//!
//! ## Lease protocol
//!
//! One transaction, two statements:
//!
//! 1. `SELECT id ... FOR UPDATE SKIP LOCKED LIMIT n` materializes the candidate
//!    ids and locks them.
//! 2. `UPDATE ... WHERE id = ANY($ids) RETURNING ...` bumps `tries` and stamps
//!    the lease.
//!
//! The candidate set must be fetched before the update is planned. Folding the
//! select into the update as a subquery lets the planner re-evaluate it per
//! row, which can lease more rows than requested or skip the lock entirely.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `DuplicateTag` |
//! | Database (other) | Any other | `Storage` |
//! | PoolTimedOut / PoolClosed / Io / Tls | N/A | `Unavailable` |
//! | Other | N/A | `Storage` |

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};
use uuid::Uuid;

use leaseq_core::{JobId, NewJob, QueueConfig, QueueName, StoredJob, UniqueTag};

use super::schema;
use super::store::{JobStore, JobStoreError, QueueStats};

/// Longest lease the database is asked to compute with (100 years).
///
/// Keeps `timestamp + interval` inside Postgres' range for absurd timeouts.
const MAX_LEASE_SECS: f64 = 100.0 * 365.25 * 24.0 * 3600.0;

/// Postgres-backed job store.
///
/// ## Thread Safety
///
/// Uses the SQLx connection pool; clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the jobs table and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        schema::ensure_schema(&self.pool).await
    }
}

fn max_tries(config: &QueueConfig) -> i32 {
    i32::try_from(config.max_tries).unwrap_or(i32::MAX)
}

fn lease_secs(config: &QueueConfig) -> f64 {
    config.process_timeout.as_secs_f64().min(MAX_LEASE_SECS)
}

fn sql_limit(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn uuids(ids: &[JobId]) -> Vec<Uuid> {
    ids.iter().map(|id| *id.as_uuid()).collect()
}

fn decode_rows(operation: &str, rows: Vec<PgRow>) -> Result<Vec<StoredJob>, JobStoreError> {
    rows.iter().map(|row| decode_row(operation, row)).collect()
}

fn decode_row(operation: &str, row: &PgRow) -> Result<StoredJob, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| {
            JobStoreError::Storage(format!("failed to deserialize job row in {}: {}", operation, e))
        })?
        .try_into()
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, jobs), fields(queue = %queue, count = jobs.len(), unique_tag = ?unique_tag), err)]
    async fn insert(
        &self,
        queue: &QueueName,
        jobs: Vec<NewJob<Value>>,
        unique_tag: Option<UniqueTag>,
    ) -> Result<Vec<StoredJob>, JobStoreError> {
        if jobs.is_empty() {
            return Ok(vec![]);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut stored = Vec::with_capacity(jobs.len());
        for job in jobs {
            // Untagged rows never collide, so the policy only matters for tagged ones.
            let conflict_clause = match (&job.tag, unique_tag) {
                (Some(_), Some(UniqueTag::TakeNew)) => {
                    r#"
                    ON CONFLICT (queue, tag) DO UPDATE SET
                        id = EXCLUDED.id,
                        priority = EXCLUDED.priority,
                        data = EXCLUDED.data,
                        tries = 0,
                        enqueue_timestamp = EXCLUDED.enqueue_timestamp,
                        last_dequeue_timestamp = NULL
                    "#
                }
                // No-op update so RETURNING yields the surviving row.
                (Some(_), Some(UniqueTag::KeepOld)) => {
                    r#"
                    ON CONFLICT (queue, tag) DO UPDATE SET
                        queue = leaseq_jobs.queue
                    "#
                }
                _ => "",
            };

            let sql = format!(
                r#"
                INSERT INTO leaseq_jobs (
                    id,
                    queue,
                    priority,
                    tag,
                    tries,
                    enqueue_timestamp,
                    last_dequeue_timestamp,
                    data
                )
                VALUES ($1, $2, $3, $4, 0, clock_timestamp(), NULL, $5)
                {conflict_clause}
                RETURNING
                    id,
                    queue,
                    priority,
                    tag,
                    tries,
                    enqueue_timestamp,
                    last_dequeue_timestamp,
                    data
                "#
            );

            let row = sqlx::query(&sql)
                .bind(Uuid::from(JobId::new()))
                .bind(queue.as_str())
                .bind(job.priority)
                .bind(job.tag.as_deref())
                .bind(&job.data)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        JobStoreError::DuplicateTag(job.tag.clone().unwrap_or_default())
                    } else {
                        map_sqlx_error("insert_job", e)
                    }
                })?;

            stored.push(decode_row("insert_job", &row)?);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        tracing::debug!(count = stored.len(), "jobs inserted");
        Ok(stored)
    }

    #[instrument(skip(self, config), fields(queue = %queue, leased = tracing::field::Empty), err)]
    async fn lease(
        &self,
        queue: &QueueName,
        count: usize,
        config: &QueueConfig,
    ) -> Result<Vec<StoredJob>, JobStoreError> {
        if count == 0 {
            return Ok(vec![]);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM leaseq_jobs
            WHERE queue = $1
                AND tries < $2
                AND (
                    last_dequeue_timestamp IS NULL
                    OR last_dequeue_timestamp + make_interval(secs => $3) <= now()
                )
            ORDER BY
                priority ASC,
                enqueue_timestamp ASC,
                last_dequeue_timestamp ASC NULLS FIRST,
                tries ASC,
                id ASC
            LIMIT $4
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(queue.as_str())
        .bind(max_tries(config))
        .bind(lease_secs(config))
        .bind(sql_limit(count))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("select_candidates", e))?;

        if ids.is_empty() {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            Span::current().record("leased", 0);
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            UPDATE leaseq_jobs
            SET
                tries = tries + 1,
                last_dequeue_timestamp = now()
            WHERE queue = $1 AND id = ANY($2)
            RETURNING
                id,
                queue,
                priority,
                tag,
                tries,
                enqueue_timestamp,
                last_dequeue_timestamp,
                data
            "#,
        )
        .bind(queue.as_str())
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lease_jobs", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        // RETURNING order is unspecified; restore selection order.
        let position: HashMap<Uuid, usize> =
            ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let mut leased = decode_rows("lease_jobs", rows)?;
        leased.sort_by_key(|job| position.get(job.id.as_uuid()).copied().unwrap_or(usize::MAX));

        Span::current().record("leased", leased.len());
        Ok(leased)
    }

    #[instrument(skip(self), fields(queue = %queue, job_id = %id), err)]
    async fn renew(
        &self,
        queue: &QueueName,
        id: JobId,
        tries: u32,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE leaseq_jobs
            SET last_dequeue_timestamp = now()
            WHERE queue = $1 AND id = $2 AND tries = $3
            "#,
        )
        .bind(queue.as_str())
        .bind(id.as_uuid())
        .bind(i32::try_from(tries).unwrap_or(i32::MAX))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew_lease", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, ids), fields(queue = %queue, count = ids.len()), err)]
    async fn delete(&self, queue: &QueueName, ids: &[JobId]) -> Result<u64, JobStoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query("DELETE FROM leaseq_jobs WHERE queue = $1 AND id = ANY($2)")
            .bind(queue.as_str())
            .bind(uuids(ids))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_jobs", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, tags), fields(queue = %queue, count = tags.len()), err)]
    async fn delete_by_tags(
        &self,
        queue: &QueueName,
        tags: &[String],
    ) -> Result<u64, JobStoreError> {
        if tags.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query("DELETE FROM leaseq_jobs WHERE queue = $1 AND tag = ANY($2)")
            .bind(queue.as_str())
            .bind(tags)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_jobs_by_tag", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, ids), fields(queue = %queue, count = ids.len()), err)]
    async fn find(&self, queue: &QueueName, ids: &[JobId]) -> Result<Vec<StoredJob>, JobStoreError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            SELECT
                id,
                queue,
                priority,
                tag,
                tries,
                enqueue_timestamp,
                last_dequeue_timestamp,
                data
            FROM leaseq_jobs
            WHERE queue = $1 AND id = ANY($2)
            ORDER BY enqueue_timestamp ASC, id ASC
            "#,
        )
        .bind(queue.as_str())
        .bind(uuids(ids))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_jobs", e))?;

        decode_rows("find_jobs", rows)
    }

    #[instrument(skip(self, tags), fields(queue = %queue, count = tags.len()), err)]
    async fn find_by_tags(
        &self,
        queue: &QueueName,
        tags: &[String],
    ) -> Result<Vec<StoredJob>, JobStoreError> {
        if tags.is_empty() {
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            SELECT
                id,
                queue,
                priority,
                tag,
                tries,
                enqueue_timestamp,
                last_dequeue_timestamp,
                data
            FROM leaseq_jobs
            WHERE queue = $1 AND tag = ANY($2)
            ORDER BY enqueue_timestamp ASC, id ASC
            "#,
        )
        .bind(queue.as_str())
        .bind(tags)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_jobs_by_tag", e))?;

        decode_rows("find_jobs_by_tag", rows)
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn count_by_tag(&self, queue: &QueueName, tag: &str) -> Result<u64, JobStoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM leaseq_jobs WHERE queue = $1 AND tag = $2")
                .bind(queue.as_str())
                .bind(tag)
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("count_by_tag", e))?;

        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self, config), fields(queue = %queue), err)]
    async fn exhausted(
        &self,
        queue: &QueueName,
        config: &QueueConfig,
        limit: usize,
    ) -> Result<Vec<StoredJob>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                id,
                queue,
                priority,
                tag,
                tries,
                enqueue_timestamp,
                last_dequeue_timestamp,
                data
            FROM leaseq_jobs
            WHERE queue = $1
                AND tries >= $2
                AND (
                    last_dequeue_timestamp IS NULL
                    OR last_dequeue_timestamp + make_interval(secs => $3) <= now()
                )
            ORDER BY enqueue_timestamp ASC, id ASC
            LIMIT $4
            "#,
        )
        .bind(queue.as_str())
        .bind(max_tries(config))
        .bind(lease_secs(config))
        .bind(sql_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_exhausted", e))?;

        decode_rows("list_exhausted", rows)
    }

    #[instrument(skip(self, config), fields(queue = %queue, job_id = %id), err)]
    async fn revive(
        &self,
        queue: &QueueName,
        id: JobId,
        config: &QueueConfig,
    ) -> Result<Option<StoredJob>, JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE leaseq_jobs
            SET
                tries = 0,
                last_dequeue_timestamp = NULL
            WHERE queue = $1
                AND id = $2
                AND (
                    last_dequeue_timestamp IS NULL
                    OR last_dequeue_timestamp + make_interval(secs => $3) <= now()
                )
            RETURNING
                id,
                queue,
                priority,
                tag,
                tries,
                enqueue_timestamp,
                last_dequeue_timestamp,
                data
            "#,
        )
        .bind(queue.as_str())
        .bind(id.as_uuid())
        .bind(lease_secs(config))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("revive_job", e))?;

        row.as_ref().map(|row| decode_row("revive_job", row)).transpose()
    }

    #[instrument(skip(self, ids, config), fields(queue = %queue, count = ids.len()), err)]
    async fn bury(
        &self,
        queue: &QueueName,
        ids: &[JobId],
        config: &QueueConfig,
    ) -> Result<u64, JobStoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE leaseq_jobs
            SET
                tries = GREATEST(tries, $3),
                last_dequeue_timestamp = NULL
            WHERE queue = $1 AND id = ANY($2)
            "#,
        )
        .bind(queue.as_str())
        .bind(uuids(ids))
        .bind(max_tries(config))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("bury_jobs", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, config), fields(queue = %queue), err)]
    async fn stats(
        &self,
        queue: &QueueName,
        config: &QueueConfig,
    ) -> Result<QueueStats, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (
                    WHERE last_dequeue_timestamp IS NOT NULL
                        AND last_dequeue_timestamp + make_interval(secs => $3) > now()
                ) AS leased,
                COUNT(*) FILTER (
                    WHERE tries < $2
                        AND (
                            last_dequeue_timestamp IS NULL
                            OR last_dequeue_timestamp + make_interval(secs => $3) <= now()
                        )
                ) AS ready,
                COUNT(*) FILTER (
                    WHERE tries >= $2
                        AND (
                            last_dequeue_timestamp IS NULL
                            OR last_dequeue_timestamp + make_interval(secs => $3) <= now()
                        )
                ) AS exhausted
            FROM leaseq_jobs
            WHERE queue = $1
            "#,
        )
        .bind(queue.as_str())
        .bind(max_tries(config))
        .bind(lease_secs(config))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("queue_stats", e))?;

        let count = |column: &str| -> Result<u64, JobStoreError> {
            let value: i64 = row.try_get(column).map_err(|e| {
                JobStoreError::Storage(format!("failed to read {}: {}", column, e))
            })?;
            Ok(value.max(0) as u64)
        };

        Ok(QueueStats {
            ready: count("ready")?,
            leased: count("leased")?,
            exhausted: count("exhausted")?,
        })
    }
}

/// Map SQLx errors to JobStoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => JobStoreError::DuplicateTag(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::Io(e) => JobStoreError::Unavailable(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => {
            JobStoreError::Unavailable(format!("tls error in {}: {}", operation, e))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    queue: String,
    priority: i32,
    tag: Option<String>,
    tries: i32,
    enqueue_timestamp: DateTime<Utc>,
    last_dequeue_timestamp: Option<DateTime<Utc>>,
    data: Value,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            queue: row.try_get("queue")?,
            priority: row.try_get("priority")?,
            tag: row.try_get("tag")?,
            tries: row.try_get("tries")?,
            enqueue_timestamp: row.try_get("enqueue_timestamp")?,
            last_dequeue_timestamp: row.try_get("last_dequeue_timestamp")?,
            data: row.try_get("data")?,
        })
    }
}

impl TryFrom<JobRow> for StoredJob {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let queue = QueueName::new(row.queue)
            .map_err(|e| JobStoreError::Storage(format!("invalid queue column: {}", e)))?;
        Ok(StoredJob {
            id: JobId::from_uuid(row.id),
            queue,
            priority: row.priority,
            tag: row.tag,
            tries: u32::try_from(row.tries).unwrap_or_default(),
            enqueue_timestamp: row.enqueue_timestamp,
            last_dequeue_timestamp: row.last_dequeue_timestamp,
            data: row.data,
        })
    }
}
