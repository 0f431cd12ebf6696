//! Table layout for the Postgres job store.

use sqlx::PgPool;

use super::postgres::map_sqlx_error;
use super::store::JobStoreError;

/// Name of the table shared by every queue.
pub const JOBS_TABLE: &str = "leaseq_jobs";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS leaseq_jobs (
        id UUID PRIMARY KEY,
        queue TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 1000,
        tag TEXT,
        tries INTEGER NOT NULL DEFAULT 0 CHECK (tries >= 0),
        enqueue_timestamp TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
        last_dequeue_timestamp TIMESTAMPTZ,
        data JSONB NOT NULL,
        CONSTRAINT leaseq_jobs_queue_tag_key UNIQUE (queue, tag)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS leaseq_jobs_eligibility_idx
        ON leaseq_jobs (queue, tries, last_dequeue_timestamp)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS leaseq_jobs_order_idx
        ON leaseq_jobs (queue, priority, enqueue_timestamp)
    "#,
];

/// Create the jobs table and its indexes if they are missing.
///
/// Idempotent; run it once at startup before serving queues.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), JobStoreError> {
    for statement in SCHEMA {
        sqlx::query(*statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
    }
    tracing::info!(table = JOBS_TABLE, "job schema ready");
    Ok(())
}
