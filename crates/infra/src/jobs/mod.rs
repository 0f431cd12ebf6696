//! Durable job storage with lease-based dequeue.
//!
//! ## Design
//!
//! - Jobs are queue-scoped rows; one table serves every queue
//! - Dequeue leases rows for a visibility timeout instead of deleting them
//! - A job whose lease lapses without an acknowledgement is redelivered
//! - After `max_tries` leases a job stays inert until cancelled or revived
//!
//! ## Components
//!
//! - `JobStore`: storage contract shared by every backend
//! - `InMemoryJobStore`: single-process backend for tests/dev
//! - `PostgresJobStore`: durable backend using `FOR UPDATE SKIP LOCKED`

pub mod postgres;
pub mod schema;
pub mod store;

pub use postgres::PostgresJobStore;
pub use schema::ensure_schema;
pub use store::{InMemoryJobStore, JobStore, JobStoreError, QueueStats};
