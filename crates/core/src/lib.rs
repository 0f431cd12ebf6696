//! `leaseq-core`: queue domain building blocks.
//!
//! This crate contains **pure domain** primitives (no storage or transport
//! concerns): job rows, enqueue requests, the lease eligibility rule and the
//! lease ordering.

pub mod config;
pub mod error;
pub mod id;
pub mod job;

pub use config::QueueConfig;
pub use error::{DomainError, DomainResult};
pub use id::{JobId, QueueName};
pub use job::{
    DEFAULT_PRIORITY, EnqueueOptions, Job, LeaseOrder, LeaseState, NewJob, StoredJob, UniqueTag,
};
