//! Job rows, enqueue requests and the lease rules applied to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QueueConfig;
use crate::id::{JobId, QueueName};

/// Priority assigned when the producer does not pick one. Lower runs first.
pub const DEFAULT_PRIORITY: i32 = 1000;

/// A unit of work as stored in (and returned by) the queue.
///
/// `T` is the payload type; stores work with [`StoredJob`] (raw JSON) and the
/// typed queue facade decodes into the caller's type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job<T> {
    pub id: JobId,
    pub queue: QueueName,
    pub priority: i32,
    pub tag: Option<String>,
    /// Number of leases handed out so far.
    pub tries: u32,
    pub enqueue_timestamp: DateTime<Utc>,
    /// `None` until the first lease.
    pub last_dequeue_timestamp: Option<DateTime<Utc>>,
    pub data: T,
}

/// A job with its payload still in serialized form.
pub type StoredJob = Job<serde_json::Value>;

/// Where a job currently stands with respect to leasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    /// Eligible for the next dequeue.
    Ready,
    /// Held by a consumer whose lease has not expired yet.
    Leased,
    /// Ran out of tries; stays in the table until cancelled or revived.
    Exhausted,
}

/// Sort key for lease selection: priority, then age, then time since the last
/// lease (never-leased first), then fewer tries.
pub type LeaseOrder = (i32, DateTime<Utc>, Option<DateTime<Utc>>, u32);

impl<T> Job<T> {
    /// Instant at which the current lease runs out, if the job was ever leased.
    ///
    /// `None` for a leased job means the lease never expires (timeout overflowed
    /// the calendar).
    pub fn lease_expires_at(&self, config: &QueueConfig) -> Option<DateTime<Utc>> {
        self.last_dequeue_timestamp
            .and_then(|at| at.checked_add_signed(config.lease_duration()))
    }

    fn lease_expired(&self, config: &QueueConfig, now: DateTime<Utc>) -> bool {
        match self.last_dequeue_timestamp {
            None => true,
            Some(_) => self
                .lease_expires_at(config)
                .is_some_and(|expires| expires <= now),
        }
    }

    /// `tries < max_tries` and no unexpired lease.
    pub fn is_eligible(&self, config: &QueueConfig, now: DateTime<Utc>) -> bool {
        self.tries < config.max_tries && self.lease_expired(config, now)
    }

    pub fn is_exhausted(&self, config: &QueueConfig) -> bool {
        self.tries >= config.max_tries
    }

    /// A job inside an unexpired lease counts as leased even on its final try;
    /// it only becomes exhausted once that lease lapses without an ack.
    pub fn lease_state(&self, config: &QueueConfig, now: DateTime<Utc>) -> LeaseState {
        if !self.lease_expired(config, now) {
            LeaseState::Leased
        } else if self.is_exhausted(config) {
            LeaseState::Exhausted
        } else {
            LeaseState::Ready
        }
    }

    pub fn lease_order(&self) -> LeaseOrder {
        (
            self.priority,
            self.enqueue_timestamp,
            self.last_dequeue_timestamp,
            self.tries,
        )
    }

    pub fn map_data<U>(self, f: impl FnOnce(T) -> U) -> Job<U> {
        Job {
            id: self.id,
            queue: self.queue,
            priority: self.priority,
            tag: self.tag,
            tries: self.tries,
            enqueue_timestamp: self.enqueue_timestamp,
            last_dequeue_timestamp: self.last_dequeue_timestamp,
            data: f(self.data),
        }
    }

    pub fn try_map_data<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<Job<U>, E> {
        let data = f(self.data)?;
        Ok(Job {
            id: self.id,
            queue: self.queue,
            priority: self.priority,
            tag: self.tag,
            tries: self.tries,
            enqueue_timestamp: self.enqueue_timestamp,
            last_dequeue_timestamp: self.last_dequeue_timestamp,
            data,
        })
    }
}

/// Conflict policy when an enqueue hits an existing `(queue, tag)` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniqueTag {
    /// Replace the existing row: new id, new payload and priority, tries reset,
    /// lease cleared. Supersedes even a job that is currently leased.
    TakeNew,
    /// Keep the existing row untouched and hand it back to the caller.
    KeepOld,
}

/// A job to be inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob<T> {
    pub data: T,
    pub tag: Option<String>,
    pub priority: i32,
}

impl<T> NewJob<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            tag: None,
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn try_map_data<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<NewJob<U>, E> {
        Ok(NewJob {
            data: f(self.data)?,
            tag: self.tag,
            priority: self.priority,
        })
    }
}

/// Options for a single enqueue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub tag: Option<String>,
    pub priority: Option<i32>,
    pub unique_tag: Option<UniqueTag>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn unique_tag(mut self, policy: UniqueTag) -> Self {
        self.unique_tag = Some(policy);
        self
    }

    pub fn into_new_job<T>(self, data: T) -> (NewJob<T>, Option<UniqueTag>) {
        let job = NewJob {
            data,
            tag: self.tag,
            priority: self.priority.unwrap_or(DEFAULT_PRIORITY),
        };
        (job, self.unique_tag)
    }
}
