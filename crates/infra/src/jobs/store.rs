//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use leaseq_core::{JobId, LeaseState, NewJob, QueueConfig, QueueName, StoredJob, UniqueTag};

/// Job store abstraction.
///
/// Every operation is scoped to one queue and is atomic: it either applies
/// completely or not at all. Payloads are opaque JSON here; encoding is the
/// queue facade's job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert `jobs` in input order, returning one stored job per input.
    ///
    /// - `None`: plain insert; a `(queue, tag)` collision fails the whole batch
    ///   with [`JobStoreError::DuplicateTag`].
    /// - `TakeNew`: replace a colliding row (new id, new data and priority,
    ///   `tries = 0`, lease cleared).
    /// - `KeepOld`: leave a colliding row untouched and return it.
    async fn insert(
        &self,
        queue: &QueueName,
        jobs: Vec<NewJob<Value>>,
        unique_tag: Option<UniqueTag>,
    ) -> Result<Vec<StoredJob>, JobStoreError>;

    /// Lease up to `count` eligible jobs: `tries += 1`, last dequeue set to now.
    ///
    /// Returned in lease order. Jobs locked by a concurrent lease are skipped,
    /// so fewer than `count` may come back even when more are eligible.
    async fn lease(
        &self,
        queue: &QueueName,
        count: usize,
        config: &QueueConfig,
    ) -> Result<Vec<StoredJob>, JobStoreError>;

    /// Restart the lease of `id` if the row still carries `tries`.
    async fn renew(&self, queue: &QueueName, id: JobId, tries: u32)
    -> Result<bool, JobStoreError>;

    /// Delete by id regardless of lease state. Returns the number of rows removed.
    async fn delete(&self, queue: &QueueName, ids: &[JobId]) -> Result<u64, JobStoreError>;

    async fn delete_by_tags(&self, queue: &QueueName, tags: &[String])
    -> Result<u64, JobStoreError>;

    /// Jobs with the given ids, oldest first. Unknown ids are skipped.
    async fn find(&self, queue: &QueueName, ids: &[JobId]) -> Result<Vec<StoredJob>, JobStoreError>;

    async fn find_by_tags(
        &self,
        queue: &QueueName,
        tags: &[String],
    ) -> Result<Vec<StoredJob>, JobStoreError>;

    async fn count_by_tag(&self, queue: &QueueName, tag: &str) -> Result<u64, JobStoreError>;

    /// Jobs that used up their tries and whose last lease has lapsed, oldest first.
    async fn exhausted(
        &self,
        queue: &QueueName,
        config: &QueueConfig,
        limit: usize,
    ) -> Result<Vec<StoredJob>, JobStoreError>;

    /// Reset `tries` and clear the lease so the job becomes eligible again.
    ///
    /// Jobs inside an unexpired lease are left alone (`None`).
    async fn revive(
        &self,
        queue: &QueueName,
        id: JobId,
        config: &QueueConfig,
    ) -> Result<Option<StoredJob>, JobStoreError>;

    /// Move jobs straight to the exhausted set: `tries` is raised to
    /// `max_tries` and the lease is cleared. Returns the number of rows touched.
    async fn bury(
        &self,
        queue: &QueueName,
        ids: &[JobId],
        config: &QueueConfig,
    ) -> Result<u64, JobStoreError>;

    async fn stats(&self, queue: &QueueName, config: &QueueConfig)
    -> Result<QueueStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    /// Plain insert hit an existing `(queue, tag)` row.
    #[error("tag already in use: {0}")]
    DuplicateTag(String),
    /// The store could not be reached (pool closed or timed out, IO failure).
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Per-queue job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub ready: u64,
    pub leased: u64,
    pub exhausted: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.ready + self.leased + self.exhausted
    }
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn insert(
        &self,
        queue: &QueueName,
        jobs: Vec<NewJob<Value>>,
        unique_tag: Option<UniqueTag>,
    ) -> Result<Vec<StoredJob>, JobStoreError> {
        (**self).insert(queue, jobs, unique_tag).await
    }

    async fn lease(
        &self,
        queue: &QueueName,
        count: usize,
        config: &QueueConfig,
    ) -> Result<Vec<StoredJob>, JobStoreError> {
        (**self).lease(queue, count, config).await
    }

    async fn renew(
        &self,
        queue: &QueueName,
        id: JobId,
        tries: u32,
    ) -> Result<bool, JobStoreError> {
        (**self).renew(queue, id, tries).await
    }

    async fn delete(&self, queue: &QueueName, ids: &[JobId]) -> Result<u64, JobStoreError> {
        (**self).delete(queue, ids).await
    }

    async fn delete_by_tags(
        &self,
        queue: &QueueName,
        tags: &[String],
    ) -> Result<u64, JobStoreError> {
        (**self).delete_by_tags(queue, tags).await
    }

    async fn find(&self, queue: &QueueName, ids: &[JobId]) -> Result<Vec<StoredJob>, JobStoreError> {
        (**self).find(queue, ids).await
    }

    async fn find_by_tags(
        &self,
        queue: &QueueName,
        tags: &[String],
    ) -> Result<Vec<StoredJob>, JobStoreError> {
        (**self).find_by_tags(queue, tags).await
    }

    async fn count_by_tag(&self, queue: &QueueName, tag: &str) -> Result<u64, JobStoreError> {
        (**self).count_by_tag(queue, tag).await
    }

    async fn exhausted(
        &self,
        queue: &QueueName,
        config: &QueueConfig,
        limit: usize,
    ) -> Result<Vec<StoredJob>, JobStoreError> {
        (**self).exhausted(queue, config, limit).await
    }

    async fn revive(
        &self,
        queue: &QueueName,
        id: JobId,
        config: &QueueConfig,
    ) -> Result<Option<StoredJob>, JobStoreError> {
        (**self).revive(queue, id, config).await
    }

    async fn bury(
        &self,
        queue: &QueueName,
        ids: &[JobId],
        config: &QueueConfig,
    ) -> Result<u64, JobStoreError> {
        (**self).bury(queue, ids, config).await
    }

    async fn stats(
        &self,
        queue: &QueueName,
        config: &QueueConfig,
    ) -> Result<QueueStats, JobStoreError> {
        (**self).stats(queue, config).await
    }
}

#[derive(Debug)]
struct Row {
    job: StoredJob,
    /// Insertion sequence; breaks ties between equal lease-order keys.
    seq: u64,
}

#[derive(Debug, Default)]
struct State {
    rows: HashMap<JobId, Row>,
    tags: HashMap<(QueueName, String), JobId>,
    next_seq: u64,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn tagged(&self, queue: &QueueName, tag: &str) -> Option<JobId> {
        self.tags.get(&(queue.clone(), tag.to_owned())).copied()
    }

    fn remove(&mut self, id: JobId) -> bool {
        match self.rows.remove(&id) {
            Some(row) => {
                if let Some(tag) = row.job.tag {
                    self.tags.remove(&(row.job.queue, tag));
                }
                true
            }
            None => false,
        }
    }

    fn in_queue<'a>(&'a self, queue: &'a QueueName) -> impl Iterator<Item = &'a Row> + 'a {
        self.rows.values().filter(move |row| &row.job.queue == queue)
    }

    fn insert_row(
        &mut self,
        queue: &QueueName,
        new_job: NewJob<Value>,
        now: DateTime<Utc>,
    ) -> StoredJob {
        let job = StoredJob {
            id: JobId::new(),
            queue: queue.clone(),
            priority: new_job.priority,
            tag: new_job.tag,
            tries: 0,
            enqueue_timestamp: now,
            last_dequeue_timestamp: None,
            data: new_job.data,
        };
        if let Some(tag) = &job.tag {
            self.tags.insert((queue.clone(), tag.clone()), job.id);
        }
        let seq = self.next_seq();
        self.rows.insert(
            job.id,
            Row {
                job: job.clone(),
                seq,
            },
        );
        job
    }
}

/// In-memory job store for tests/dev.
///
/// A single lock serializes every operation, which gives the same exclusion
/// the Postgres row locks give across processes.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: RwLock<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, JobStoreError> {
        self.state
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, JobStoreError> {
        self.state
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }
}

fn oldest_first(mut rows: Vec<&Row>) -> Vec<StoredJob> {
    rows.sort_by_key(|row| (row.job.enqueue_timestamp, row.seq));
    rows.into_iter().map(|row| row.job.clone()).collect()
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(
        &self,
        queue: &QueueName,
        jobs: Vec<NewJob<Value>>,
        unique_tag: Option<UniqueTag>,
    ) -> Result<Vec<StoredJob>, JobStoreError> {
        let mut state = self.write()?;

        // Plain inserts are the only way a batch can fail; check the whole
        // batch up front so nothing is applied on failure.
        if unique_tag.is_none() {
            let mut seen = std::collections::HashSet::new();
            for tag in jobs.iter().filter_map(|j| j.tag.as_deref()) {
                if state.tagged(queue, tag).is_some() || !seen.insert(tag) {
                    return Err(JobStoreError::DuplicateTag(tag.to_string()));
                }
            }
        }

        let now = Utc::now();
        let mut stored = Vec::with_capacity(jobs.len());
        for new_job in jobs {
            let existing = new_job
                .tag
                .as_deref()
                .and_then(|tag| state.tagged(queue, tag));

            let job = match (existing, unique_tag) {
                (Some(id), Some(UniqueTag::KeepOld)) => {
                    let kept = state.rows.get(&id).map(|row| row.job.clone());
                    match kept {
                        Some(job) => job,
                        None => state.insert_row(queue, new_job, now),
                    }
                }
                (Some(id), Some(UniqueTag::TakeNew)) => {
                    state.remove(id);
                    state.insert_row(queue, new_job, now)
                }
                _ => state.insert_row(queue, new_job, now),
            };
            stored.push(job);
        }

        tracing::debug!(queue = %queue, count = stored.len(), "jobs inserted");
        Ok(stored)
    }

    async fn lease(
        &self,
        queue: &QueueName,
        count: usize,
        config: &QueueConfig,
    ) -> Result<Vec<StoredJob>, JobStoreError> {
        if count == 0 {
            return Ok(vec![]);
        }

        let mut state = self.write()?;
        let now = Utc::now();

        let mut candidates: Vec<_> = state
            .in_queue(queue)
            .filter(|row| row.job.is_eligible(config, now))
            .map(|row| (row.job.lease_order(), row.seq, row.job.id))
            .collect();
        candidates.sort();
        candidates.truncate(count);

        let mut leased = Vec::with_capacity(candidates.len());
        for (_, _, id) in candidates {
            if let Some(row) = state.rows.get_mut(&id) {
                row.job.tries += 1;
                row.job.last_dequeue_timestamp = Some(now);
                leased.push(row.job.clone());
            }
        }

        tracing::debug!(queue = %queue, leased = leased.len(), "jobs leased");
        Ok(leased)
    }

    async fn renew(
        &self,
        queue: &QueueName,
        id: JobId,
        tries: u32,
    ) -> Result<bool, JobStoreError> {
        let mut state = self.write()?;
        match state.rows.get_mut(&id) {
            Some(row) if &row.job.queue == queue && row.job.tries == tries => {
                row.job.last_dequeue_timestamp = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, queue: &QueueName, ids: &[JobId]) -> Result<u64, JobStoreError> {
        let mut state = self.write()?;
        let mut removed = 0;
        for id in ids {
            let in_queue = state.rows.get(id).is_some_and(|row| &row.job.queue == queue);
            if in_queue && state.remove(*id) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_by_tags(
        &self,
        queue: &QueueName,
        tags: &[String],
    ) -> Result<u64, JobStoreError> {
        let mut state = self.write()?;
        let mut removed = 0;
        for tag in tags {
            if let Some(id) = state.tagged(queue, tag) {
                if state.remove(id) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn find(&self, queue: &QueueName, ids: &[JobId]) -> Result<Vec<StoredJob>, JobStoreError> {
        let state = self.read()?;
        let rows = ids
            .iter()
            .filter_map(|id| state.rows.get(id))
            .filter(|row| &row.job.queue == queue)
            .collect();
        Ok(oldest_first(rows))
    }

    async fn find_by_tags(
        &self,
        queue: &QueueName,
        tags: &[String],
    ) -> Result<Vec<StoredJob>, JobStoreError> {
        let state = self.read()?;
        let rows = tags
            .iter()
            .filter_map(|tag| state.tagged(queue, tag))
            .filter_map(|id| state.rows.get(&id))
            .collect();
        Ok(oldest_first(rows))
    }

    async fn count_by_tag(&self, queue: &QueueName, tag: &str) -> Result<u64, JobStoreError> {
        let state = self.read()?;
        Ok(u64::from(state.tagged(queue, tag).is_some()))
    }

    async fn exhausted(
        &self,
        queue: &QueueName,
        config: &QueueConfig,
        limit: usize,
    ) -> Result<Vec<StoredJob>, JobStoreError> {
        let state = self.read()?;
        let now = Utc::now();
        let rows = state
            .in_queue(queue)
            .filter(|row| row.job.lease_state(config, now) == LeaseState::Exhausted)
            .collect();
        let mut jobs = oldest_first(rows);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn revive(
        &self,
        queue: &QueueName,
        id: JobId,
        config: &QueueConfig,
    ) -> Result<Option<StoredJob>, JobStoreError> {
        let mut state = self.write()?;
        let now = Utc::now();
        match state.rows.get_mut(&id) {
            Some(row)
                if &row.job.queue == queue
                    && row.job.lease_state(config, now) != LeaseState::Leased =>
            {
                row.job.tries = 0;
                row.job.last_dequeue_timestamp = None;
                Ok(Some(row.job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn bury(
        &self,
        queue: &QueueName,
        ids: &[JobId],
        config: &QueueConfig,
    ) -> Result<u64, JobStoreError> {
        let mut state = self.write()?;
        let mut buried = 0;
        for id in ids {
            if let Some(row) = state.rows.get_mut(id) {
                if &row.job.queue == queue {
                    row.job.tries = row.job.tries.max(config.max_tries);
                    row.job.last_dequeue_timestamp = None;
                    buried += 1;
                }
            }
        }
        Ok(buried)
    }

    async fn stats(
        &self,
        queue: &QueueName,
        config: &QueueConfig,
    ) -> Result<QueueStats, JobStoreError> {
        let state = self.read()?;
        let now = Utc::now();
        let mut stats = QueueStats::default();
        for row in state.in_queue(queue) {
            match row.job.lease_state(config, now) {
                LeaseState::Ready => stats.ready += 1,
                LeaseState::Leased => stats.leased += 1,
                LeaseState::Exhausted => stats.exhausted += 1,
            }
        }
        Ok(stats)
    }
}
