//! Typed queue facade over a [`JobStore`].

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use leaseq_core::{
    DomainError, EnqueueOptions, Job, JobId, NewJob, QueueConfig, QueueName, StoredJob, UniqueTag,
};
use leaseq_events::WakeBus;

use crate::jobs::{JobStore, JobStoreError, QueueStats};

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("failed to encode job payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode payload of job {id}: {source}")]
    Decode {
        id: JobId,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid queue configuration: {0}")]
    InvalidConfig(#[from] DomainError),
}

/// One logical queue carrying payloads of type `T`.
///
/// Cheap to clone; clones share the store and wake bus.
pub struct Queue<T> {
    pub(crate) name: QueueName,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) wake: Option<Arc<dyn WakeBus>>,
    pub(crate) config: QueueConfig,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            store: Arc::clone(&self.store),
            wake: self.wake.clone(),
            config: self.config,
            _payload: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("wake", &self.wake.is_some())
            .finish()
    }
}

impl<T> Queue<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(
        name: QueueName,
        store: Arc<dyn JobStore>,
        config: QueueConfig,
    ) -> QueueResult<Self> {
        config.validate()?;
        Ok(Self {
            name,
            store,
            wake: None,
            config,
            _payload: PhantomData,
        })
    }

    /// Announce enqueues on `bus` and let consumers wait on it.
    pub fn with_wake_bus(mut self, bus: Arc<dyn WakeBus>) -> Self {
        self.wake = Some(bus);
        self
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn enqueue(&self, data: T, options: EnqueueOptions) -> QueueResult<Job<T>> {
        let (new_job, unique_tag) = options.into_new_job(data);
        let mut jobs = self.enqueue_many(vec![new_job], unique_tag).await?;
        jobs.pop().ok_or_else(|| {
            QueueError::Store(JobStoreError::Storage("insert returned no row".to_string()))
        })
    }

    /// Insert `items` atomically, in order, returning one job per item.
    pub async fn enqueue_many(
        &self,
        items: Vec<NewJob<T>>,
        unique_tag: Option<UniqueTag>,
    ) -> QueueResult<Vec<Job<T>>> {
        if items.is_empty() {
            return Ok(vec![]);
        }

        let encoded = items
            .into_iter()
            .map(|item| item.try_map_data(serde_json::to_value))
            .collect::<Result<Vec<NewJob<Value>>, _>>()
            .map_err(QueueError::Encode)?;

        let stored = self.store.insert(&self.name, encoded, unique_tag).await?;
        tracing::debug!(queue = %self.name, count = stored.len(), "enqueued");

        self.announce();
        decode_all(stored)
    }

    pub async fn dequeue(&self) -> QueueResult<Option<Job<T>>> {
        Ok(self.dequeue_many(1).await?.pop())
    }

    /// Lease up to `count` jobs, in priority then FIFO order.
    ///
    /// Jobs whose payload does not decode as `T` are not returned. They are
    /// moved to the exhausted set, where [`Queue::exhausted`] on a
    /// `Queue<serde_json::Value>` can still show them.
    pub async fn dequeue_many(&self, count: usize) -> QueueResult<Vec<Job<T>>> {
        if count == 0 {
            return Ok(vec![]);
        }
        let leased = self.store.lease(&self.name, count, &self.config).await?;
        let (jobs, undecodable) = decode_each(leased);
        if !undecodable.is_empty() {
            self.bury(&undecodable).await;
        }
        Ok(jobs)
    }

    /// Delete a processed job. Already gone is fine.
    pub async fn acknowledge(&self, job: &Job<T>) -> QueueResult<()> {
        self.store.delete(&self.name, &[job.id]).await?;
        Ok(())
    }

    pub async fn acknowledge_many(&self, jobs: &[Job<T>]) -> QueueResult<()> {
        let ids: Vec<JobId> = jobs.iter().map(|job| job.id).collect();
        self.store.delete(&self.name, &ids).await?;
        Ok(())
    }

    /// Restart the lease on `job` for another full process timeout.
    ///
    /// Returns `false` when the caller no longer holds the job: it was
    /// acknowledged, cancelled, superseded by a `TakeNew` enqueue, or leased
    /// again after this lease expired.
    pub async fn renew_lease(&self, job: &Job<T>) -> QueueResult<bool> {
        Ok(self.store.renew(&self.name, job.id, job.tries).await?)
    }

    /// Delete a job whatever its lease state. Returns whether a row was removed.
    pub async fn cancel(&self, id: JobId) -> QueueResult<bool> {
        Ok(self.store.delete(&self.name, &[id]).await? > 0)
    }

    pub async fn cancel_many(&self, ids: &[JobId]) -> QueueResult<u64> {
        Ok(self.store.delete(&self.name, ids).await?)
    }

    pub async fn cancel_by_tag(&self, tag: &str) -> QueueResult<bool> {
        Ok(self.store.delete_by_tags(&self.name, &[tag.to_string()]).await? > 0)
    }

    pub async fn cancel_by_tags(&self, tags: &[String]) -> QueueResult<u64> {
        Ok(self.store.delete_by_tags(&self.name, tags).await?)
    }

    pub async fn has(&self, id: JobId) -> QueueResult<bool> {
        Ok(!self.store.find(&self.name, &[id]).await?.is_empty())
    }

    pub async fn get(&self, id: JobId) -> QueueResult<Option<Job<T>>> {
        let found = self.store.find(&self.name, &[id]).await?;
        Ok(decode_all(found)?.pop())
    }

    pub async fn get_by_tag(&self, tag: &str) -> QueueResult<Option<Job<T>>> {
        let found = self.store.find_by_tags(&self.name, &[tag.to_string()]).await?;
        Ok(decode_all(found)?.pop())
    }

    /// Jobs carrying any of `tags`. Rows that do not decode as `T` are skipped.
    pub async fn get_by_tags(&self, tags: &[String]) -> QueueResult<Vec<Job<T>>> {
        let found = self.store.find_by_tags(&self.name, tags).await?;
        Ok(self.skip_undecodable(found))
    }

    pub async fn count_by_tag(&self, tag: &str) -> QueueResult<u64> {
        Ok(self.store.count_by_tag(&self.name, tag).await?)
    }

    /// Jobs that ran out of tries, oldest first. Rows that do not decode as
    /// `T` are skipped.
    pub async fn exhausted(&self, limit: usize) -> QueueResult<Vec<Job<T>>> {
        let found = self.store.exhausted(&self.name, &self.config, limit).await?;
        Ok(self.skip_undecodable(found))
    }

    /// Give an exhausted job a fresh set of tries.
    pub async fn revive(&self, id: JobId) -> QueueResult<Option<Job<T>>> {
        let revived = self.store.revive(&self.name, id, &self.config).await?;
        let Some(job) = revived else {
            return Ok(None);
        };
        self.announce();
        decode(job).map(Some)
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        Ok(self.store.stats(&self.name, &self.config).await?)
    }

    /// Fire-and-forget wake after a commit, published from its own task.
    fn announce(&self) {
        let Some(bus) = self.wake.clone() else {
            return;
        };
        let name = self.name.clone();
        tokio::spawn(async move {
            if let Err(e) = bus.publish(name.as_str()).await {
                tracing::warn!(queue = %name, error = %e, "failed to publish wake");
            }
        });
    }

    /// Dead-letter leased rows whose payload cannot be read. If this fails
    /// they stay leased and run out their tries on later leases.
    async fn bury(&self, undecodable: &[(JobId, serde_json::Error)]) {
        for (id, error) in undecodable {
            tracing::warn!(queue = %self.name, job_id = %id, %error, "undecodable payload; moving job to exhausted");
        }
        let ids: Vec<JobId> = undecodable.iter().map(|(id, _)| *id).collect();
        if let Err(e) = self.store.bury(&self.name, &ids, &self.config).await {
            tracing::warn!(queue = %self.name, error = %e, "failed to bury undecodable jobs");
        }
    }

    fn skip_undecodable(&self, found: Vec<StoredJob>) -> Vec<Job<T>> {
        let (jobs, undecodable) = decode_each(found);
        for (id, error) in undecodable {
            tracing::warn!(queue = %self.name, job_id = %id, %error, "skipping undecodable payload");
        }
        jobs
    }
}

fn decode<T: DeserializeOwned>(job: StoredJob) -> QueueResult<Job<T>> {
    let id = job.id;
    job.try_map_data(serde_json::from_value)
        .map_err(|source| QueueError::Decode { id, source })
}

fn decode_all<T: DeserializeOwned>(jobs: Vec<StoredJob>) -> QueueResult<Vec<Job<T>>> {
    jobs.into_iter().map(decode).collect()
}

/// Decode every job on its own, keeping order among the ones that succeed.
fn decode_each<T: DeserializeOwned>(
    jobs: Vec<StoredJob>,
) -> (Vec<Job<T>>, Vec<(JobId, serde_json::Error)>) {
    let mut decoded = Vec::with_capacity(jobs.len());
    let mut undecodable = Vec::new();
    for job in jobs {
        let id = job.id;
        match job.try_map_data(serde_json::from_value) {
            Ok(job) => decoded.push(job),
            Err(error) => undecodable.push((id, error)),
        }
    }
    (decoded, undecodable)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde::Deserialize;

    use leaseq_events::{InMemoryWakeBus, WakeError, WakeSubscription};

    use super::*;
    use crate::jobs::InMemoryJobStore;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Email {
        to: String,
    }

    fn email(to: &str) -> Email {
        Email { to: to.to_string() }
    }

    fn queue_with(config: QueueConfig) -> Queue<Email> {
        Queue::new(
            QueueName::new("mails").unwrap(),
            InMemoryJobStore::arc(),
            config,
        )
        .unwrap()
    }

    fn queue() -> Queue<Email> {
        queue_with(QueueConfig::default())
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let err = Queue::<Email>::new(
            QueueName::new("q").unwrap(),
            InMemoryJobStore::arc(),
            QueueConfig::default().with_max_tries(0),
        )
        .unwrap_err();
        assert!(matches!(err, QueueError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn enqueue_dequeue_acknowledge() {
        let q = queue();
        let job = q.enqueue(email("a@x"), EnqueueOptions::new()).await.unwrap();
        assert_eq!(job.priority, leaseq_core::DEFAULT_PRIORITY);
        assert_eq!(job.tries, 0);

        let leased = q.dequeue().await.unwrap().unwrap();
        assert_eq!(leased.id, job.id);
        assert_eq!(leased.data, email("a@x"));
        assert_eq!(leased.tries, 1);

        q.acknowledge(&leased).await.unwrap();
        assert!(!q.has(job.id).await.unwrap());
        // Second ack of a vanished row is a no-op
        q.acknowledge(&leased).await.unwrap();
        assert!(q.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn priority_then_fifo() {
        let q = queue();
        let a = q.enqueue(email("a"), EnqueueOptions::new().priority(5)).await.unwrap();
        let b = q.enqueue(email("b"), EnqueueOptions::new().priority(1)).await.unwrap();
        let c = q.enqueue(email("c"), EnqueueOptions::new().priority(1)).await.unwrap();

        let batch = q.dequeue_many(3).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![b.id, c.id, a.id]);
    }

    #[tokio::test]
    async fn dequeue_many_zero_is_empty() {
        let q = queue();
        q.enqueue(email("a"), EnqueueOptions::new()).await.unwrap();
        assert!(q.dequeue_many(0).await.unwrap().is_empty());
        assert_eq!(q.stats().await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn keep_old_returns_existing_job() {
        let q = queue();
        let first = q
            .enqueue(email("a"), EnqueueOptions::new().tag("t"))
            .await
            .unwrap();
        let second = q
            .enqueue(
                email("b"),
                EnqueueOptions::new().tag("t").unique_tag(UniqueTag::KeepOld),
            )
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.data, email("a"));
        assert_eq!(q.count_by_tag("t").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn take_new_replaces_even_a_leased_job() {
        let q = queue();
        q.enqueue(email("a"), EnqueueOptions::new().tag("t"))
            .await
            .unwrap();
        let leased = q.dequeue().await.unwrap().unwrap();

        let replaced = q
            .enqueue(
                email("b"),
                EnqueueOptions::new().tag("t").unique_tag(UniqueTag::TakeNew),
            )
            .await
            .unwrap();
        assert_ne!(replaced.id, leased.id);
        assert_eq!(replaced.tries, 0);

        let again = q.dequeue().await.unwrap().unwrap();
        assert_eq!(again.id, replaced.id);
        assert_eq!(again.data, email("b"));
        assert!(!q.renew_lease(&leased).await.unwrap());
    }

    #[tokio::test]
    async fn plain_enqueue_with_taken_tag_fails() {
        let q = queue();
        q.enqueue(email("a"), EnqueueOptions::new().tag("t"))
            .await
            .unwrap();
        let err = q
            .enqueue(email("b"), EnqueueOptions::new().tag("t"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Store(JobStoreError::DuplicateTag(_))));
    }

    #[tokio::test]
    async fn redelivers_after_lease_expiry_until_exhausted() {
        let q = queue_with(
            QueueConfig::default()
                .with_process_timeout(Duration::from_millis(100))
                .with_max_tries(2),
        );
        let job = q.enqueue(email("a"), EnqueueOptions::new()).await.unwrap();

        let first = q.dequeue().await.unwrap().unwrap();
        assert_eq!(first.tries, 1);
        assert!(q.dequeue().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(250)).await;
        let second = q.dequeue().await.unwrap().unwrap();
        assert_eq!(second.id, job.id);
        assert_eq!(second.tries, 2);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(q.dequeue().await.unwrap().is_none());
        assert!(q.has(job.id).await.unwrap());

        let dead = q.exhausted(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        let revived = q.revive(job.id).await.unwrap().unwrap();
        assert_eq!(revived.tries, 0);
        assert_eq!(q.dequeue().await.unwrap().unwrap().id, job.id);
    }

    #[tokio::test]
    async fn renew_lease_keeps_job_hidden() {
        let q = queue_with(QueueConfig::default().with_process_timeout(Duration::from_millis(150)));
        q.enqueue(email("a"), EnqueueOptions::new()).await.unwrap();
        let leased = q.dequeue().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(q.renew_lease(&leased).await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(q.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_variants_are_idempotent() {
        let q = queue();
        let a = q.enqueue(email("a"), EnqueueOptions::new()).await.unwrap();
        let b = q
            .enqueue(email("b"), EnqueueOptions::new().tag("b"))
            .await
            .unwrap();
        let c = q
            .enqueue(email("c"), EnqueueOptions::new().tag("c"))
            .await
            .unwrap();

        assert!(q.cancel(a.id).await.unwrap());
        assert!(!q.cancel(a.id).await.unwrap());
        assert!(q.cancel_by_tag("b").await.unwrap());
        assert!(!q.cancel_by_tag("b").await.unwrap());
        assert_eq!(q.cancel_by_tags(&["c".to_string()]).await.unwrap(), 1);
        assert_eq!(q.cancel_many(&[a.id, b.id, c.id]).await.unwrap(), 0);
        assert_eq!(q.stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn lookups_are_scoped_to_the_queue() {
        let store = InMemoryJobStore::arc();
        let mails: Queue<Email> =
            Queue::new(QueueName::new("mails").unwrap(), store.clone(), QueueConfig::default())
                .unwrap();
        let other: Queue<Email> =
            Queue::new(QueueName::new("other").unwrap(), store, QueueConfig::default()).unwrap();

        let job = mails
            .enqueue(email("a"), EnqueueOptions::new().tag("t"))
            .await
            .unwrap();
        assert_eq!(mails.get(job.id).await.unwrap().unwrap().data, email("a"));
        assert_eq!(mails.get_by_tag("t").await.unwrap().unwrap().id, job.id);
        assert_eq!(
            mails
                .get_by_tags(&["t".to_string(), "missing".to_string()])
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(other.get(job.id).await.unwrap().is_none());
        assert!(other.get_by_tag("t").await.unwrap().is_none());
        assert!(!other.cancel(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn get_names_the_undecodable_job() {
        let store = InMemoryJobStore::arc();
        let name = QueueName::new("mails").unwrap();
        let raw: Queue<serde_json::Value> =
            Queue::new(name.clone(), store.clone(), QueueConfig::default()).unwrap();
        let typed: Queue<Email> = Queue::new(name, store, QueueConfig::default()).unwrap();

        let job = raw
            .enqueue(serde_json::json!({"unexpected": true}), EnqueueOptions::new())
            .await
            .unwrap();
        let err = typed.get(job.id).await.unwrap_err();
        assert!(matches!(err, QueueError::Decode { id, .. } if id == job.id));
    }

    #[tokio::test]
    async fn undecodable_job_does_not_hold_back_its_batch() {
        let store = InMemoryJobStore::arc();
        let name = QueueName::new("counts").unwrap();
        let config = QueueConfig::default()
            .with_process_timeout(Duration::from_millis(30))
            .with_max_tries(2);
        let raw: Queue<serde_json::Value> =
            Queue::new(name.clone(), store.clone(), config).unwrap();
        let typed: Queue<u32> = Queue::new(name, store, config).unwrap();

        let bad = raw
            .enqueue(serde_json::json!("not a number"), EnqueueOptions::new().priority(0))
            .await
            .unwrap();
        let good = typed
            .enqueue(7, EnqueueOptions::new().priority(1))
            .await
            .unwrap();

        let batch = typed.dequeue_many(2).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, good.id);
        assert_eq!(batch[0].data, 7);
        assert_eq!(batch[0].tries, 1);

        // The bad row went straight to the exhausted set.
        let stats = typed.stats().await.unwrap();
        assert_eq!(stats.exhausted, 1);
        assert_eq!(stats.leased, 1);
        let dead = raw.exhausted(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, bad.id);
        assert!(typed.exhausted(10).await.unwrap().is_empty());

        // The good job is still redelivered normally after its lease lapses.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let again = typed.dequeue_many(2).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, good.id);
        assert_eq!(again[0].tries, 2);
    }

    #[tokio::test]
    async fn list_views_skip_undecodable_rows() {
        let store = InMemoryJobStore::arc();
        let name = QueueName::new("mails").unwrap();
        let raw: Queue<serde_json::Value> =
            Queue::new(name.clone(), store.clone(), QueueConfig::default()).unwrap();
        let typed: Queue<Email> = Queue::new(name, store, QueueConfig::default()).unwrap();

        raw.enqueue(serde_json::json!(42), EnqueueOptions::new().tag("bad"))
            .await
            .unwrap();
        let ok = typed
            .enqueue(email("a"), EnqueueOptions::new().tag("ok"))
            .await
            .unwrap();

        let found = typed
            .get_by_tags(&["bad".to_string(), "ok".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, ok.id);
    }

    #[tokio::test]
    async fn enqueue_announces_on_wake_bus() {
        let bus = Arc::new(InMemoryWakeBus::new());
        let q = queue().with_wake_bus(bus.clone());
        let mut wake = bus.subscribe("mails");

        q.enqueue(email("a"), EnqueueOptions::new()).await.unwrap();
        tokio::time::timeout(Duration::from_millis(100), wake.recv())
            .await
            .expect("enqueue should wake subscribers");

        // Empty batches announce nothing
        q.enqueue_many(vec![], None).await.unwrap();
        let woke = tokio::time::timeout(Duration::from_millis(20), wake.recv()).await;
        assert!(woke.is_err());
    }

    struct BrokenBus;

    #[async_trait]
    impl WakeBus for BrokenBus {
        async fn publish(&self, _queue: &str) -> Result<(), WakeError> {
            Err(WakeError::Transport("down".to_string()))
        }

        fn subscribe(&self, _queue: &str) -> WakeSubscription {
            WakeSubscription::never()
        }
    }

    /// Bus whose publish never completes.
    struct StalledBus;

    #[async_trait]
    impl WakeBus for StalledBus {
        async fn publish(&self, _queue: &str) -> Result<(), WakeError> {
            futures::future::pending().await
        }

        fn subscribe(&self, _queue: &str) -> WakeSubscription {
            WakeSubscription::never()
        }
    }

    #[tokio::test]
    async fn enqueue_does_not_wait_for_wake_publish() {
        let q = queue().with_wake_bus(Arc::new(StalledBus));
        let job = tokio::time::timeout(
            Duration::from_millis(200),
            q.enqueue(email("a"), EnqueueOptions::new()),
        )
        .await
        .expect("enqueue should not block on the wake bus")
        .unwrap();
        assert!(q.has(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn wake_failure_does_not_fail_enqueue() {
        let q = queue().with_wake_bus(Arc::new(BrokenBus));
        let job = q.enqueue(email("a"), EnqueueOptions::new()).await.unwrap();
        assert!(q.has(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn enqueue_many_keeps_input_order() {
        let q = queue();
        let items = vec![
            NewJob::new(email("1")).with_tag("x"),
            NewJob::new(email("2")),
            NewJob::new(email("3")).with_tag("x"),
        ];
        let jobs = q.enqueue_many(items, Some(UniqueTag::KeepOld)).await.unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].data, email("1"));
        assert_eq!(jobs[1].data, email("2"));
        assert_eq!(jobs[2].id, jobs[0].id);
    }
}
