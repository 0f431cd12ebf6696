//! Cancellable pull loops over a [`Queue`].
//!
//! Each loop iteration:
//!
//! 1. stops if the token is cancelled,
//! 2. leases a batch,
//! 3. yields it when non-empty, otherwise waits for the poll interval, a wake
//!    for this queue, or cancellation, whichever comes first.
//!
//! Lease expiry is never announced, so the poll interval bounds how long a
//! redeliverable job can sit unnoticed. Store errors are yielded as stream
//! items and followed by one poll interval of back-off.

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use leaseq_core::Job;
use leaseq_events::WakeSubscription;

use crate::queue::{Queue, QueueResult};

struct Consumer<T> {
    queue: Queue<T>,
    batch_size: usize,
    token: CancellationToken,
    wake: WakeSubscription,
    back_off: bool,
}

impl<T> Consumer<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    async fn next_batch(&mut self) -> Option<QueueResult<Vec<Job<T>>>> {
        let poll_interval = self.queue.config.poll_interval;

        loop {
            if self.token.is_cancelled() {
                return None;
            }

            if std::mem::take(&mut self.back_off) {
                tokio::select! {
                    _ = self.token.cancelled() => return None,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
                continue;
            }

            // Wakes that arrived before this lease are covered by it.
            self.wake.drain();

            match self.queue.dequeue_many(self.batch_size).await {
                Ok(jobs) if !jobs.is_empty() => return Some(Ok(jobs)),
                Ok(_) => {
                    tokio::select! {
                        _ = self.token.cancelled() => return None,
                        _ = self.wake.recv() => {
                            tracing::trace!(queue = %self.queue.name, "woken");
                        }
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(queue = %self.queue.name, error = %e, "dequeue failed");
                    self.back_off = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl<T> Queue<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Stream of single jobs until `token` is cancelled.
    ///
    /// Jobs arrive leased; acknowledge each one once processed.
    pub fn consumer(&self, token: CancellationToken) -> BoxStream<'static, QueueResult<Job<T>>> {
        self.batch_consumer(1, token)
            .flat_map(|batch| {
                let items: Vec<QueueResult<Job<T>>> = match batch {
                    Ok(jobs) => jobs.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(items)
            })
            .boxed()
    }

    /// Stream of non-empty batches of at most `size` jobs until `token` is
    /// cancelled. A `size` of zero is treated as one.
    pub fn batch_consumer(
        &self,
        size: usize,
        token: CancellationToken,
    ) -> BoxStream<'static, QueueResult<Vec<Job<T>>>> {
        // Subscribe before the first lease so no wake can slip between them.
        let wake = match &self.wake {
            Some(bus) => bus.subscribe(self.name.as_str()),
            None => WakeSubscription::never(),
        };

        let consumer = Consumer {
            queue: self.clone(),
            batch_size: size.max(1),
            token,
            wake,
            back_off: false,
        };

        tracing::debug!(queue = %self.name, batch_size = consumer.batch_size, "consumer started");

        stream::unfold(consumer, |mut consumer| async move {
            let batch = consumer.next_batch().await?;
            Some((batch, consumer))
        })
        .boxed()
    }
}
