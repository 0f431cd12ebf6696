//! Wake publication/subscription abstraction (mechanics only).
//!
//! The bus sits beside the job store, never in front of it:
//!
//! ```text
//! Producer → Job Store (commit) → WakeBus::publish(queue) → idle consumers
//! ```
//!
//! Jobs are committed first and announced second. A lost, duplicated or late
//! wake only changes how soon a consumer polls, never what it sees.
//!
//! ## Delivery
//!
//! - **Best effort**: a publish may reach no one.
//! - **Coalescing**: several wakes that arrive while a subscriber is busy may
//!   collapse into one.
//! - **Per queue**: a subscription only hears wakes for the queue it named.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WakeError {
    /// The underlying transport (database, Redis, ...) rejected the publish.
    #[error("wake transport error: {0}")]
    Transport(String),

    /// Internal lock poisoning.
    #[error("wake bus lock poisoned")]
    Poisoned,
}

/// A subscription to one queue's wakes.
///
/// ## Usage Pattern
///
/// ```ignore
/// let mut wake = bus.subscribe("mails");
/// loop {
///     if let Some(job) = queue.dequeue().await? { process(job); continue; }
///     tokio::select! {
///         _ = tokio::time::sleep(poll_interval) => {}
///         _ = wake.recv() => {}
///     }
/// }
/// ```
#[derive(Debug)]
pub struct WakeSubscription {
    receiver: broadcast::Receiver<()>,
}

impl WakeSubscription {
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self { receiver }
    }

    /// A subscription that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = broadcast::channel(1);
        Self { receiver: rx }
    }

    /// Wait for the next wake.
    ///
    /// Falling behind counts as a wake. A closed channel never completes, so a
    /// caller racing this against a timer degrades to plain polling.
    pub async fn recv(&mut self) {
        match self.receiver.recv().await {
            Ok(()) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }

    /// Drop any wakes that are already buffered.
    pub fn drain(&mut self) {
        while let Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_)) =
            self.receiver.try_recv()
        {}
    }
}

/// Per-queue wake channel.
///
/// Injected into the queue facade as an optional collaborator; the queue is
/// fully correct without one.
#[async_trait]
pub trait WakeBus: Send + Sync {
    /// Announce that `queue` may have eligible jobs.
    async fn publish(&self, queue: &str) -> Result<(), WakeError>;

    fn subscribe(&self, queue: &str) -> WakeSubscription;
}

#[async_trait]
impl<B> WakeBus for Arc<B>
where
    B: WakeBus + ?Sized,
{
    async fn publish(&self, queue: &str) -> Result<(), WakeError> {
        (**self).publish(queue).await
    }

    fn subscribe(&self, queue: &str) -> WakeSubscription {
        (**self).subscribe(queue)
    }
}
