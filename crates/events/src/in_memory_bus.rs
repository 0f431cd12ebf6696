//! In-process wake bus.
//!
//! Also the local fan-out used by the Postgres and Redis buses once a
//! notification has arrived from the wire.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::bus::{WakeBus, WakeError, WakeSubscription};

/// Wakes buffered per subscriber before older ones are dropped.
const CHANNEL_CAPACITY: usize = 16;

/// In-memory wake bus.
///
/// - One `broadcast` channel per queue name, created on first use
/// - No IO
#[derive(Debug, Default)]
pub struct InMemoryWakeBus {
    channels: Mutex<HashMap<String, broadcast::Sender<()>>>,
}

impl InMemoryWakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every current subscriber of `queue`.
    pub fn notify(&self, queue: &str) -> Result<(), WakeError> {
        let mut channels = self.channels.lock().map_err(|_| WakeError::Poisoned)?;
        if let Some(tx) = channels.get(queue) {
            // No receivers left: forget the channel until someone subscribes again.
            if tx.send(()).is_err() {
                channels.remove(queue);
            }
        }
        Ok(())
    }

    /// Wake every subscriber of every queue.
    pub fn notify_all(&self) -> Result<(), WakeError> {
        let mut channels = self.channels.lock().map_err(|_| WakeError::Poisoned)?;
        channels.retain(|_, tx| tx.send(()).is_ok());
        Ok(())
    }

    /// Number of live subscriptions on `queue`.
    pub fn subscriber_count(&self, queue: &str) -> usize {
        self.channels
            .lock()
            .ok()
            .and_then(|channels| channels.get(queue).map(|tx| tx.receiver_count()))
            .unwrap_or(0)
    }
}

#[async_trait]
impl WakeBus for InMemoryWakeBus {
    async fn publish(&self, queue: &str) -> Result<(), WakeError> {
        self.notify(queue)
    }

    fn subscribe(&self, queue: &str) -> WakeSubscription {
        match self.channels.lock() {
            Ok(mut channels) => {
                let tx = channels
                    .entry(queue.to_owned())
                    .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
                WakeSubscription::new(tx.subscribe())
            }
            Err(_) => {
                tracing::warn!(queue, "wake bus lock poisoned; subscription will never fire");
                WakeSubscription::never()
            }
        }
    }
}
