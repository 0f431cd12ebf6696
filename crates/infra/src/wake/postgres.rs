//! `LISTEN`/`NOTIFY` wake bus.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio_util::sync::{CancellationToken, DropGuard};

use leaseq_events::{InMemoryWakeBus, WakeBus, WakeError, WakeSubscription};

/// Pause after a listener error before trying again.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Wake bus over Postgres `pg_notify`.
///
/// Publishing sends the queue name as the payload on one shared channel. A
/// background task holds a dedicated listening connection and fans incoming
/// notifications out to local subscribers. The task stops when the last clone
/// of the bus is dropped.
#[derive(Debug, Clone)]
pub struct PgNotifyWakeBus {
    pool: PgPool,
    channel: String,
    local: Arc<InMemoryWakeBus>,
    _listener: Arc<DropGuard>,
}

impl PgNotifyWakeBus {
    pub const DEFAULT_CHANNEL: &'static str = "leaseq_wake";

    pub async fn connect(pool: PgPool) -> Result<Self, WakeError> {
        Self::with_channel(pool, Self::DEFAULT_CHANNEL).await
    }

    pub async fn with_channel(pool: PgPool, channel: impl Into<String>) -> Result<Self, WakeError> {
        let channel = channel.into();
        let mut listener = PgListener::connect_with(&pool)
            .await
            .map_err(|e| WakeError::Transport(e.to_string()))?;
        listener
            .listen(&channel)
            .await
            .map_err(|e| WakeError::Transport(e.to_string()))?;

        let local = Arc::new(InMemoryWakeBus::new());
        let token = CancellationToken::new();
        tokio::spawn(forward(listener, Arc::clone(&local), token.clone()));
        tracing::debug!(channel = %channel, "wake listener started");

        Ok(Self {
            pool,
            channel,
            local,
            _listener: Arc::new(token.drop_guard()),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

async fn forward(mut listener: PgListener, local: Arc<InMemoryWakeBus>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            msg = listener.recv() => match msg {
                Ok(notification) => {
                    if let Err(e) = local.notify(notification.payload()) {
                        tracing::warn!(error = %e, "failed to fan out wake");
                    }
                }
                Err(e) => {
                    // Notifications may have been lost while the connection
                    // was down; wake everyone so they re-poll.
                    tracing::warn!(error = %e, "wake listener error");
                    if let Err(e) = local.notify_all() {
                        tracing::warn!(error = %e, "failed to fan out wake");
                    }
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            },
        }
    }
    tracing::debug!("wake listener stopped");
}

#[async_trait]
impl WakeBus for PgNotifyWakeBus {
    async fn publish(&self, queue: &str) -> Result<(), WakeError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(|e| WakeError::Transport(e.to_string()))?;
        Ok(())
    }

    fn subscribe(&self, queue: &str) -> WakeSubscription {
        self.local.subscribe(queue)
    }
}
