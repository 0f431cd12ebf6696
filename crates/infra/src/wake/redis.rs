//! Redis pub/sub wake bus (optional).
//!
//! Note: Redis pub/sub drops messages for disconnected subscribers. That is
//! fine here; consumers still poll.

use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use redis::Commands;

use leaseq_events::{InMemoryWakeBus, WakeBus, WakeError, WakeSubscription};

/// How often the subscriber thread checks whether the bus is still alive.
const READ_TIMEOUT: Duration = Duration::from_secs(1);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Redis pub/sub wake bus.
///
/// Publishes the queue name on one channel. A background thread subscribes to
/// that channel and forwards messages to local subscribers; it exits once every
/// clone of the bus is dropped.
#[derive(Debug, Clone)]
pub struct RedisPubSubWakeBus {
    client: redis::Client,
    channel: String,
    local: Arc<InMemoryWakeBus>,
}

impl RedisPubSubWakeBus {
    pub const DEFAULT_CHANNEL: &'static str = "leaseq:wake";

    pub fn new(redis_url: impl AsRef<str>, channel: impl Into<String>) -> Result<Self, WakeError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| WakeError::Transport(e.to_string()))?;
        let channel = channel.into();
        let local = Arc::new(InMemoryWakeBus::new());

        let thread_client = client.clone();
        let thread_channel = channel.clone();
        let weak = Arc::downgrade(&local);
        thread::Builder::new()
            .name("leaseq-redis-wake".to_string())
            .spawn(move || forward(thread_client, thread_channel, weak))
            .map_err(|e| WakeError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            channel,
            local,
        })
    }
}

/// Subscriber thread body. Reconnects on error until the bus is gone.
fn forward(client: redis::Client, channel: String, local: Weak<InMemoryWakeBus>) {
    while local.strong_count() > 0 {
        if let Err(e) = forward_once(&client, &channel, &local) {
            tracing::warn!(error = %e, channel = %channel, "redis wake subscriber error");
            fan_out(&local, None);
            thread::sleep(RECONNECT_DELAY);
        }
    }
}

fn forward_once(
    client: &redis::Client,
    channel: &str,
    local: &Weak<InMemoryWakeBus>,
) -> redis::RedisResult<()> {
    let mut conn = client.get_connection()?;
    let mut pubsub = conn.as_pubsub();
    pubsub.set_read_timeout(Some(READ_TIMEOUT))?;
    pubsub.subscribe(channel)?;

    loop {
        let msg = match pubsub.get_message() {
            Ok(m) => m,
            Err(e) if e.is_timeout() => {
                if local.strong_count() == 0 {
                    return Ok(());
                }
                continue;
            }
            Err(e) => return Err(e),
        };

        let queue: String = match msg.get_payload() {
            Ok(p) => p,
            Err(_) => continue,
        };

        if !fan_out(local, Some(&queue)) {
            return Ok(());
        }
    }
}

/// Wake local subscribers of `queue`, or of every queue when `None`.
/// Returns `false` once the bus has been dropped.
fn fan_out(local: &Weak<InMemoryWakeBus>, queue: Option<&str>) -> bool {
    let Some(bus) = local.upgrade() else {
        return false;
    };
    let result = match queue {
        Some(queue) => bus.notify(queue),
        None => bus.notify_all(),
    };
    if let Err(e) = result {
        tracing::warn!(error = %e, queue, "failed to fan out wake");
    }
    true
}

#[async_trait]
impl WakeBus for RedisPubSubWakeBus {
    async fn publish(&self, queue: &str) -> Result<(), WakeError> {
        let client = self.client.clone();
        let channel = self.channel.clone();
        let queue = queue.to_owned();

        // The sync client blocks; keep it off the async workers.
        tokio::task::spawn_blocking(move || {
            let mut conn = client.get_connection()?;
            let _: i64 = conn.publish(channel, queue)?;
            Ok::<_, redis::RedisError>(())
        })
        .await
        .map_err(|e| WakeError::Transport(e.to_string()))?
        .map_err(|e| WakeError::Transport(e.to_string()))
    }

    fn subscribe(&self, queue: &str) -> WakeSubscription {
        self.local.subscribe(queue)
    }
}
