//! Infrastructure layer: job stores, wake transports, the typed queue and its
//! consumers, configuration.

pub mod config;
pub mod consumer;
pub mod jobs;
pub mod queue;
pub mod wake;

pub use config::{ConfigError, Settings};
pub use jobs::{InMemoryJobStore, JobStore, JobStoreError, PostgresJobStore, QueueStats};
pub use queue::{Queue, QueueError, QueueResult};
pub use wake::PgNotifyWakeBus;
#[cfg(feature = "redis")]
pub use wake::RedisPubSubWakeBus;
