//! Process configuration from environment variables.
//!
//! | variable                     | required | default      |
//! |------------------------------|----------|--------------|
//! | `DATABASE_URL`               | yes      |              |
//! | `REDIS_URL`                  | no       |              |
//! | `LEASEQ_QUEUE`               | no       | `default`    |
//! | `LEASEQ_PROCESS_TIMEOUT_MS`  | no       | 60000        |
//! | `LEASEQ_MAX_TRIES`           | no       | 3            |
//! | `LEASEQ_POLL_INTERVAL_MS`    | no       | 5000         |

use std::str::FromStr;
use std::time::Duration;

use leaseq_core::{QueueConfig, QueueName};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub queue: QueueName,
    pub queue_config: QueueConfig,
}

impl Settings {
    pub const DEFAULT_QUEUE: &'static str = "default";

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let redis_url = get("REDIS_URL");

        let queue = QueueName::new(get("LEASEQ_QUEUE").unwrap_or_else(|| Self::DEFAULT_QUEUE.to_string()))
            .map_err(|e| ConfigError::Invalid {
                key: "LEASEQ_QUEUE",
                reason: e.to_string(),
            })?;

        let mut queue_config = QueueConfig::default();
        if let Some(ms) = parse::<u64>("LEASEQ_PROCESS_TIMEOUT_MS", get("LEASEQ_PROCESS_TIMEOUT_MS"))? {
            queue_config = queue_config.with_process_timeout(Duration::from_millis(ms));
        }
        if let Some(tries) = parse::<u32>("LEASEQ_MAX_TRIES", get("LEASEQ_MAX_TRIES"))? {
            queue_config = queue_config.with_max_tries(tries);
        }
        if let Some(ms) = parse::<u64>("LEASEQ_POLL_INTERVAL_MS", get("LEASEQ_POLL_INTERVAL_MS"))? {
            queue_config = queue_config.with_poll_interval(Duration::from_millis(ms));
        }
        queue_config.validate().map_err(|e| ConfigError::Invalid {
            key: "LEASEQ_*",
            reason: e.to_string(),
        })?;

        Ok(Self {
            database_url,
            redis_url,
            queue,
            queue_config,
        })
    }
}

fn parse<T>(key: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                reason: format!("{raw:?}: {e}"),
            })
        })
        .transpose()
}
