//! Per-queue lease and polling configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Per-queue configuration.
///
/// Defaults:
///
/// | field             | default | meaning                                              |
/// |-------------------|---------|------------------------------------------------------|
/// | `process_timeout` | 60 s    | lease duration before an unacknowledged job is redelivered |
/// | `max_tries`       | 3       | leases a job may receive before it becomes ineligible |
/// | `poll_interval`   | 5 s     | longest a consumer waits between empty dequeues      |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub process_timeout: Duration,
    pub max_tries: u32,
    pub poll_interval: Duration,
}

impl QueueConfig {
    pub const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DEFAULT_MAX_TRIES: u32 = 3;
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout = timeout;
        self
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Reject configurations under which no job could ever be leased or the
    /// consumer would spin.
    pub fn validate(&self) -> DomainResult<()> {
        if self.max_tries == 0 {
            return Err(DomainError::validation("max_tries must be at least 1"));
        }
        if self.process_timeout.is_zero() {
            return Err(DomainError::validation("process_timeout must be positive"));
        }
        if self.poll_interval.is_zero() {
            return Err(DomainError::validation("poll_interval must be positive"));
        }
        Ok(())
    }

    /// `process_timeout` as a chrono duration, saturating on overflow.
    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.process_timeout).unwrap_or(chrono::Duration::MAX)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            process_timeout: Self::DEFAULT_PROCESS_TIMEOUT,
            max_tries: Self::DEFAULT_MAX_TRIES,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_documented_values() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.process_timeout, Duration::from_secs(60));
        assert_eq!(cfg.max_tries, 3);
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_degenerate_values() {
        let cfg = QueueConfig::default().with_max_tries(0);
        assert!(matches!(cfg.validate(), Err(DomainError::Validation(_))));

        let cfg = QueueConfig::default().with_process_timeout(Duration::ZERO);
        assert!(cfg.validate().is_err());

        let cfg = QueueConfig::default().with_poll_interval(Duration::ZERO);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn lease_duration_saturates() {
        let cfg = QueueConfig::default().with_process_timeout(Duration::MAX);
        assert_eq!(cfg.lease_duration(), chrono::Duration::MAX);
        assert_eq!(
            QueueConfig::default().lease_duration(),
            chrono::Duration::seconds(60)
        );
    }
}
