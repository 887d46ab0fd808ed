//! Configuration for replication.

use crate::clock::NodeId;
use std::time::Duration;

/// How replay resolves two nodes writing the same row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Apply every entry in log order; a late, older entry still overwrites.
    #[default]
    LogOrder,
    /// Skip an entry if its row already took an entry with a greater
    /// `(timestamp, node)`.
    LastWriterWins,
}

impl ConflictPolicy {
    /// Lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::LogOrder => "log-order",
            ConflictPolicy::LastWriterWins => "last-writer-wins",
        }
    }
}

/// Configuration for a replicating node.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// This node's identity.
    pub node_id: NodeId,
    /// Bounded retry of failed entries.
    pub retry: RetryConfig,
    /// Records fetched per page by lazy reads and catch-up.
    pub page_size: usize,
    /// Concurrent-write resolution.
    pub conflict_policy: ConflictPolicy,
}

impl ReplicationConfig {
    /// Creates a configuration for a node.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            retry: RetryConfig::default(),
            page_size: 256,
            conflict_policy: ConflictPolicy::default(),
        }
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the page size; zero is treated as one.
    #[must_use]
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Sets the conflict policy.
    #[must_use]
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }
}

/// Configuration for retrying failed entries.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Apply attempts before an entry is parked as FAILED.
    pub max_attempts: u32,
    /// Delay before the first retry pass.
    pub initial_delay: Duration,
    /// Maximum delay between retry passes.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    /// Parks an entry on its first failure.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay before retry pass `attempt` (0-indexed; pass 0 runs at once).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replication_config_builder() {
        let node = NodeId::random();
        let config = ReplicationConfig::new(node)
            .with_page_size(0)
            .with_conflict_policy(ConflictPolicy::LastWriterWins)
            .with_retry(RetryConfig::no_retry());

        assert_eq!(config.node_id, node);
        assert_eq!(config.page_size, 1);
        assert_eq!(config.conflict_policy, ConflictPolicy::LastWriterWins);
        assert_eq!(config.retry.max_attempts, 1);
    }

    #[test]
    fn default_policy_is_log_order() {
        assert_eq!(ReplicationConfig::new(NodeId::random()).conflict_policy, ConflictPolicy::LogOrder);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }

    #[test]
    fn zero_attempts_means_one() {
        assert_eq!(RetryConfig::new(0).max_attempts, 1);
    }
}
