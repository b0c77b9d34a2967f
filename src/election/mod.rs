//! Election Module
//!
//! Primary election among electable members: dry-run and real voting
//! rounds, the voter rules, priority takeover and step-down.

mod coordinator;

pub use coordinator::{ElectionCoordinator, ElectionOutcome, ElectionState};

use std::time::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Minimum election timeout in milliseconds (randomized)
    #[serde(default = "default_timeout_min_ms")]
    pub timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds (randomized)
    #[serde(default = "default_timeout_max_ms")]
    pub timeout_max_ms: u64,

    /// Deadline for a single vote request in milliseconds
    #[serde(default = "default_vote_timeout_ms")]
    pub vote_timeout_ms: u64,

    /// Election attempts per primary-loss signal
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay in milliseconds, doubled per attempt
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Retry delay cap in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Random delay added to every retry, in milliseconds
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    /// How long a stepped-down primary refuses to stand, in seconds
    #[serde(default = "default_stepdown_secs")]
    pub stepdown_secs: u64,
}

fn default_timeout_min_ms() -> u64 {
    1000
}

fn default_timeout_max_ms() -> u64 {
    2000
}

fn default_vote_timeout_ms() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    2000
}

fn default_jitter_ms() -> u64 {
    100
}

fn default_stepdown_secs() -> u64 {
    10
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            timeout_min_ms: default_timeout_min_ms(),
            timeout_max_ms: default_timeout_max_ms(),
            vote_timeout_ms: default_vote_timeout_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter_ms: default_jitter_ms(),
            stepdown_secs: default_stepdown_secs(),
        }
    }
}

impl ElectionConfig {
    /// Generate a random election timeout
    pub fn random_timeout(&self) -> Duration {
        let mut rng = rand::thread_rng();
        let ms = rng.gen_range(self.timeout_min_ms..=self.timeout_max_ms.max(self.timeout_min_ms));
        Duration::from_millis(ms)
    }

    /// Longest election timeout
    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_max_ms)
    }

    /// Deadline for a single vote request
    pub fn vote_timeout(&self) -> Duration {
        Duration::from_millis(self.vote_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based): exponential, capped,
    /// plus random jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms);
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    /// Step-down freeze period
    pub fn stepdown_period(&self) -> Duration {
        Duration::from_secs(self.stepdown_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = ElectionConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 1000,
            jitter_ms: 0,
            ..Default::default()
        };

        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(4), Duration::from_millis(800));
        assert_eq!(config.backoff(5), Duration::from_millis(1000));
        assert_eq!(config.backoff(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let config = ElectionConfig {
            backoff_base_ms: 50,
            backoff_max_ms: 50,
            jitter_ms: 25,
            ..Default::default()
        };
        for attempt in 1..20 {
            let delay = config.backoff(attempt);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(75));
        }
    }

    #[test]
    fn test_random_timeout_in_range() {
        let config = ElectionConfig::default();
        for _ in 0..50 {
            let timeout = config.random_timeout();
            assert!(timeout >= Duration::from_millis(config.timeout_min_ms));
            assert!(timeout <= Duration::from_millis(config.timeout_max_ms));
        }
    }
}
