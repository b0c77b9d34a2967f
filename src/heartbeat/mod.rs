//! Heartbeat Module
//!
//! Liveness probing of data-bearing members and primary-loss detection.

mod monitor;

pub use monitor::{HeartbeatMonitor, PrimaryLoss};

use std::time::Duration;
use serde::{Deserialize, Serialize};

/// Heartbeat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Probe interval in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Deadline for a single probe in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Consecutive failed probes before a member is unreachable
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_interval_ms() -> u64 {
    500
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
