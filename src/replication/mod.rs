//! Replication Module
//!
//! Ships the operation log from the primary to secondaries and tracks
//! acknowledgments for write-concern guarantees.

pub mod oplog;
pub mod protocol;
mod write_concern;
mod shipper;
mod applier;

pub use oplog::{AppendOutcome, LogPosition, OpEntry, OpLog, Operation};
pub use protocol::{ErrorCode, FrameHeader, MemberStatus, Message, NodeStatus};
pub use write_concern::WriteConcern;
pub use shipper::{LogShipper, WriteAck};
pub use applier::OplogApplier;

use std::time::Duration;
use serde::{Deserialize, Serialize};

/// Configuration for replication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Maximum entries per AppendEntries batch
    #[serde(default = "default_max_batch_entries")]
    pub max_batch_entries: usize,

    /// Background shipping interval in milliseconds
    #[serde(default = "default_ship_interval_ms")]
    pub ship_interval_ms: u64,

    /// How long a write waits for its write concern, in milliseconds
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Lag (in entries) beyond which a secondary is marked stale
    #[serde(default = "default_max_lag_entries")]
    pub max_lag_entries: u64,

    /// Write concern used when a write does not name one
    #[serde(default)]
    pub default_write_concern: WriteConcern,
}

fn default_max_batch_entries() -> usize {
    1000
}

fn default_ship_interval_ms() -> u64 {
    100
}

fn default_write_timeout_ms() -> u64 {
    5000
}

fn default_max_lag_entries() -> u64 {
    10_000
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_batch_entries: default_max_batch_entries(),
            ship_interval_ms: default_ship_interval_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            max_lag_entries: default_max_lag_entries(),
            default_write_concern: WriteConcern::default(),
        }
    }
}

impl ReplicationConfig {
    /// Background shipping interval
    pub fn ship_interval(&self) -> Duration {
        Duration::from_millis(self.ship_interval_ms)
    }

    /// Write-concern wait bound
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}
