//! Runtime Member State
//!
//! A declared member plus everything this node has observed about it.

use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};

use crate::replication::LogPosition;
use super::descriptor::MemberDescriptor;
use super::{MemberId, Term};

/// Observed role of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberRole {
    /// Not yet observed in any role
    Startup,
    /// Accepting writes
    Primary,
    /// Replicating from the primary
    Secondary,
    /// Vote-only member
    Arbiter,
}

impl std::fmt::Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberRole::Startup => write!(f, "STARTUP"),
            MemberRole::Primary => write!(f, "PRIMARY"),
            MemberRole::Secondary => write!(f, "SECONDARY"),
            MemberRole::Arbiter => write!(f, "ARBITER"),
        }
    }
}

/// Liveness of a member as seen by the heartbeat monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberHealth {
    /// Never probed (arbiters, or before the first round)
    Unknown,
    /// Last probe succeeded
    Up,
    /// Failed more consecutive probes than the threshold allows
    Unreachable,
}

impl std::fmt::Display for MemberHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberHealth::Unknown => write!(f, "UNKNOWN"),
            MemberHealth::Up => write!(f, "UP"),
            MemberHealth::Unreachable => write!(f, "UNREACHABLE"),
        }
    }
}

/// State of a single member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Declared configuration
    pub descriptor: MemberDescriptor,
    /// Observed role
    pub role: MemberRole,
    /// Term in which the current role was decided
    pub role_term: Term,
    /// Observed liveness
    pub health: MemberHealth,
    /// Consecutive failed probes
    pub consecutive_failures: u32,
    /// Round-trip time of the last successful probe
    pub ping_ms: Option<u64>,
    /// Last known log position
    pub log_position: LogPosition,
    /// Too far behind the primary to count towards write quorums
    pub stale: bool,
    /// Stepped down recently and not standing for election
    #[serde(default)]
    pub frozen: bool,
    /// Wall-clock time of the last successful probe
    pub last_heartbeat_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Monotonic time of the last successful probe (not serialized)
    #[serde(skip)]
    pub last_heartbeat: Option<Instant>,
}

impl Member {
    /// Create member state from its descriptor
    pub fn new(descriptor: MemberDescriptor) -> Self {
        let role = if descriptor.arbiter_only {
            MemberRole::Arbiter
        } else {
            MemberRole::Startup
        };

        Self {
            descriptor,
            role,
            role_term: 0,
            health: MemberHealth::Unknown,
            consecutive_failures: 0,
            ping_ms: None,
            log_position: 0,
            stale: false,
            frozen: false,
            last_heartbeat_at: None,
            last_heartbeat: None,
        }
    }

    pub fn id(&self) -> MemberId {
        self.descriptor.id
    }

    pub fn host(&self) -> &str {
        &self.descriptor.host
    }

    pub fn priority(&self) -> u32 {
        self.descriptor.effective_priority()
    }

    pub fn is_arbiter(&self) -> bool {
        self.descriptor.arbiter_only
    }

    pub fn is_voting(&self) -> bool {
        self.descriptor.is_voting()
    }

    pub fn is_electable(&self) -> bool {
        self.descriptor.is_electable()
    }

    pub fn is_primary(&self) -> bool {
        self.role == MemberRole::Primary
    }

    /// Not known to be unreachable
    pub fn is_reachable(&self) -> bool {
        self.health != MemberHealth::Unreachable
    }

    /// Record a successful probe
    pub fn touch(&mut self, rtt: Duration) {
        self.last_heartbeat = Some(Instant::now());
        self.last_heartbeat_at = Some(chrono::Utc::now());
        self.ping_ms = Some(rtt.as_millis() as u64);
        self.consecutive_failures = 0;
        self.health = MemberHealth::Up;
    }

    /// Time since the last successful probe
    pub fn time_since_heartbeat(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }
}
