//! replset Error Types

use thiserror::Error;

use crate::replication::LogPosition;
use crate::topology::{MemberId, Term};

/// Result type alias for replset operations
pub type Result<T> = std::result::Result<T, Error>;

/// replset error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid bootstrap descriptor: {0}")]
    Json(#[from] serde_json::Error),

    // Topology errors
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("Member not found: {0}")]
    MemberNotFound(MemberId),

    #[error("Member {0} is not electable")]
    NotElectable(MemberId),

    #[error("Term {term} already has primary {existing}, refusing {claimed}")]
    ConflictingPrimary {
        term: Term,
        existing: MemberId,
        claimed: MemberId,
    },

    // Coordination errors
    #[error("Member {0} is unreachable")]
    UnreachableMember(MemberId),

    #[error("Stale term {received} (current term is {current})")]
    StaleTerm { received: Term, current: Term },

    #[error("Election did not complete after {attempts} attempts")]
    ElectionTimeout { attempts: u32 },

    #[error("Quorum unavailable: {acked}/{required} acknowledgments")]
    QuorumUnavailable { acked: usize, required: usize },

    #[error("Not primary (known primary: {primary:?})")]
    NotPrimary { primary: Option<MemberId> },

    #[error("Log gap: expected position {expected}, received {received}")]
    LogGap {
        expected: LogPosition,
        received: LogPosition,
    },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // State errors
    #[error("State error: {0}")]
    State(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::UnreachableMember(_)
                | Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::ElectionTimeout { .. }
                | Error::Network(_)
        )
    }
}
