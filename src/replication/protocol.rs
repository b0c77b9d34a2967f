//! Replication Protocol
//!
//! Defines the wire protocol for communication between members.

use std::collections::HashMap;
use serde::{Deserialize, Serialize};

use crate::replication::oplog::{LogPosition, OpEntry};
use crate::topology::{Member, MemberHealth, MemberId, MemberRole, Term};

/// Protocol messages for member communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Heartbeat ==========
    /// Liveness probe
    Heartbeat {
        set_name: String,
        from: MemberId,
        term: Term,
    },

    /// Heartbeat response
    HeartbeatResponse {
        member_id: MemberId,
        term: Term,
        role: MemberRole,
        log_position: LogPosition,
        primary: Option<MemberId>,
        /// Responder stepped down recently and will not stand
        frozen: bool,
    },

    // ========== Election ==========
    /// Request vote (from candidate). A dry run asks whether the vote would
    /// be granted at `term` without changing the voter's state.
    RequestVote {
        set_name: String,
        term: Term,
        candidate_id: MemberId,
        last_position: LogPosition,
        last_term: Term,
        dry_run: bool,
    },

    /// Vote response
    VoteResponse {
        member_id: MemberId,
        term: Term,
        granted: bool,
        reason: Option<String>,
    },

    // ========== Log Replication ==========
    /// Append entries request (from primary to secondaries)
    AppendEntries {
        set_name: String,
        term: Term,
        primary_id: MemberId,
        prev_position: LogPosition,
        prev_term: Term,
        entries: Vec<OpEntry>,
        commit_position: LogPosition,
    },

    /// Append entries response
    AppendEntriesResponse {
        member_id: MemberId,
        term: Term,
        success: bool,
        match_position: LogPosition,
    },

    // ========== Status ==========
    /// Status request
    StatusRequest,

    /// Status response
    StatusResponse { status: NodeStatus },

    // ========== Error ==========
    /// Error response
    Error { code: ErrorCode, message: String },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Message addressed to another replica set
    WrongReplicaSet,
    /// Sender is not a member of the topology
    UnknownMember,
    /// Message not handled by this endpoint
    Unexpected,
    /// Internal error
    Internal,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Heartbeat { .. } => "Heartbeat",
            Message::HeartbeatResponse { .. } => "HeartbeatResponse",
            Message::RequestVote { .. } => "RequestVote",
            Message::VoteResponse { .. } => "VoteResponse",
            Message::AppendEntries { .. } => "AppendEntries",
            Message::AppendEntriesResponse { .. } => "AppendEntriesResponse",
            Message::StatusRequest => "StatusRequest",
            Message::StatusResponse { .. } => "StatusResponse",
            Message::Error { .. } => "Error",
        }
    }

    /// Term carried by the message, if any
    pub fn term(&self) -> Option<Term> {
        match self {
            Message::Heartbeat { term, .. }
            | Message::HeartbeatResponse { term, .. }
            | Message::RequestVote { term, .. }
            | Message::VoteResponse { term, .. }
            | Message::AppendEntries { term, .. }
            | Message::AppendEntriesResponse { term, .. } => Some(*term),
            _ => None,
        }
    }
}

/// Point-in-time view of one member, as reported by a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberStatus {
    pub id: MemberId,
    pub host: String,
    pub priority: u32,
    pub arbiter: bool,
    pub role: MemberRole,
    pub health: MemberHealth,
    pub log_position: LogPosition,
    pub stale: bool,
    pub frozen: bool,
    pub ping_ms: Option<u64>,
}

impl From<&Member> for MemberStatus {
    fn from(member: &Member) -> Self {
        Self {
            id: member.id(),
            host: member.host().to_string(),
            priority: member.priority(),
            arbiter: member.is_arbiter(),
            role: member.role,
            health: member.health,
            log_position: member.log_position,
            stale: member.stale,
            frozen: member.frozen,
            ping_ms: member.ping_ms,
        }
    }
}

/// Status of one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub set_name: String,
    pub member_id: MemberId,
    /// Election state name (follower, candidate, primary)
    pub state: String,
    pub term: Term,
    pub primary: Option<MemberId>,
    pub last_position: LogPosition,
    pub commit_position: LogPosition,
    pub members: Vec<MemberStatus>,
    /// Entries each secondary trails by; empty unless primary
    pub lag: HashMap<MemberId, u64>,
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }

    /// Whether `data` matches the checksum
    pub fn verify(&self, data: &[u8]) -> bool {
        crc32fast::hash(data) == self.checksum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::oplog::Operation;

    #[test]
    fn test_message_serialization() {
        let msg = Message::Heartbeat {
            set_name: "rs0".to_string(),
            from: 1,
            term: 4,
        };

        let bytes = msg.serialize().unwrap();
        let restored = Message::deserialize(&bytes).unwrap();

        match restored {
            Message::Heartbeat { set_name, from, term } => {
                assert_eq!(set_name, "rs0");
                assert_eq!(from, 1);
                assert_eq!(term, 4);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_append_entries_carries_operations() {
        let msg = Message::AppendEntries {
            set_name: "rs0".to_string(),
            term: 2,
            primary_id: 0,
            prev_position: 0,
            prev_term: 0,
            entries: vec![OpEntry {
                position: 1,
                term: 2,
                timestamp: chrono::Utc::now(),
                operation: Operation::Delete {
                    collection: "orders".into(),
                    filter: r#"{"status":"void"}"#.into(),
                },
            }],
            commit_position: 0,
        };

        let restored = Message::deserialize(&msg.serialize().unwrap()).unwrap();
        assert_eq!(restored.type_name(), "AppendEntries");
        assert_eq!(restored.term(), Some(2));
        match restored {
            Message::AppendEntries { entries, .. } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].operation.collection(), Some("orders"));
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let bytes = header.to_bytes();
        let restored = FrameHeader::from_bytes(&bytes);

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
        assert!(restored.verify(data));
        assert!(!restored.verify(b"tampered message"));
    }
}
