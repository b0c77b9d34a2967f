//! replset - Replica-Set Coordination Core
//!
//! Keeps a small set of database members agreed on who the primary is and
//! replicates the primary's operation log to the data-bearing secondaries.
//!
//! # Architecture
//!
//! Every member runs the same [`node::ReplicaNode`]: a heartbeat monitor
//! that tracks member liveness, an election coordinator that picks a
//! primary by term-based majority vote, and a log shipper (on the primary)
//! or applier (on secondaries) that moves oplog entries between members.
//!
//! # Features
//!
//! - Bootstrap from a static descriptor (ordinal ids, priorities, arbiters)
//! - Priority-aware elections with pre-vote, backoff and jitter
//! - At most one primary per term; arbiters vote but never lead
//! - Write concern (`majority` or a member count) acknowledged by durable copies
//! - Peer protocol over TCP, or an in-process network for simulations
//! - HTTP API for writes, status and step-down

pub mod api;
pub mod config;
pub mod election;
pub mod error;
pub mod heartbeat;
pub mod network;
pub mod node;
pub mod replication;
pub mod state;
pub mod topology;

pub use config::ReplSetConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ReplSetConfig;
    pub use crate::error::{Error, Result};
    pub use crate::node::{NodeSettings, ReplicaNode};
    pub use crate::replication::{Message, Operation, WriteAck, WriteConcern};
    pub use crate::topology::{MemberId, Term, TopologyDescriptor};
}
