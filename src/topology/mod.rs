//! Topology Module
//!
//! The declared replica-set membership and the observed role and health
//! of every member.

mod descriptor;
mod member;
mod store;

pub use descriptor::{MemberDescriptor, TopologyDescriptor, MAX_MEMBERS, MAX_VOTING_MEMBERS};
pub use member::{Member, MemberHealth, MemberRole};
pub use store::{ProbeFailure, TopologyStore, TopologySummary};

/// Ordinal member identifier (`_id` in the descriptor)
pub type MemberId = u32;

/// Election epoch
pub type Term = u64;
