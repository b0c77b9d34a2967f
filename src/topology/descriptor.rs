//! Bootstrap Topology Descriptor
//!
//! The static member list handed to a replica set once, at initiation.
//! Field names follow the initiation payload (`_id`, `arbiterOnly`) so the
//! same document can be read from JSON or embedded in the TOML config.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use super::MemberId;

/// Upper bound on members in one replica set
pub const MAX_MEMBERS: usize = 50;

/// Upper bound on voting members in one replica set
pub const MAX_VOTING_MEMBERS: usize = 7;

/// One member entry of the bootstrap descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDescriptor {
    /// Ordinal member id
    #[serde(rename = "_id")]
    pub id: MemberId,

    /// Address other members use to reach this one (host:port)
    pub host: String,

    /// Election priority; unset means 1 for data members and 0 for arbiters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,

    /// Vote-only member that holds no data
    #[serde(rename = "arbiterOnly", default)]
    pub arbiter_only: bool,

    /// Number of votes (0 or 1)
    #[serde(default = "default_votes")]
    pub votes: u8,
}

fn default_votes() -> u8 {
    1
}

impl MemberDescriptor {
    /// Create a data-bearing, voting member
    pub fn new(id: MemberId, host: impl Into<String>, priority: u32) -> Self {
        Self {
            id,
            host: host.into(),
            priority: Some(priority),
            arbiter_only: false,
            votes: 1,
        }
    }

    /// Create an arbiter
    pub fn arbiter(id: MemberId, host: impl Into<String>) -> Self {
        Self {
            id,
            host: host.into(),
            priority: None,
            arbiter_only: true,
            votes: 1,
        }
    }

    /// Priority with defaults applied
    pub fn effective_priority(&self) -> u32 {
        match self.priority {
            Some(p) => p,
            None if self.arbiter_only => 0,
            None => 1,
        }
    }

    /// Whether this member takes part in elections as a voter
    pub fn is_voting(&self) -> bool {
        self.votes > 0
    }

    /// Whether this member holds a copy of the data
    pub fn is_data_bearing(&self) -> bool {
        !self.arbiter_only
    }

    /// Whether this member may ever become primary.
    ///
    /// Arbiters are never electable, whatever priority they declare.
    pub fn is_electable(&self) -> bool {
        !self.arbiter_only && self.is_voting() && self.effective_priority() > 0
    }
}

/// The replica-set bootstrap descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyDescriptor {
    /// Replica-set identifier
    #[serde(rename = "_id")]
    pub set_name: String,

    /// Declared members, in declaration order
    pub members: Vec<MemberDescriptor>,
}

impl TopologyDescriptor {
    /// Parse a descriptor from JSON text
    pub fn from_json(content: &str) -> Result<Self> {
        let descriptor: TopologyDescriptor = serde_json::from_str(content)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Load a descriptor from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// The three-member layout of a typical bootstrap: a preferred primary,
    /// a secondary and an arbiter.
    pub fn sample() -> Self {
        Self {
            set_name: "rs0".to_string(),
            members: vec![
                MemberDescriptor::new(0, "mongodb-primary:27017", 100),
                MemberDescriptor::new(1, "mongodb-secondary:27017", 10),
                MemberDescriptor::arbiter(2, "mongodb-arbiter:27017"),
            ],
        }
    }

    /// Validate the descriptor
    pub fn validate(&self) -> Result<()> {
        if self.set_name.trim().is_empty() {
            return Err(Error::InvalidTopology("replica set _id cannot be empty".into()));
        }

        if self.members.is_empty() {
            return Err(Error::InvalidTopology("members cannot be empty".into()));
        }

        if self.members.len() > MAX_MEMBERS {
            return Err(Error::InvalidTopology(format!(
                "{} members exceeds the maximum of {}",
                self.members.len(),
                MAX_MEMBERS
            )));
        }

        let mut ids = HashSet::new();
        let mut hosts = HashSet::new();
        for member in &self.members {
            if !ids.insert(member.id) {
                return Err(Error::InvalidTopology(format!(
                    "duplicate member _id {}",
                    member.id
                )));
            }

            if member.host.trim().is_empty() {
                return Err(Error::InvalidTopology(format!(
                    "member {} has an empty host",
                    member.id
                )));
            }

            if !hosts.insert(member.host.as_str()) {
                return Err(Error::InvalidTopology(format!(
                    "duplicate host {}",
                    member.host
                )));
            }

            if member.votes > 1 {
                return Err(Error::InvalidTopology(format!(
                    "member {} has {} votes, only 0 or 1 is allowed",
                    member.id, member.votes
                )));
            }

            if !member.is_voting() && !member.arbiter_only && member.effective_priority() > 0 {
                return Err(Error::InvalidTopology(format!(
                    "non-voting member {} must have priority 0",
                    member.id
                )));
            }

            if member.arbiter_only && member.effective_priority() > 0 {
                tracing::warn!(
                    "Arbiter {} declares priority {}; arbiters are never electable",
                    member.id,
                    member.effective_priority()
                );
            }
        }

        let voting = self.members.iter().filter(|m| m.is_voting()).count();
        if voting == 0 {
            return Err(Error::InvalidTopology("at least one voting member is required".into()));
        }
        if voting > MAX_VOTING_MEMBERS {
            return Err(Error::InvalidTopology(format!(
                "{} voting members exceeds the maximum of {}",
                voting, MAX_VOTING_MEMBERS
            )));
        }

        if !self.members.iter().any(|m| m.is_electable()) {
            return Err(Error::InvalidTopology("no member is electable as primary".into()));
        }

        Ok(())
    }

    /// Look up a member by id
    pub fn member(&self, id: MemberId) -> Option<&MemberDescriptor> {
        self.members.iter().find(|m| m.id == id)
    }

    /// Number of voting members
    pub fn voting_count(&self) -> usize {
        self.members.iter().filter(|m| m.is_voting()).count()
    }

    /// Votes needed for a strict majority
    pub fn majority(&self) -> usize {
        self.voting_count() / 2 + 1
    }
}
