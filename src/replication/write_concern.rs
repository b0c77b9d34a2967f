//! Write Concern
//!
//! The durability threshold a write must reach before the client is told
//! it succeeded.

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Durability threshold for a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WriteConcern {
    /// Durable on this many data-bearing members (the primary included)
    Nodes(usize),
    /// Durable on more than half of the voting members
    Majority,
}

impl Default for WriteConcern {
    fn default() -> Self {
        WriteConcern::Majority
    }
}

impl WriteConcern {
    /// Acknowledgments needed, or quorum-unavailable when the topology can
    /// never satisfy the concern.
    ///
    /// Only data-bearing members acknowledge. For `Majority` the count is a
    /// strict majority of all voting members (arbiters count towards the
    /// total but cannot acknowledge), taken from data-bearing voters.
    pub fn required_acks(&self, voting_members: usize, data_bearing_voters: usize, data_bearing: usize) -> Result<usize> {
        match *self {
            WriteConcern::Nodes(n) => {
                if n > data_bearing {
                    return Err(Error::QuorumUnavailable {
                        acked: 0,
                        required: n,
                    });
                }
                Ok(n)
            }
            WriteConcern::Majority => {
                let required = voting_members / 2 + 1;
                if required > data_bearing_voters {
                    return Err(Error::QuorumUnavailable {
                        acked: 0,
                        required,
                    });
                }
                Ok(required)
            }
        }
    }

    /// Whether acknowledgments from non-voting members count
    pub fn counts_non_voting(&self) -> bool {
        matches!(self, WriteConcern::Nodes(_))
    }
}

impl fmt::Display for WriteConcern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteConcern::Nodes(n) => write!(f, "{}", n),
            WriteConcern::Majority => write!(f, "majority"),
        }
    }
}

impl FromStr for WriteConcern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("majority") {
            return Ok(WriteConcern::Majority);
        }
        match s.parse::<usize>() {
            Ok(0) => Err(Error::Config("write concern must be at least 1".into())),
            Ok(n) => Ok(WriteConcern::Nodes(n)),
            Err(_) => Err(Error::Config(format!("invalid write concern '{}'", s))),
        }
    }
}

impl TryFrom<String> for WriteConcern {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<WriteConcern> for String {
    fn from(value: WriteConcern) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("majority".parse::<WriteConcern>().unwrap(), WriteConcern::Majority);
        assert_eq!("MAJORITY".parse::<WriteConcern>().unwrap(), WriteConcern::Majority);
        assert_eq!("2".parse::<WriteConcern>().unwrap(), WriteConcern::Nodes(2));
        assert!("0".parse::<WriteConcern>().is_err());
        assert!("all".parse::<WriteConcern>().is_err());
    }

    #[test]
    fn test_majority_with_arbiter() {
        // Two data members and an arbiter: three voters, majority two,
        // both data members must acknowledge.
        assert_eq!(WriteConcern::Majority.required_acks(3, 2, 2).unwrap(), 2);
    }

    #[test]
    fn test_unsatisfiable_concerns() {
        assert!(matches!(
            WriteConcern::Nodes(3).required_acks(3, 2, 2),
            Err(Error::QuorumUnavailable { required: 3, .. })
        ));
        // One data member and two arbiters can never reach a data majority
        assert!(WriteConcern::Majority.required_acks(3, 1, 1).is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&WriteConcern::Majority).unwrap();
        assert_eq!(json, r#""majority""#);
        let back: WriteConcern = serde_json::from_str(r#""1""#).unwrap();
        assert_eq!(back, WriteConcern::Nodes(1));
    }
}
