//! replset Configuration
//!
//! This module provides the configuration structures for one replica-set
//! member process.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::election::ElectionConfig;
use crate::error::{Error, Result};
use crate::heartbeat::HeartbeatConfig;
use crate::node::NodeSettings;
use crate::replication::ReplicationConfig;
use crate::topology::{MemberId, TopologyDescriptor};

/// Main replset configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplSetConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Inline bootstrap descriptor
    #[serde(default)]
    pub replica_set: Option<TopologyDescriptor>,

    /// Heartbeat configuration
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Election configuration
    #[serde(default)]
    pub election: ElectionConfig,

    /// Replication configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This member's `_id` in the descriptor
    pub member_id: MemberId,

    /// Address to bind for the peer protocol
    pub bind_address: String,

    /// Data directory for election state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// JSON bootstrap descriptor, used when `[replica_set]` is absent
    #[serde(default)]
    pub bootstrap_file: Option<PathBuf>,
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/replset")
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl std::str::FromStr for ReplSetConfig {
    type Err = Error;

    /// Load configuration from a TOML string
    fn from_str(content: &str) -> Result<Self> {
        let config: ReplSetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

impl ReplSetConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        content.parse()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.node.bind_address.is_empty() {
            return Err(Error::Config("node.bind_address cannot be empty".into()));
        }

        match (&self.replica_set, &self.node.bootstrap_file) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "set either [replica_set] or node.bootstrap_file, not both".into(),
                ))
            }
            (None, None) => {
                return Err(Error::Config(
                    "no bootstrap descriptor: add [replica_set] or node.bootstrap_file".into(),
                ))
            }
            (Some(descriptor), None) => self.check_descriptor(descriptor)?,
            (None, Some(_)) => {}
        }

        if self.heartbeat.interval_ms == 0 {
            return Err(Error::Config("heartbeat.interval_ms must be positive".into()));
        }
        if self.heartbeat.timeout_ms == 0 {
            return Err(Error::Config("heartbeat.timeout_ms must be positive".into()));
        }
        if self.heartbeat.failure_threshold == 0 {
            return Err(Error::Config("heartbeat.failure_threshold must be at least 1".into()));
        }

        if self.election.timeout_min_ms == 0 || self.election.timeout_min_ms > self.election.timeout_max_ms {
            return Err(Error::Config(format!(
                "election timeout range {}..{} ms is invalid",
                self.election.timeout_min_ms, self.election.timeout_max_ms
            )));
        }
        if self.election.vote_timeout_ms == 0 {
            return Err(Error::Config("election.vote_timeout_ms must be positive".into()));
        }
        if self.election.max_attempts == 0 {
            return Err(Error::Config("election.max_attempts must be at least 1".into()));
        }
        if self.election.backoff_base_ms > self.election.backoff_max_ms {
            return Err(Error::Config("election.backoff_base_ms exceeds backoff_max_ms".into()));
        }

        if self.replication.max_batch_entries == 0 {
            return Err(Error::Config("replication.max_batch_entries must be positive".into()));
        }
        if self.replication.ship_interval_ms == 0 {
            return Err(Error::Config("replication.ship_interval_ms must be positive".into()));
        }
        if self.replication.write_timeout_ms == 0 {
            return Err(Error::Config("replication.write_timeout_ms must be positive".into()));
        }

        Ok(())
    }

    fn check_descriptor(&self, descriptor: &TopologyDescriptor) -> Result<()> {
        descriptor.validate()?;
        if descriptor.member(self.node.member_id).is_none() {
            return Err(Error::Config(format!(
                "node.member_id {} is not declared in replica set {}",
                self.node.member_id, descriptor.set_name
            )));
        }
        Ok(())
    }

    /// Resolve the bootstrap descriptor, inline or from file
    pub fn descriptor(&self) -> Result<TopologyDescriptor> {
        let descriptor = match (&self.replica_set, &self.node.bootstrap_file) {
            (Some(descriptor), _) => descriptor.clone(),
            (None, Some(path)) => TopologyDescriptor::from_file(path)?,
            (None, None) => {
                return Err(Error::Config("no bootstrap descriptor configured".into()))
            }
        };
        self.check_descriptor(&descriptor)?;
        Ok(descriptor)
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Tunables handed to the replica node
    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            heartbeat: self.heartbeat.clone(),
            election: self.election.clone(),
            replication: self.replication.clone(),
        }
    }

    /// Sample configuration for one member of the `rs0` set
    pub fn sample(member_id: MemberId) -> Self {
        let descriptor = TopologyDescriptor::sample();
        let port = descriptor
            .member(member_id)
            .and_then(|m| m.host.rsplit(':').next())
            .unwrap_or("27017")
            .to_string();

        Self {
            node: NodeConfig {
                member_id,
                bind_address: format!("0.0.0.0:{}", port),
                data_dir: default_data_dir(),
                bootstrap_file: None,
            },
            replica_set: Some(descriptor),
            heartbeat: HeartbeatConfig::default(),
            election: ElectionConfig::default(),
            replication: ReplicationConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::WriteConcern;

    const CONFIG: &str = r#"
[node]
member_id = 1
bind_address = "0.0.0.0:27017"
data_dir = "/var/lib/replset"

[replica_set]
_id = "rs0"

[[replica_set.members]]
_id = 0
host = "mongodb-primary:27017"
priority = 100

[[replica_set.members]]
_id = 1
host = "mongodb-secondary:27017"
priority = 10

[[replica_set.members]]
_id = 2
host = "mongodb-arbiter:27017"
arbiterOnly = true

[heartbeat]
interval_ms = 250

[replication]
default_write_concern = "1"
"#;

    #[test]
    fn test_parse_config() {
        let config: ReplSetConfig = CONFIG.parse().unwrap();
        assert_eq!(config.node.member_id, 1);
        assert_eq!(config.heartbeat.interval_ms, 250);
        assert_eq!(config.heartbeat.failure_threshold, 3);
        assert_eq!(config.replication.default_write_concern, WriteConcern::Nodes(1));
        assert!(config.api.enabled);

        let descriptor = config.descriptor().unwrap();
        assert_eq!(descriptor, TopologyDescriptor::sample());
        assert_eq!(descriptor.majority(), 2);
    }

    #[test]
    fn test_member_must_be_declared() {
        let toml = CONFIG.replace("member_id = 1", "member_id = 5");
        let err = toml.parse::<ReplSetConfig>().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_requires_descriptor() {
        let toml = r#"
[node]
member_id = 0
bind_address = "0.0.0.0:27017"
"#;
        assert!(matches!(toml.parse::<ReplSetConfig>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_inverted_election_timeout() {
        let toml = format!("{}\n[election]\ntimeout_min_ms = 3000\ntimeout_max_ms = 1000\n", CONFIG);
        assert!(matches!(toml.parse::<ReplSetConfig>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_zero_timeouts() {
        let toml = format!("{}\n[election]\nvote_timeout_ms = 0\n", CONFIG);
        let err = toml.parse::<ReplSetConfig>().unwrap_err();
        assert!(err.to_string().contains("vote_timeout_ms"));

        let toml = CONFIG.replace(
            "default_write_concern = \"1\"",
            "default_write_concern = \"1\"\nwrite_timeout_ms = 0",
        );
        let err = toml.parse::<ReplSetConfig>().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("write_timeout_ms"));
    }

    #[test]
    fn test_descriptor_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rs0.json");
        std::fs::write(&path, TopologyDescriptor::sample().to_json().unwrap()).unwrap();

        let toml = format!(
            "[node]\nmember_id = 2\nbind_address = \"0.0.0.0:27017\"\nbootstrap_file = {:?}\n",
            path.display().to_string()
        );
        let config: ReplSetConfig = toml.parse().unwrap();
        let descriptor = config.descriptor().unwrap();
        assert!(descriptor.member(2).unwrap().arbiter_only);
    }

    #[test]
    fn test_sample_round_trips() {
        let rendered = ReplSetConfig::sample(0).to_toml().unwrap();
        let config: ReplSetConfig = rendered.parse().unwrap();
        assert_eq!(config.node.member_id, 0);
        assert_eq!(config.descriptor().unwrap().set_name, "rs0");
    }
}
