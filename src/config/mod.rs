use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::io::Cursor;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Node ID type used by openraft
pub type NodeId = u64;

/// Opaque payload of one log entry: a JSON-encoded `Command`.
///
/// The bytes are only decoded by the state machine, so a malformed entry can
/// be skipped there instead of failing log deserialization.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Proposal(pub Vec<u8>);

/// Outcome of applying one log entry, returned to the proposing node
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum KvResponse {
    /// The command was applied to local storage.
    Applied,
    /// The entry could not be decoded and was skipped.
    Ignored,
    /// The command was valid but storage rejected it.
    Failed { error: String },
}

/// Raft peer information: the address serving both the HTTP API and raft RPC
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Node {
    pub addr: String,
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Node {{ addr: {} }}", self.addr)
    }
}

/// A voting participant as announced on the wire (`{"ID": .., "Address": ..}`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterMember {
    #[serde(rename = "ID")]
    pub id: String,
    pub address: String,
}

impl ClusterMember {
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            address: address.into(),
        }
    }

    /// Parse the textual ID back into a raft node id
    pub fn node_id(&self) -> Result<NodeId, crate::KvError> {
        self.id
            .parse()
            .map_err(|e| crate::KvError::InvalidMember(format!("ID {:?}: {}", self.id, e)))
    }
}

openraft::declare_raft_types!(
    pub TypeConfig:
        D = Proposal,
        R = KvResponse,
        Node = Node,
);

/// Complete node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvConfig {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub raft: RaftConfig,
    pub cluster: ClusterConfig,
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Raft node id; generated and persisted in the data directory when unset
    pub id: Option<NodeId>,
    /// Bind address of the HTTP server (client API and raft RPC)
    pub listen_addr: SocketAddr,
    /// `host:port` other nodes use to reach this one; defaults to `listen_addr`
    pub advertise_addr: Option<String>,
    /// Data directory for persistent storage
    pub data_dir: PathBuf,
    /// Leader to join at startup (`host:port` or `http://host:port`)
    pub leader: Option<String>,
}

/// Data file configuration
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// How long to wait for the data file lock before giving up
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub lock_timeout: Duration,
    /// Delay between lock attempts
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub lock_retry_interval: Duration,
}

/// Raft-specific configuration
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Heartbeat interval
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub heartbeat_interval: Duration,
    /// Minimum election timeout
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub election_timeout_min: Duration,
    /// Maximum election timeout
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub election_timeout_max: Duration,
    /// Number of applied entries after which a snapshot is built
    pub snapshot_after_entries: u64,
    /// Log entries kept after a snapshot so lagging followers can catch up
    pub logs_to_keep: u64,
}

/// Membership and request handling configuration
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Delay before announcing ourselves to a leader
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub join_warmup: Duration,
    /// Bound on adding a voter, including its catch-up
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub join_timeout: Duration,
    /// Bound on waiting for a proposed command to be committed and applied
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub apply_timeout: Duration,
    /// Timeout for requests forwarded to the leader
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub forward_timeout: Duration,
    /// A new leader forces a snapshot with probability 1/snapshot_chance
    pub snapshot_chance: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty, compact)
    pub format: LogFormat,
    /// Include event targets in output
    pub structured: bool,
    /// Enable ANSI colors in output
    pub enable_colors: bool,
}

/// Log output format
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            advertise_addr: None,
            data_dir: PathBuf::from("/tmp/kv"),
            leader: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(5),
            lock_retry_interval: Duration::from_millis(1),
        }
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(250),
            election_timeout_min: Duration::from_millis(299),
            election_timeout_max: Duration::from_millis(500),
            snapshot_after_entries: 1000,
            logs_to_keep: 1000,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            join_warmup: Duration::from_secs(10),
            join_timeout: Duration::from_secs(60),
            apply_timeout: Duration::from_secs(60),
            forward_timeout: Duration::from_secs(65),
            snapshot_chance: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            structured: false,
            enable_colors: true,
        }
    }
}

impl NodeConfig {
    /// Address advertised to peers and written into the raft membership
    pub fn advertise(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.listen_addr.to_string())
    }

    pub fn data_file(&self) -> PathBuf {
        self.data_dir.join("data.json")
    }

    pub fn raft_dir(&self) -> PathBuf {
        self.data_dir.join("raft")
    }

    /// Resolve this node's id, generating and persisting one on first start
    pub fn resolve_id(&self) -> Result<NodeId, ConfigError> {
        if let Some(id) = self.id {
            return Ok(id);
        }

        let path = self.data_dir.join("node_id");
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            return content.trim().parse().map_err(|e| {
                ConfigError::Validation(format!("Invalid node id in {}: {}", path.display(), e))
            });
        }

        // Kept within i64 so the id survives TOML round-trips
        let id = rand::thread_rng().gen_range(1..=i64::MAX as NodeId);
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::write(&path, id.to_string())?;
        Ok(id)
    }
}

/// Configuration loading and management
impl KvConfig {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;

        let config: Self =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.id == Some(0) {
            return Err(ConfigError::Validation("Node ID cannot be 0".to_string()));
        }

        if self.raft.election_timeout_min >= self.raft.election_timeout_max {
            return Err(ConfigError::Validation(
                "Election timeout min must be less than max".to_string(),
            ));
        }

        if self.storage.lock_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "Lock timeout must be greater than zero".to_string(),
            ));
        }

        if self.cluster.snapshot_chance == 0 {
            return Err(ConfigError::Validation(
                "Snapshot chance must be at least 1".to_string(),
            ));
        }

        if let Some(addr) = &self.node.advertise_addr {
            if !addr.contains(':') {
                return Err(ConfigError::Validation(format!(
                    "Advertise address must be host:port, got {addr}"
                )));
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            )));
        }

        Ok(())
    }

    /// Get default configuration file paths
    pub fn default_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("ferrokv.toml"),
            PathBuf::from("config/ferrokv.toml"),
            PathBuf::from("/etc/ferrokv/config.toml"),
        ];

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("ferrokv").join("config.toml"));
        }

        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".ferrokv.toml"));
        }

        paths
    }

    /// Find and load configuration file from default locations
    pub fn load_default() -> Result<Self, ConfigError> {
        for path in Self::default_config_paths() {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Ok(Self::default())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Build the openraft configuration from the config struct
pub fn create_raft_config(config: &RaftConfig) -> openraft::Config {
    openraft::Config {
        heartbeat_interval: config.heartbeat_interval.as_millis() as u64,
        election_timeout_min: config.election_timeout_min.as_millis() as u64,
        election_timeout_max: config.election_timeout_max.as_millis() as u64,
        snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(config.snapshot_after_entries),
        max_in_snapshot_log_to_keep: config.logs_to_keep,
        ..Default::default()
    }
}

#[cfg(test)]
mod test;
