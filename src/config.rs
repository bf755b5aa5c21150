//! Vigil Configuration
//!
//! Configuration structures for the Vigil failover manager.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main Vigil configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VigilConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Database connection configuration
    pub database: DatabaseConfig,

    /// Cluster configuration
    pub cluster: ClusterConfig,

    /// Replication controller configuration
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
    /// Address to bind for cluster communication; also the node's identity
    pub bind_address: String,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Data directory for persisted election metadata
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Start in the administrative IDLE role (staged node)
    #[serde(default)]
    pub start_as_idle: bool,
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// MySQL host
    pub host: String,

    /// MySQL port
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Database user
    pub user: String,

    /// Database password
    pub password: String,

    /// Replication user (handed to the leader-start/stop commands)
    #[serde(default)]
    pub repl_user: String,

    /// Replication password
    #[serde(default)]
    pub repl_password: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// List of peer node addresses
    #[serde(default)]
    pub peers: Vec<String>,

    /// Base election timeout in milliseconds; each attempt draws uniformly
    /// from [election_timeout_ms, 2 * election_timeout_ms)
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,

    /// Leader heartbeat period in milliseconds
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Per-RPC request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Consecutive failed contacts before a peer is marked suspected
    #[serde(default = "default_suspect_threshold")]
    pub suspect_threshold: u32,
}

/// Replication controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Command executed exactly once on acquiring leadership
    #[serde(default)]
    pub leader_start_command: String,

    /// Command executed exactly once on losing leadership
    #[serde(default)]
    pub leader_stop_command: String,

    /// Backup command, run on operator demand
    #[serde(default)]
    pub backup_command: String,

    /// Timeout for external commands in seconds
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// MySQL health probe interval in milliseconds
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Consecutive ping failures before the node is marked degraded
    #[serde(default = "default_max_ping_failures")]
    pub max_ping_failures: u32,

    /// Binlog purge interval in milliseconds
    #[serde(default = "default_purge_interval_ms")]
    pub purge_binlog_interval_ms: u64,

    /// Disable the binlog purge loop
    #[serde(default)]
    pub purge_binlog_disabled: bool,
}

/// API configuration
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

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_db_port() -> u16 {
    3306
}

fn default_pool_size() -> u32 {
    5
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_election_timeout_ms() -> u64 {
    3000
}

fn default_heartbeat_timeout_ms() -> u64 {
    1000
}

fn default_request_timeout_ms() -> u64 {
    1000
}

fn default_suspect_threshold() -> u32 {
    3
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_ping_interval_ms() -> u64 {
    1000
}

fn default_max_ping_failures() -> u32 {
    3
}

fn default_purge_interval_ms() -> u64 {
    300_000
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

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/vigil")
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            leader_start_command: String::new(),
            leader_stop_command: String::new(),
            backup_command: String::new(),
            command_timeout_secs: default_command_timeout_secs(),
            ping_interval_ms: default_ping_interval_ms(),
            max_ping_failures: default_max_ping_failures(),
            purge_binlog_interval_ms: default_purge_interval_ms(),
            purge_binlog_disabled: false,
        }
    }
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
            format: default_log_format(),
            file: None,
        }
    }
}

impl VigilConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: VigilConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: VigilConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.database.host.is_empty() {
            return Err(crate::Error::Config("database.host cannot be empty".into()));
        }

        if self.cluster.election_timeout_ms < self.cluster.heartbeat_timeout_ms * 2 {
            return Err(crate::Error::Config(
                "cluster.election_timeout_ms must be at least twice cluster.heartbeat_timeout_ms".into(),
            ));
        }

        for peer in &self.cluster.peers {
            if peer.is_empty() {
                return Err(crate::Error::Config("cluster.peers contains an empty address".into()));
            }
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the state directory path
    pub fn state_dir(&self) -> PathBuf {
        self.node.data_dir.join("state")
    }

    /// Get election timeout as Duration
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.election_timeout_ms)
    }

    /// Get heartbeat period as Duration
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_timeout_ms)
    }

    /// Get per-RPC timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.request_timeout_ms)
    }

    /// Get health probe interval as Duration
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.replication.ping_interval_ms)
    }

    /// Get binlog purge interval as Duration
    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.replication.purge_binlog_interval_ms)
    }

    /// Get external command timeout as Duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.replication.command_timeout_secs)
    }

    /// Get database connection URL
    pub fn database_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}",
            self.database.user, self.database.password, self.database.host, self.database.port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
bind_address = "10.0.0.1:7650"
data_dir = "/var/lib/vigil"

[database]
host = "localhost"
port = 3306
user = "vigil"
password = "secret"
repl_user = "repl"
repl_password = "replsecret"

[cluster]
peers = ["10.0.0.2:7650", "10.0.0.3:7650"]
election_timeout_ms = 3000
heartbeat_timeout_ms = 1000

[replication]
leader_start_command = "/usr/local/bin/leader-start.sh"
leader_stop_command = "/usr/local/bin/leader-stop.sh"
"#;

        let config = VigilConfig::from_str(toml).unwrap();
        assert_eq!(config.node.bind_address, "10.0.0.1:7650");
        assert_eq!(config.cluster.peers.len(), 2);
        assert!(!config.node.start_as_idle);
        assert_eq!(config.replication.max_ping_failures, 3);
        assert_eq!(config.heartbeat_timeout(), Duration::from_millis(1000));
    }

    #[test]
    fn test_rejects_tight_election_timeout() {
        let toml = r#"
[node]
bind_address = "10.0.0.1:7650"

[database]
host = "localhost"
user = "vigil"
password = "secret"

[cluster]
election_timeout_ms = 1000
heartbeat_timeout_ms = 1000
"#;

        assert!(VigilConfig::from_str(toml).is_err());
    }
}
