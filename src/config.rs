//! ExamFleet Configuration
//!
//! Configuration structures for exam nodes and the load balancer.
//! Every process reads the same TOML layout; the balancer only needs
//! the `[balancer]` table.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Main ExamFleet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration (peers and election timing)
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Clock synchronization configuration
    #[serde(default)]
    pub clock: ClockConfig,

    /// Node HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Initial exam settings served by this node
    #[serde(default)]
    pub exam: ExamDefaults,

    /// Load balancer configuration (balancer process only)
    #[serde(default)]
    pub balancer: Option<BalancerConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Address to bind for cluster communication
    pub bind_address: String,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Bully priority, higher is more senior
    #[serde(default)]
    pub priority: i64,
}

/// A statically configured peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub address: String,
    pub priority: i64,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Expected number of exam servers in the cluster
    #[serde(default = "default_server_count")]
    pub server_count: usize,

    /// Known peers
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Election timeout in milliseconds
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Timeout for a single peer call in milliseconds
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,
}

/// Clock synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockConfig {
    /// Interval between coordinator rounds in milliseconds
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Timeout for a single time request in milliseconds
    #[serde(default = "default_peer_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Node HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Initial exam settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamDefaults {
    #[serde(default = "default_exam_title")]
    pub title: String,

    /// Exam duration in seconds
    #[serde(default = "default_exam_duration")]
    pub duration_secs: u64,

    /// Maximum concurrent sessions
    #[serde(default = "default_exam_capacity")]
    pub capacity: usize,
}

/// A backend exam server known to the balancer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    /// Base URL, e.g. `http://10.0.0.1:6001`
    pub url: String,
}

/// Load balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Client-facing bind address
    #[serde(default = "default_balancer_address")]
    pub bind_address: String,

    /// Backends in routing order
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    #[serde(default = "default_peer_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,

    #[serde(default = "default_configure_timeout_ms")]
    pub configure_timeout_ms: u64,
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
}

// Default value functions
fn default_server_count() -> usize {
    3
}

fn default_election_timeout_ms() -> u64 {
    5000
}

fn default_heartbeat_interval_ms() -> u64 {
    2000
}

fn default_peer_timeout_ms() -> u64 {
    2000
}

fn default_sync_interval_ms() -> u64 {
    5000
}

fn default_health_check_interval_ms() -> u64 {
    10_000
}

fn default_forward_timeout_ms() -> u64 {
    5000
}

fn default_configure_timeout_ms() -> u64 {
    4000
}

fn default_api_address() -> String {
    "0.0.0.0:6001".to_string()
}

fn default_balancer_address() -> String {
    "0.0.0.0:5555".to_string()
}

fn default_exam_title() -> String {
    "Java Basics Exam".to_string()
}

fn default_exam_duration() -> u64 {
    60
}

fn default_exam_capacity() -> usize {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            server_count: default_server_count(),
            peers: Vec::new(),
            election_timeout_ms: default_election_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            peer_timeout_ms: default_peer_timeout_ms(),
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: default_sync_interval_ms(),
            request_timeout_ms: default_peer_timeout_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for ExamDefaults {
    fn default() -> Self {
        Self {
            title: default_exam_title(),
            duration_secs: default_exam_duration(),
            capacity: default_exam_capacity(),
        }
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_balancer_address(),
            backends: Vec::new(),
            health_check_interval_ms: default_health_check_interval_ms(),
            probe_timeout_ms: default_peer_timeout_ms(),
            forward_timeout_ms: default_forward_timeout_ms(),
            configure_timeout_ms: default_configure_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl BalancerConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    pub fn configure_timeout(&self) -> Duration {
        Duration::from_millis(self.configure_timeout_ms)
    }

    /// Validate the balancer section
    pub fn validate(&self) -> crate::Result<()> {
        if self.backends.is_empty() {
            return Err(crate::Error::Config("balancer.backends cannot be empty".into()));
        }
        let mut ids = HashSet::new();
        for backend in &self.backends {
            if backend.url.is_empty() {
                return Err(crate::Error::Config(format!(
                    "backend {} has an empty url",
                    backend.id
                )));
            }
            if !ids.insert(backend.id.as_str()) {
                return Err(crate::Error::Config(format!(
                    "duplicate backend id {}",
                    backend.id
                )));
            }
        }
        Ok(())
    }
}

impl FleetConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.cluster.election_timeout_ms == 0 || self.cluster.heartbeat_interval_ms == 0 {
            return Err(crate::Error::Config(
                "cluster timeouts must be greater than zero".into(),
            ));
        }

        if self.clock.sync_interval_ms == 0 {
            return Err(crate::Error::Config("clock.sync_interval_ms must be greater than zero".into()));
        }

        // Priorities are a total order across the cluster
        let mut priorities = HashSet::from([self.node.priority]);
        let mut ids = HashSet::from([self.node.id.as_str()]);
        for peer in &self.cluster.peers {
            if !ids.insert(peer.id.as_str()) {
                return Err(crate::Error::Config(format!("duplicate node id {}", peer.id)));
            }
            if !priorities.insert(peer.priority) {
                return Err(crate::Error::Config(format!(
                    "peer {} reuses priority {}",
                    peer.id, peer.priority
                )));
            }
        }

        if let Some(balancer) = &self.balancer {
            balancer.validate()?;
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

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.election_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.peer_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.clock.sync_interval_ms)
    }

    pub fn clock_request_timeout(&self) -> Duration {
        Duration::from_millis(self.clock.request_timeout_ms)
    }

    /// Get the balancer section or fail
    pub fn balancer(&self) -> crate::Result<&BalancerConfig> {
        self.balancer
            .as_ref()
            .ok_or_else(|| crate::Error::Config("missing [balancer] section".into()))
    }

    /// Sample configuration written by `examfleet init`
    pub fn sample(node_id: &str) -> String {
        format!(
            r#"# ExamFleet node configuration

[node]
id = "{node_id}"
bind_address = "0.0.0.0:7700"
# advertise_address = "10.0.0.1:7700"
priority = 3

[cluster]
server_count = 3
election_timeout_ms = 5000
heartbeat_interval_ms = 2000
peer_timeout_ms = 2000

# [[cluster.peers]]
# id = "S2"
# address = "10.0.0.2:7700"
# priority = 2

[clock]
sync_interval_ms = 5000
request_timeout_ms = 2000

[api]
bind_address = "0.0.0.0:6001"

[exam]
title = "Java Basics Exam"
duration_secs = 60
capacity = 2

# Only read by `examfleet balancer`
# [balancer]
# bind_address = "0.0.0.0:5555"
# health_check_interval_ms = 10000
# [[balancer.backends]]
# id = "S1"
# url = "http://10.0.0.1:6001"

[logging]
level = "info"
format = "pretty"
"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[node]
id = "S1"
bind_address = "0.0.0.0:7700"
priority = 3

[cluster]
election_timeout_ms = 1000

[[cluster.peers]]
id = "S2"
address = "10.0.0.2:7700"
priority = 2

[[cluster.peers]]
id = "S3"
address = "10.0.0.3:7700"
priority = 1

[balancer]
[[balancer.backends]]
id = "S1"
url = "http://10.0.0.1:6001"
"#;

    #[test]
    fn test_parse_config() {
        let config = FleetConfig::from_str(CONFIG).unwrap();
        assert_eq!(config.node.id, "S1");
        assert_eq!(config.cluster.peers.len(), 2);
        assert_eq!(config.election_timeout(), Duration::from_millis(1000));
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(2000));
        assert_eq!(config.sync_interval(), Duration::from_secs(5));
        assert_eq!(config.advertise_address(), "0.0.0.0:7700");

        let balancer = config.balancer().unwrap();
        assert_eq!(balancer.health_check_interval(), Duration::from_secs(10));
        assert_eq!(balancer.bind_address, "0.0.0.0:5555");
    }

    #[test]
    fn test_duplicate_priority_rejected() {
        let toml = r#"
[node]
id = "S1"
bind_address = "0.0.0.0:7700"
priority = 2

[[cluster.peers]]
id = "S2"
address = "10.0.0.2:7700"
priority = 2
"#;
        assert!(matches!(
            FleetConfig::from_str(toml),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config = FleetConfig::from_str(&FleetConfig::sample("S9")).unwrap();
        assert_eq!(config.node.id, "S9");
        assert!(config.balancer.is_none());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("examfleet.toml");
        std::fs::write(&path, CONFIG).unwrap();

        let config = FleetConfig::from_file(&path).unwrap();
        assert_eq!(config.cluster.peers[1].id, "S3");
    }
}
