//! Kafka Runner Configuration
//!
//! The configuration file names the ZooKeeper ensemble and the cluster, plus
//! optional tuning for coordination, election, supervision and the broker launch.
//! The broker count, heap size and ports come from the command line and are
//! combined with the file into a [`ClusterConfig`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// ZooKeeper endpoints (host:port)
    pub zk_hosts: Vec<String>,

    /// Cluster name, used as the namespace root `/kafka-<cluster>`
    pub cluster: String,

    /// Coordination session configuration
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Election configuration
    #[serde(default)]
    pub election: ElectionConfig,

    /// Supervision configuration
    #[serde(default)]
    pub supervision: SupervisionConfig,

    /// Broker launch configuration
    #[serde(default)]
    pub launch: LaunchConfig,
}

/// Coordination session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Pause between closing an expired session and reconnecting
    #[serde(default = "default_reconnect_cooldown")]
    pub reconnect_cooldown_secs: u64,

    /// Path under which brokers register their ids
    #[serde(default = "default_registry_path")]
    pub registry_path: String,
}

/// Election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Length of one jitter unit in milliseconds; the backoff draws from
    /// `[0, broker_count)` units
    #[serde(default = "default_jitter_unit_ms")]
    pub jitter_unit_ms: u64,
}

/// Supervision configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisionConfig {
    /// Minimum spacing between two broker launches in seconds
    #[serde(default = "default_flap_threshold")]
    pub flap_threshold_secs: u64,
}

/// Broker launch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Liquid template for the broker's server.properties
    #[serde(default = "default_template")]
    pub template: PathBuf,

    /// Rendered configuration path
    #[serde(default = "default_output")]
    pub output: PathBuf,

    /// Distribution archive unpacked before the first launch
    #[serde(default = "default_archive")]
    pub archive: Option<PathBuf>,

    /// Shell command that runs the broker
    #[serde(default = "default_command")]
    pub command: String,

    /// Value exported as SCALA_VERSION
    #[serde(default = "default_scala_version")]
    pub scala_version: String,

    /// log4j configuration file handed to the broker
    #[serde(default = "default_log4j_config")]
    pub log4j_config: String,
}

// Default value functions
fn default_connect_timeout() -> u64 {
    5
}

fn default_reconnect_cooldown() -> u64 {
    10
}

fn default_registry_path() -> String {
    "/brokers/ids".to_string()
}

fn default_jitter_unit_ms() -> u64 {
    1000
}

fn default_flap_threshold() -> u64 {
    120
}

fn default_template() -> PathBuf {
    PathBuf::from("server.properties.liquid")
}

fn default_output() -> PathBuf {
    PathBuf::from("server.properties")
}

fn default_archive() -> Option<PathBuf> {
    Some(PathBuf::from("kafka-exec.tar.xz"))
}

fn default_command() -> String {
    "./kafka-exec/bin/kafka-run-class.sh -name kafkaServer -loggc kafka.Kafka server.properties"
        .to_string()
}

fn default_scala_version() -> String {
    "2.10.3".to_string()
}

fn default_log4j_config() -> String {
    "log4j.properties".to_string()
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            reconnect_cooldown_secs: default_reconnect_cooldown(),
            registry_path: default_registry_path(),
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            jitter_unit_ms: default_jitter_unit_ms(),
        }
    }
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            flap_threshold_secs: default_flap_threshold(),
        }
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            template: default_template(),
            output: default_output(),
            archive: default_archive(),
            command: default_command(),
            scala_version: default_scala_version(),
            log4j_config: default_log4j_config(),
        }
    }
}

impl RunnerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: RunnerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.zk_hosts.is_empty() {
            return Err(crate::Error::Config("zk_hosts cannot be empty".into()));
        }

        if self.zk_hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(crate::Error::Config("zk_hosts cannot contain empty entries".into()));
        }

        if self.cluster.is_empty() || self.cluster.contains('/') {
            return Err(crate::Error::Config(
                "cluster must be a non-empty name without '/'".into(),
            ));
        }

        if !self.coordination.registry_path.starts_with('/') {
            return Err(crate::Error::Config(
                "coordination.registry_path must be absolute".into(),
            ));
        }

        if self.launch.command.trim().is_empty() {
            return Err(crate::Error::Config("launch.command cannot be empty".into()));
        }

        Ok(())
    }

    /// Namespace root for this cluster
    pub fn namespace(&self) -> String {
        format!("/kafka-{}", self.cluster)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.coordination.connect_timeout_secs)
    }

    /// Get reconnect cooldown as Duration
    pub fn reconnect_cooldown(&self) -> Duration {
        Duration::from_secs(self.coordination.reconnect_cooldown_secs)
    }

    /// Get one jitter unit as Duration
    pub fn jitter_unit(&self) -> Duration {
        Duration::from_millis(self.election.jitter_unit_ms)
    }

    /// Get the flap threshold as Duration
    pub fn flap_threshold(&self) -> Duration {
        Duration::from_secs(self.supervision.flap_threshold_secs)
    }

    /// Combine with the broker count from the command line
    pub fn cluster_config(&self, broker_count: u32) -> crate::Result<ClusterConfig> {
        ClusterConfig::new(self.zk_hosts.clone(), self.cluster.clone(), broker_count)
    }
}

/// What the runner knows about the cluster it joins. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Ordered ZooKeeper endpoints
    pub endpoints: Vec<String>,
    /// Cluster name
    pub name: String,
    /// Total number of broker slots
    pub broker_count: u32,
}

impl ClusterConfig {
    /// Create a cluster configuration
    pub fn new(endpoints: Vec<String>, name: String, broker_count: u32) -> crate::Result<Self> {
        if broker_count == 0 {
            return Err(crate::Error::Config("broker count must be greater than 0".into()));
        }
        Ok(Self {
            endpoints,
            name,
            broker_count,
        })
    }

    /// Namespace root (ZooKeeper chroot) for this cluster
    pub fn namespace(&self) -> String {
        format!("/kafka-{}", self.name)
    }

    /// ZooKeeper connect string including the chroot, as handed to Kafka
    pub fn zk_connect(&self) -> String {
        format!("{}{}", self.endpoints.join(","), self.namespace())
    }
}

/// Parse the comma separated port list. At least two ports are required because
/// the second one is the JMX port.
pub fn parse_ports(list: &str) -> crate::Result<Vec<u16>> {
    let ports = list
        .split(',')
        .map(|p| {
            p.trim()
                .parse::<u16>()
                .map_err(|e| crate::Error::Config(format!("invalid port {:?}: {}", p, e)))
        })
        .collect::<crate::Result<Vec<u16>>>()?;

    if ports.len() < 2 {
        return Err(crate::Error::Config(format!(
            "expected at least 2 ports, got {}",
            ports.len()
        )));
    }

    Ok(ports)
}
