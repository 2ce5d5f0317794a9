//! Fleet configuration file (`simfleet.toml`).
//!
//! ```toml
//! [timeouts]
//! device = 600
//!
//! [[nodes]]
//! host = "mac-01.internal"
//! user = "ci"
//! public_host = "mac-01.example.com"
//! kind = "simulators"
//! capacity = 6
//! concurrent_boots = 3
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Backend variant of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Pool of simulators created on demand.
    #[default]
    Simulators,
    /// Physically attached devices from the allowlist.
    Devices,
    /// Pool of emulators started from pre-built images.
    Emulators,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simulators => f.write_str("simulators"),
            Self::Devices => f.write_str("devices"),
            Self::Emulators => f.write_str("emulators"),
        }
    }
}

/// One unit a node is allowed to hand out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownDevice {
    pub serial: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFlags {
    /// Boot units without a visible window.
    #[serde(default = "default_true")]
    pub headless: bool,
    /// Where clean unit backups are kept on the node.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
}

impl Default for NodeFlags {
    fn default() -> Self {
        Self {
            headless: true,
            backup_dir: default_backup_dir(),
        }
    }
}

/// Descriptor of one worker machine. Identity is the public host name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Login user for SSH. Empty means the current user.
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub public_host: Option<String>,
    #[serde(default)]
    pub kind: NodeKind,
    /// Maximum number of devices hosted concurrently.
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// Width of the node's boot pool.
    #[serde(default = "default_concurrent_boots")]
    pub concurrent_boots: u32,
    #[serde(default)]
    pub devices: Vec<KnownDevice>,
    #[serde(default)]
    pub flags: NodeFlags,
    /// Common environment overlaid on every command run on this node.
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl NodeConfig {
    /// Config for a node at `host` with defaults everywhere else.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: String::new(),
            public_host: None,
            kind: NodeKind::default(),
            capacity: default_capacity(),
            concurrent_boots: default_concurrent_boots(),
            devices: Vec::new(),
            flags: NodeFlags::default(),
            environment: HashMap::new(),
        }
    }

    pub fn with_kind(mut self, kind: NodeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_public_host(mut self, public_host: impl Into<String>) -> Self {
        self.public_host = Some(public_host.into());
        self
    }

    /// Host name clients use to reach devices on this node.
    pub fn public_host(&self) -> &str {
        self.public_host.as_deref().unwrap_or(&self.host)
    }

    /// Whether commands run on this machine without SSH.
    pub fn is_local(&self) -> bool {
        matches!(self.host.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

/// Port pool range, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 41798,
            end: 42507,
        }
    }
}

/// Loop intervals and thresholds of the orchestrator itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_sixty")]
    pub registration_interval_secs: u64,
    #[serde(default = "default_sixty")]
    pub node_check_interval_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_health_check_attempts: u32,
    #[serde(default = "default_sixty")]
    pub zombie_reap_interval_secs: u64,
    #[serde(default = "default_sixty")]
    pub max_reclaim_sleep_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            registration_interval_secs: 60,
            node_check_interval_secs: 60,
            max_health_check_attempts: default_max_attempts(),
            zombie_reap_interval_secs: 60,
            max_reclaim_sleep_secs: 60,
        }
    }
}

impl OrchestratorConfig {
    pub fn registration_interval(&self) -> Duration {
        Duration::from_secs(self.registration_interval_secs)
    }

    pub fn node_check_interval(&self) -> Duration {
        Duration::from_secs(self.node_check_interval_secs)
    }

    pub fn zombie_reap_interval(&self) -> Duration {
        Duration::from_secs(self.zombie_reap_interval_secs)
    }

    pub fn max_reclaim_sleep(&self) -> Duration {
        Duration::from_secs(self.max_reclaim_sleep_secs)
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FleetConfig {
    /// Named timeout overrides in seconds.
    #[serde(default)]
    pub timeouts: HashMap<String, u64>,
    #[serde(default)]
    pub ports: PortRange,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Lease timeout. `None` means leases never expire.
    pub fn device_timeout(&self) -> Option<Duration> {
        self.timeout("device")
    }

    pub fn timeout(&self, name: &str) -> Option<Duration> {
        self.timeouts.get(name).copied().map(Duration::from_secs)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.ports.start > self.ports.end {
            return Err(ConfigError::Invalid(format!(
                "port range {}..={} is empty",
                self.ports.start, self.ports.end
            )));
        }
        if self.orchestrator.max_health_check_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_health_check_attempts must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            let public_host = node.public_host();
            if !seen.insert(public_host.to_string()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate node public host: {public_host}"
                )));
            }
            if node.capacity == 0 {
                return Err(ConfigError::Invalid(format!(
                    "node {public_host}: capacity must be greater than zero"
                )));
            }
            if node.concurrent_boots == 0 {
                return Err(ConfigError::Invalid(format!(
                    "node {public_host}: concurrent_boots must be greater than zero"
                )));
            }
            if node.kind == NodeKind::Devices && node.devices.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "node {public_host}: a devices node needs a known-device allowlist"
                )));
            }
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_capacity() -> u32 {
    6
}

fn default_concurrent_boots() -> u32 {
    3
}

fn default_sixty() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    6
}

fn default_backup_dir() -> String {
    "/var/tmp/simfleet/backups".to_string()
}
