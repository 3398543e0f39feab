//! Node configuration
//!
//! Loaded from a single TOML file, with every field optional. Command line
//! flags of the node binary override file values through the `with_*`
//! builders, and [`NodeConfig::validate`] runs before the coordination loop
//! starts.

use crate::error::ConfigError;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default UDP port for the protocol
pub const DEFAULT_PORT: u16 = 10000;

/// Complete node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Intersection identifier, unique in the network and stable across restarts
    pub node_id: NodeId,

    /// Skip persistence and start from a fresh frontier
    pub ephemeral: bool,

    /// Base directory for frontier snapshots and audit logs
    pub data_dir: PathBuf,

    pub transport: TransportConfig,

    pub timing: TimingConfig,

    pub emergency: EmergencyPolicy,
}

/// Broadcast medium parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Local address to receive on
    pub bind: String,

    /// Destinations of every broadcast (subnet broadcast or explicit peers)
    pub peers: Vec<String>,
}

/// Protocol cadences
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Normal rotation period
    pub switch_interval_ms: u64,

    /// Frontier gossip cadence
    pub send_interval_ms: u64,

    /// Fraction of the rotation period an overload holds its road
    pub overload_factor: f64,

    /// Scheduler tick evaluating timers
    pub tick_ms: u64,

    /// Display refresh cadence while a priority state is active
    pub refresh_ms: u64,
}

/// How an emergency ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum EmergencyPolicy {
    /// Emergency expires after a fixed duration, or earlier on a clear event
    Timeout { duration_ms: u64 },
    /// Emergency lasts until an explicit clear event
    ExplicitClear,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            ephemeral: false,
            data_dir: PathBuf::from("./ampel-data"),
            transport: TransportConfig::default(),
            timing: TimingConfig::default(),
            emergency: EmergencyPolicy::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind: format!("0.0.0.0:{}", DEFAULT_PORT),
            peers: vec![format!("255.255.255.255:{}", DEFAULT_PORT)],
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            switch_interval_ms: 12_000,
            send_interval_ms: 2_000,
            overload_factor: 0.5,
            tick_ms: 100,
            refresh_ms: 1_000,
        }
    }
}

impl Default for EmergencyPolicy {
    fn default() -> Self {
        EmergencyPolicy::Timeout {
            duration_ms: 30_000,
        }
    }
}

impl TimingConfig {
    pub fn switch_interval(&self) -> Duration {
        Duration::from_millis(self.switch_interval_ms)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn refresh(&self) -> Duration {
        Duration::from_millis(self.refresh_ms)
    }

    /// How long an overload holds its road
    pub fn overload_hold(&self) -> Duration {
        self.switch_interval().mul_f64(self.overload_factor)
    }
}

impl EmergencyPolicy {
    /// Fixed emergency duration, `None` when only a clear event ends it
    pub fn duration(&self) -> Option<Duration> {
        match self {
            EmergencyPolicy::Timeout { duration_ms } => Some(Duration::from_millis(*duration_ms)),
            EmergencyPolicy::ExplicitClear => None,
        }
    }
}

impl NodeConfig {
    /// Create config with defaults for the given node
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from {:?}", path);

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: NodeConfig = toml::from_str(&content)?;
        debug!("Configuration parsed: {:?}", config);
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Check values before the coordination loop starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::MissingNodeId);
        }

        let intervals = [
            ("switch_interval_ms", self.timing.switch_interval_ms),
            ("send_interval_ms", self.timing.send_interval_ms),
            ("tick_ms", self.timing.tick_ms),
            ("refresh_ms", self.timing.refresh_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ZeroInterval { name });
            }
        }
        if let EmergencyPolicy::Timeout { duration_ms: 0 } = self.emergency {
            return Err(ConfigError::ZeroInterval {
                name: "emergency.duration_ms",
            });
        }

        let factor = self.timing.overload_factor;
        if !(factor > 0.0 && factor <= 1.0) {
            return Err(ConfigError::InvalidOverloadFactor(factor));
        }

        self.bind_addr()?;
        if self.peer_addrs()?.is_empty() {
            return Err(ConfigError::NoPeers);
        }

        if self.timing.send_interval_ms > self.timing.switch_interval_ms {
            warn!(
                "send interval {}ms exceeds switch interval {}ms; peers will lag a full rotation",
                self.timing.send_interval_ms, self.timing.switch_interval_ms
            );
        }

        Ok(())
    }

    /// Parsed local bind address
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr(&self.transport.bind)
    }

    /// Parsed broadcast destinations
    pub fn peer_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.transport.peers.iter().map(|p| parse_addr(p)).collect()
    }

    /// Set node identifier
    pub fn with_node_id(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Set bind address
    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.transport.bind = bind.into();
        self
    }

    /// Replace broadcast destinations
    pub fn with_peers(mut self, peers: Vec<String>) -> Self {
        self.transport.peers = peers;
        self
    }

    /// Set normal rotation period
    pub fn with_switch_interval(mut self, interval: Duration) -> Self {
        self.timing.switch_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set gossip cadence
    pub fn with_send_interval(mut self, interval: Duration) -> Self {
        self.timing.send_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set overload hold fraction
    pub fn with_overload_factor(mut self, factor: f64) -> Self {
        self.timing.overload_factor = factor;
        self
    }

    /// Set emergency policy
    pub fn with_emergency(mut self, policy: EmergencyPolicy) -> Self {
        self.emergency = policy;
        self
    }

    /// Toggle persistence
    pub fn with_ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    /// Set data directory
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }
}

fn parse_addr(s: &str) -> Result<SocketAddr, ConfigError> {
    s.parse()
        .map_err(|_| ConfigError::InvalidSocketAddr(s.to_string()))
}
