//! ctlgroup Configuration
//!
//! This module provides configuration structures for a controller group
//! node: its identity, the group it joins, the control process it drives
//! when elected master, and the admin API.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Main ctlgroup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtlGroupConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Group membership configuration
    pub group: GroupConfig,

    /// External control process configuration
    pub control: ControlConfig,

    /// Diagnostics query configuration
    #[serde(default)]
    pub refresh: RefreshConfig,

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
    /// Numeric node identifier; the lowest live id is elected master
    pub id: u64,

    /// Human readable node name
    pub name: String,

    /// Address to bind for unicast group traffic
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Advertised address for other nodes to reach this one
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// Group membership configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Group name; nodes only see members of the same group
    pub name: String,

    /// Multicast group address (ip:port)
    #[serde(default = "default_group_address")]
    pub address: String,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which a member is suspected, in milliseconds
    #[serde(default = "default_suspect_timeout_ms")]
    pub suspect_timeout_ms: u64,

    /// Silence after which a member is dropped from the view, in milliseconds
    #[serde(default = "default_view_timeout_ms")]
    pub view_timeout_ms: u64,

    /// Upper bound on waiting for the first view during start, in milliseconds
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    /// How long a node that sees only itself waits for peers before
    /// electing, in milliseconds (two heartbeat intervals when unset)
    #[serde(default)]
    pub settle_ms: Option<u64>,

    /// Local interface address for multicast traffic
    #[serde(default)]
    pub interface: Option<Ipv4Addr>,
}

/// External control process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Directory containing the controller script
    pub path: PathBuf,

    /// Interpreter used to launch the controller
    #[serde(default = "default_control_program")]
    pub program: String,

    /// Controller entry script, relative to `path`
    #[serde(default = "default_control_script")]
    pub script: String,

    /// Controller components passed on the command line
    #[serde(default)]
    pub components: Vec<String>,
}

/// Diagnostics query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Default collection window for node info queries, in milliseconds
    #[serde(default = "default_refresh_timeout_ms")]
    pub timeout_ms: u64,
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
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:0".to_string()
}

fn default_group_address() -> String {
    "228.8.8.8:45588".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_suspect_timeout_ms() -> u64 {
    3000
}

fn default_view_timeout_ms() -> u64 {
    6000
}

fn default_join_timeout_ms() -> u64 {
    5000
}

fn default_control_program() -> String {
    "python".to_string()
}

fn default_control_script() -> String {
    "pox.py".to_string()
}

fn default_refresh_timeout_ms() -> u64 {
    2000
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

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_refresh_timeout_ms(),
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
        }
    }
}

impl GroupConfig {
    /// Parse the multicast group address
    pub fn socket_addr(&self) -> crate::Result<SocketAddr> {
        self.address.parse().map_err(|e| {
            crate::Error::Config(format!("group.address '{}' is not ip:port: {}", self.address, e))
        })
    }
}

impl CtlGroupConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CtlGroupConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: CtlGroupConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.name.is_empty() {
            return Err(crate::Error::Config("node.name cannot be empty".into()));
        }

        if self.group.name.is_empty() {
            return Err(crate::Error::Config("group.name cannot be empty".into()));
        }

        let group_addr = self.group.socket_addr()?;
        if !group_addr.ip().is_multicast() {
            return Err(crate::Error::Config(format!(
                "group.address {} is not a multicast address",
                group_addr
            )));
        }

        if self.node.bind_address.parse::<SocketAddr>().is_err() {
            return Err(crate::Error::Config(format!(
                "node.bind_address '{}' is not ip:port",
                self.node.bind_address
            )));
        }

        if self.group.heartbeat_interval_ms == 0 {
            return Err(crate::Error::Config("group.heartbeat_interval_ms must be positive".into()));
        }

        if self.group.suspect_timeout_ms <= self.group.heartbeat_interval_ms {
            return Err(crate::Error::Config(
                "group.suspect_timeout_ms must exceed group.heartbeat_interval_ms".into(),
            ));
        }

        if self.group.view_timeout_ms < self.group.suspect_timeout_ms {
            return Err(crate::Error::Config(
                "group.view_timeout_ms cannot be shorter than group.suspect_timeout_ms".into(),
            ));
        }

        if let Some(interface) = self.group.interface {
            if interface.is_multicast() || interface.is_broadcast() {
                return Err(crate::Error::Config(format!(
                    "group.interface {} is not a local interface address",
                    interface
                )));
            }
        }

        if self.control.path.as_os_str().is_empty() {
            return Err(crate::Error::Config("control.path cannot be empty".into()));
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

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.group.heartbeat_interval_ms)
    }

    /// Get suspicion timeout as Duration
    pub fn suspect_timeout(&self) -> Duration {
        Duration::from_millis(self.group.suspect_timeout_ms)
    }

    /// Get view removal timeout as Duration
    pub fn view_timeout(&self) -> Duration {
        Duration::from_millis(self.group.view_timeout_ms)
    }

    /// Get join timeout as Duration
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.group.join_timeout_ms)
    }

    /// Get the single-member settle delay as Duration
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(
            self.group
                .settle_ms
                .unwrap_or_else(|| self.group.heartbeat_interval_ms.saturating_mul(2)),
        )
    }

    /// Get default refresh timeout as Duration
    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh.timeout_ms)
    }
}
