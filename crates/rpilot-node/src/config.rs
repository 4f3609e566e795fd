//! Node configuration, loaded from TOML.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a working single-host setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rpilot_network::TcpOptions;
use rpilot_protocol::{
    Address, DEFAULT_BROADCAST_INTERVAL_MS, DEFAULT_BROADCAST_ROUNDS,
    DEFAULT_DIRECTED_INTERVAL_MS, DEFAULT_DIRECTED_ROUNDS, DEFAULT_RETRY_BUDGET,
    DEFAULT_RETRY_INTERVAL_MS,
};

use crate::dispatch::{DEFAULT_DRAIN_TIMEOUT, DEFAULT_MAX_IN_FLIGHT};
use crate::outbox::RetryPolicy;
use crate::registry::DiscoverySchedule;
use crate::terminal::{TerminalSettings, DEFAULT_EVENT_CAPACITY};
use crate::NodeError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: NetworkConfig,
    pub pilot: PilotConfig,
    pub delivery: DeliveryConfig,
    pub discovery: DiscoveryConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host the Terminal binds on and Pilots connect to.
    pub terminal_host: String,
    pub broadcast_port: u16,
    pub funnel_port: u16,
    /// Local intake port, always bound on 127.0.0.1.
    pub intake_port: u16,
    /// Per-connection send/receive queue length.
    pub queue_capacity: usize,
    pub reconnect_delay_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            terminal_host: "127.0.0.1".to_string(),
            broadcast_port: 5560,
            funnel_port: 5561,
            intake_port: 5562,
            queue_capacity: 1024,
            reconnect_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotConfig {
    pub name: String,
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            name: "pilot".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub retry_interval_ms: u64,
    pub retry_budget: i64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub broadcast_rounds: u32,
    pub broadcast_interval_ms: u64,
    pub directed_rounds: u32,
    pub directed_interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            broadcast_rounds: DEFAULT_BROADCAST_ROUNDS,
            broadcast_interval_ms: DEFAULT_BROADCAST_INTERVAL_MS,
            directed_rounds: DEFAULT_DIRECTED_ROUNDS,
            directed_interval_ms: DEFAULT_DIRECTED_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_in_flight: usize,
    pub event_capacity: usize,
    /// Shutdown wait for running handlers.
    pub drain_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT.as_millis() as u64,
        }
    }
}

impl NodeConfig {
    /// `<config dir>/rpilot/node.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("rpilot").join("node.toml"))
    }

    pub fn load(path: &Path) -> Result<Self, NodeError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, NodeError> {
        toml::from_str(text).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Load `path` if given, else the default path if it exists, else the
    /// built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, NodeError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(default) if default.exists() => Self::load(&default),
            _ => {
                tracing::info!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn pilot_name(&self) -> Result<Address, NodeError> {
        Ok(Address::new(self.pilot.name.clone())?)
    }

    pub fn broadcast_addr(&self) -> String {
        format!("{}:{}", self.network.terminal_host, self.network.broadcast_port)
    }

    pub fn funnel_addr(&self) -> String {
        format!("{}:{}", self.network.terminal_host, self.network.funnel_port)
    }

    pub fn intake_addr(&self) -> String {
        format!("127.0.0.1:{}", self.network.intake_port)
    }

    pub fn tcp_options(&self) -> TcpOptions {
        TcpOptions {
            queue_capacity: self.network.queue_capacity,
            reconnect_delay: Duration::from_millis(self.network.reconnect_delay_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.delivery.retry_interval_ms),
            budget: self.delivery.retry_budget,
        }
    }

    pub fn discovery_schedule(&self) -> DiscoverySchedule {
        DiscoverySchedule {
            broadcast_rounds: self.discovery.broadcast_rounds,
            broadcast_interval: Duration::from_millis(self.discovery.broadcast_interval_ms),
            directed_rounds: self.discovery.directed_rounds,
            directed_interval: Duration::from_millis(self.discovery.directed_interval_ms),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch.drain_timeout_ms)
    }

    pub fn terminal_settings(&self) -> TerminalSettings {
        TerminalSettings {
            retry: self.retry_policy(),
            discovery: self.discovery_schedule(),
            max_in_flight: self.dispatch.max_in_flight,
            drain_timeout: self.drain_timeout(),
            event_capacity: self.dispatch.event_capacity,
        }
    }
}
