//! Configuration file support for sflowd
//!
//! Loads and validates daemon configuration from TOML files.
//! Default location: /etc/sonic/sflowd.toml
//!
//! The `[startup]` section carries sFlow objects applied through the
//! configuration surface once the daemon is up.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::error::{SflowError, SflowResult};
use crate::tables::queues;
use crate::types::{SflowCollector, SflowGlobal, SflowIntf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sonic/sflowd.toml";

/// Hardware collaborator variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwPlugin {
    /// Linux netdevs via sysfs
    Linux,
    /// In-memory stand-in with no hardware behind it
    Dummy,
}

/// Packet capture variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    /// AF_PACKET raw socket per device
    Afpacket,
    /// In-process channels, nothing captured
    Channel,
}

/// Daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Default log filter, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_hw_plugin")]
    pub hw_plugin: HwPlugin,

    #[serde(default = "default_capture_backend")]
    pub capture_backend: CaptureKind,
}

/// Mailbox capacities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Interface tasks to Aggregation (per record kind)
    #[serde(default = "default_intf_record")]
    pub intf_record: usize,

    /// Encoder changes and stats requests into Aggregation
    #[serde(default = "default_aggregation_control")]
    pub aggregation_control: usize,

    /// Aggregation to Fan-out
    #[serde(default = "default_dgram_ready")]
    pub dgram_ready: usize,

    /// Fan-out to each collector
    #[serde(default = "default_collector")]
    pub collector: usize,

    /// Registration, receipts and termination into Fan-out
    #[serde(default = "default_fanout_control")]
    pub fanout_control: usize,

    /// Configuration requests into the server loop
    #[serde(default = "default_server_request")]
    pub server_request: usize,
}

/// Objects applied after bootstrap
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupConfig {
    #[serde(default)]
    pub global: Option<SflowGlobal>,

    #[serde(default)]
    pub collectors: Vec<SflowCollector>,

    #[serde(default)]
    pub interfaces: Vec<SflowIntf>,
}

/// Complete sflowd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SflowdConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub queues: QueueConfig,

    #[serde(default)]
    pub startup: StartupConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_hw_plugin() -> HwPlugin {
    HwPlugin::Linux
}

fn default_capture_backend() -> CaptureKind {
    CaptureKind::Afpacket
}

fn default_intf_record() -> usize {
    queues::INTF_RECORD_QUEUE_SIZE
}

fn default_aggregation_control() -> usize {
    queues::AGGREGATION_CONTROL_QUEUE_SIZE
}

fn default_dgram_ready() -> usize {
    queues::DGRAM_READY_QUEUE_SIZE
}

fn default_collector() -> usize {
    queues::COLLECTOR_QUEUE_SIZE
}

fn default_fanout_control() -> usize {
    queues::FANOUT_CONTROL_QUEUE_SIZE
}

fn default_server_request() -> usize {
    queues::SERVER_REQUEST_QUEUE_SIZE
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            hw_plugin: default_hw_plugin(),
            capture_backend: default_capture_backend(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            intf_record: default_intf_record(),
            aggregation_control: default_aggregation_control(),
            dgram_ready: default_dgram_ready(),
            collector: default_collector(),
            fanout_control: default_fanout_control(),
            server_request: default_server_request(),
        }
    }
}

impl SflowdConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> SflowResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                SflowError::Config(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(SflowError::Io(e)),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> SflowResult<()> {
        let q = &self.queues;
        let sizes = [
            ("intf_record", q.intf_record),
            ("aggregation_control", q.aggregation_control),
            ("dgram_ready", q.dgram_ready),
            ("collector", q.collector),
            ("fanout_control", q.fanout_control),
            ("server_request", q.server_request),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, size)| *size == 0) {
            return Err(SflowError::Config(format!("queues.{} must be > 0", name)));
        }
        Ok(())
    }
}
