//! Type definitions for sflowd
//!
//! Objects named `Sflow*` mirror what the configuration surface accepts and
//! returns. Numeric fields stay signed there so out-of-range operator input
//! can be represented and rejected by validation. The `*Config` types hold
//! validated values only.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::tables::states::{ADMIN_STATE_DOWN, ADMIN_STATE_UP};

/// Hardware-stable interface handle.
pub type IfIndex = i32;

/// Operator-desired state of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AdminState {
    Up,
    #[default]
    Down,
}

impl AdminState {
    /// Parses "UP" / "DOWN". Anything else is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            ADMIN_STATE_UP => Some(Self::Up),
            ADMIN_STATE_DOWN => Some(Self::Down),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => ADMIN_STATE_UP,
            Self::Down => ADMIN_STATE_DOWN,
        }
    }

    pub fn is_up(&self) -> bool {
        matches!(self, Self::Up)
    }
}

/// Whether an entity's task is actually running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OperState {
    Up,
    #[default]
    Down,
}

impl OperState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => ADMIN_STATE_UP,
            Self::Down => ADMIN_STATE_DOWN,
        }
    }

    pub fn is_up(&self) -> bool {
        matches!(self, Self::Up)
    }
}

/// Global sFlow object as supplied by the configuration surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SflowGlobal {
    /// VRF the agent lives in
    #[serde(default = "default_vrf")]
    pub vrf: String,

    /// "UP" or "DOWN"
    pub admin_state: String,

    /// Agent address placed in every datagram header
    pub agent_ip_addr: String,

    /// Largest captured header to export, in bytes (0..=256)
    #[serde(default = "default_max_sampled_size")]
    pub max_sampled_size: i32,

    /// Counter polling period in seconds, 0 disables polling
    #[serde(default = "default_counter_poll_interval")]
    pub counter_poll_interval: i32,

    /// Largest datagram to send, in bytes (0..=65507, 0 is unlimited)
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: i32,
}

/// Collector object as supplied by the configuration surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SflowCollector {
    /// Collector IP, also its key
    pub ip_addr: String,

    #[serde(default = "default_udp_port")]
    pub udp_port: i32,

    pub admin_state: String,
}

/// Sampled interface object as supplied by the configuration surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SflowIntf {
    /// Operator-facing interface name, resolved to an ifIndex
    pub intf_ref: String,

    pub admin_state: String,

    /// One in N packets is sampled
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: i32,
}

fn default_vrf() -> String {
    "default".to_string()
}

fn default_max_sampled_size() -> i32 {
    128
}

fn default_counter_poll_interval() -> i32 {
    20
}

fn default_max_datagram_size() -> i32 {
    1400
}

fn default_udp_port() -> i32 {
    6343
}

fn default_sampling_rate() -> i32 {
    4096
}

/// Validated global configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalConfig {
    pub vrf: String,
    pub admin_state: AdminState,
    pub agent_address: IpAddr,
    pub max_sampled_size: u32,
    pub counter_poll_interval: u32,
    pub max_datagram_size: u32,
}

impl GlobalConfig {
    /// Converts back to the configuration surface representation.
    pub fn to_object(&self) -> SflowGlobal {
        SflowGlobal {
            vrf: self.vrf.clone(),
            admin_state: self.admin_state.as_str().to_string(),
            agent_ip_addr: self.agent_address.to_string(),
            max_sampled_size: self.max_sampled_size as i32,
            counter_poll_interval: self.counter_poll_interval as i32,
            max_datagram_size: self.max_datagram_size as i32,
        }
    }
}

/// Fields that differ between two global configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlobalUpdateMask(u8);

impl GlobalUpdateMask {
    pub const VRF: Self = Self(0x01);
    pub const ADMIN_STATE: Self = Self(0x02);
    pub const AGENT_ADDRESS: Self = Self(0x04);
    pub const MAX_SAMPLED_SIZE: Self = Self(0x08);
    pub const COUNTER_POLL_INTERVAL: Self = Self(0x10);
    pub const MAX_DATAGRAM_SIZE: Self = Self(0x20);

    /// Computes the mask of fields changed from `old` to `new`.
    pub fn between(old: &GlobalConfig, new: &GlobalConfig) -> Self {
        let mut mask = Self::default();
        if old.vrf != new.vrf {
            mask.insert(Self::VRF);
        }
        if old.admin_state != new.admin_state {
            mask.insert(Self::ADMIN_STATE);
        }
        if old.agent_address != new.agent_address {
            mask.insert(Self::AGENT_ADDRESS);
        }
        if old.max_sampled_size != new.max_sampled_size {
            mask.insert(Self::MAX_SAMPLED_SIZE);
        }
        if old.counter_poll_interval != new.counter_poll_interval {
            mask.insert(Self::COUNTER_POLL_INTERVAL);
        }
        if old.max_datagram_size != new.max_datagram_size {
            mask.insert(Self::MAX_DATAGRAM_SIZE);
        }
        mask
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Validated collector configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorConfig {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub admin_state: AdminState,
}

/// Validated interface configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub if_index: IfIndex,
    pub intf_ref: String,
    pub admin_state: AdminState,
    pub sampling_rate: u32,
}

/// Collector runtime state returned by Get/GetBulk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SflowCollectorState {
    pub ip_addr: String,
    pub oper_state: String,
    pub num_sflow_samples_exported: u64,
    pub num_datagram_exported: u64,
}

/// Interface runtime state returned by Get/GetBulk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SflowIntfState {
    pub intf_ref: String,
    pub oper_state: String,
    pub num_sflow_samples_exported: u64,
}

/// One page of a GetBulk query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkInfo<T> {
    pub items: Vec<T>,
    /// Index to pass as `from_index` for the next page
    pub end_index: usize,
    pub more: bool,
}

impl<T> BulkInfo<T> {
    pub fn count(&self) -> usize {
        self.items.len()
    }
}

/// Monitorable interface as reported by the hardware collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetdevInfo {
    pub if_index: IfIndex,
    /// Operator-facing name (e.g. "Ethernet0")
    pub intf_ref: String,
    /// Kernel device to capture on
    pub netdev_name: String,
}

/// Interface statistics read from hardware at each counter poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntfCounters {
    pub oper_up: bool,
    pub in_octets: u64,
    pub in_ucast_pkts: u64,
    pub in_mcast_pkts: u64,
    pub in_bcast_pkts: u64,
    pub in_discards: u64,
    pub in_errors: u64,
    pub in_unknown_protos: u64,
    pub out_octets: u64,
    pub out_ucast_pkts: u64,
    pub out_mcast_pkts: u64,
    pub out_bcast_pkts: u64,
    pub out_discards: u64,
    pub out_errors: u64,
}

/// Interface link configuration read from hardware at each counter poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntfCfgInfo {
    /// Bits per second
    pub speed: u64,
    pub full_duplex: bool,
}
