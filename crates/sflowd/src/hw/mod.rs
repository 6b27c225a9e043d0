//! Hardware collaborator.
//!
//! Everything sflowd needs from the switch: which interfaces can be sampled,
//! turning sampling on and off, and interface counters for counter samples.
//! The variant is picked once at startup from the daemon configuration.

mod dummy;
mod linux;

pub use dummy::{DummyHw, HwCall};
pub use linux::LinuxHw;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::HwPlugin;
use crate::error::SflowResult;
use crate::types::{IfIndex, IntfCfgInfo, IntfCounters, NetdevInfo};

#[async_trait]
pub trait SflowHw: Send + Sync {
    /// Plugin name for logging.
    fn name(&self) -> &'static str;

    /// Interfaces that may be configured for sampling.
    async fn list_monitorable_interfaces(&self) -> SflowResult<Vec<NetdevInfo>>;

    async fn enable_sampling(&self, if_index: IfIndex) -> SflowResult<()>;

    async fn disable_sampling(&self, if_index: IfIndex) -> SflowResult<()>;

    /// Sets the 1-in-N sampling rate.
    async fn set_sampling_rate(&self, if_index: IfIndex, rate: u32) -> SflowResult<()>;

    async fn interface_counters(&self, intf_ref: &str) -> SflowResult<IntfCounters>;

    async fn interface_cfg_info(&self, intf_ref: &str) -> SflowResult<IntfCfgInfo>;
}

/// Builds the configured hardware plugin.
pub fn create(plugin: HwPlugin) -> Arc<dyn SflowHw> {
    match plugin {
        HwPlugin::Linux => Arc::new(LinuxHw::new()),
        HwPlugin::Dummy => Arc::new(DummyHw::with_ports(8)),
    }
}
