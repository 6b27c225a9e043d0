//! Linux netdev plugin backed by sysfs.
//!
//! The kernel has no per-port sampler, so enable/disable and rate changes are
//! accepted and logged; every frame the capture backend sees is exported.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

use super::SflowHw;
use crate::error::{SflowError, SflowResult};
use crate::types::{IfIndex, IntfCfgInfo, IntfCounters, NetdevInfo};

const SYSFS_NET: &str = "/sys/class/net";

#[derive(Debug, Clone)]
pub struct LinuxHw {
    root: PathBuf,
}

impl Default for LinuxHw {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxHw {
    pub fn new() -> Self {
        Self::with_root(SYSFS_NET)
    }

    /// Reads netdevs from `root` instead of /sys/class/net.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read_attr(&self, dev: &str, attr: &str) -> SflowResult<String> {
        let path = self.root.join(dev).join(attr);
        let raw = tokio::fs::read_to_string(&path).await?;
        Ok(raw.trim().to_string())
    }

    async fn read_u64(&self, dev: &str, attr: &str) -> SflowResult<u64> {
        let raw = self.read_attr(dev, attr).await?;
        raw.parse().map_err(|e| {
            SflowError::Config(format!(
                "{}: unexpected value '{}': {}",
                self.root.join(dev).join(attr).display(),
                raw,
                e
            ))
        })
    }

    /// Missing statistics files read as zero.
    async fn stat(&self, dev: &str, name: &str) -> u64 {
        self.read_u64(dev, &format!("statistics/{}", name))
            .await
            .unwrap_or(0)
    }
}

fn is_monitorable(name: &str, root: &Path) -> bool {
    // loopback and non-device entries have no statistics to export
    name != "lo" && root.join(name).join("ifindex").exists()
}

#[async_trait]
impl SflowHw for LinuxHw {
    fn name(&self) -> &'static str {
        "linux"
    }

    #[instrument(skip(self))]
    async fn list_monitorable_interfaces(&self) -> SflowResult<Vec<NetdevInfo>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut netdevs = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_monitorable(&name, &self.root) {
                continue;
            }
            let if_index = self.read_u64(&name, "ifindex").await? as IfIndex;
            netdevs.push(NetdevInfo {
                if_index,
                intf_ref: name.clone(),
                netdev_name: name,
            });
        }

        netdevs.sort_by_key(|n| n.if_index);
        debug!(count = netdevs.len(), "Discovered netdevs");
        Ok(netdevs)
    }

    async fn enable_sampling(&self, if_index: IfIndex) -> SflowResult<()> {
        debug!(if_index, "Sampling enabled (software capture)");
        Ok(())
    }

    async fn disable_sampling(&self, if_index: IfIndex) -> SflowResult<()> {
        debug!(if_index, "Sampling disabled (software capture)");
        Ok(())
    }

    async fn set_sampling_rate(&self, if_index: IfIndex, rate: u32) -> SflowResult<()> {
        debug!(if_index, rate, "Sampling rate recorded");
        Ok(())
    }

    async fn interface_counters(&self, intf_ref: &str) -> SflowResult<IntfCounters> {
        let oper = self.read_attr(intf_ref, "operstate").await?;
        let rx_packets = self.stat(intf_ref, "rx_packets").await;
        let tx_packets = self.stat(intf_ref, "tx_packets").await;
        let multicast = self.stat(intf_ref, "multicast").await;

        // the kernel does not split unicast/broadcast, report the remainder as unicast
        Ok(IntfCounters {
            oper_up: oper == "up",
            in_octets: self.stat(intf_ref, "rx_bytes").await,
            in_ucast_pkts: rx_packets.saturating_sub(multicast),
            in_mcast_pkts: multicast,
            in_bcast_pkts: 0,
            in_discards: self.stat(intf_ref, "rx_dropped").await,
            in_errors: self.stat(intf_ref, "rx_errors").await,
            in_unknown_protos: 0,
            out_octets: self.stat(intf_ref, "tx_bytes").await,
            out_ucast_pkts: tx_packets,
            out_mcast_pkts: 0,
            out_bcast_pkts: 0,
            out_discards: self.stat(intf_ref, "tx_dropped").await,
            out_errors: self.stat(intf_ref, "tx_errors").await,
        })
    }

    async fn interface_cfg_info(&self, intf_ref: &str) -> SflowResult<IntfCfgInfo> {
        // speed reads -1 or fails with EINVAL while the link is down
        let speed_mbps = match self.read_attr(intf_ref, "speed").await {
            Ok(raw) => raw.parse::<i64>().unwrap_or(0).max(0) as u64,
            Err(_) => 0,
        };
        let duplex = self.read_attr(intf_ref, "duplex").await.unwrap_or_default();

        Ok(IntfCfgInfo {
            speed: speed_mbps * 1_000_000,
            full_duplex: duplex == "full",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_netdev(root: &Path, name: &str, ifindex: u32) {
        let dev = root.join(name);
        fs::create_dir_all(dev.join("statistics")).unwrap();
        fs::write(dev.join("ifindex"), format!("{}\n", ifindex)).unwrap();
        fs::write(dev.join("operstate"), "up\n").unwrap();
        fs::write(dev.join("speed"), "10000\n").unwrap();
        fs::write(dev.join("duplex"), "full\n").unwrap();
        for (stat, value) in [
            ("rx_bytes", 5000),
            ("rx_packets", 40),
            ("multicast", 4),
            ("tx_bytes", 7000),
            ("tx_packets", 30),
            ("rx_errors", 1),
        ] {
            fs::write(dev.join("statistics").join(stat), format!("{}\n", value)).unwrap();
        }
    }

    #[tokio::test]
    async fn test_list_skips_loopback() {
        let dir = tempfile::tempdir().unwrap();
        fake_netdev(dir.path(), "lo", 1);
        fake_netdev(dir.path(), "eth1", 3);
        fake_netdev(dir.path(), "eth0", 2);

        let hw = LinuxHw::with_root(dir.path());
        let netdevs = hw.list_monitorable_interfaces().await.unwrap();
        let names: Vec<_> = netdevs.iter().map(|n| n.intf_ref.as_str()).collect();
        assert_eq!(names, vec!["eth0", "eth1"]);
        assert_eq!(netdevs[0].if_index, 2);
        assert_eq!(netdevs[0].netdev_name, "eth0");
    }

    #[tokio::test]
    async fn test_counters_and_cfg_info() {
        let dir = tempfile::tempdir().unwrap();
        fake_netdev(dir.path(), "eth0", 2);
        let hw = LinuxHw::with_root(dir.path());

        let ctrs = hw.interface_counters("eth0").await.unwrap();
        assert!(ctrs.oper_up);
        assert_eq!(ctrs.in_octets, 5000);
        assert_eq!(ctrs.in_ucast_pkts, 36);
        assert_eq!(ctrs.in_mcast_pkts, 4);
        assert_eq!(ctrs.in_errors, 1);
        assert_eq!(ctrs.out_discards, 0);

        let cfg = hw.interface_cfg_info("eth0").await.unwrap();
        assert_eq!(cfg.speed, 10_000_000_000);
        assert!(cfg.full_duplex);
    }

    #[tokio::test]
    async fn test_link_down_speed() {
        let dir = tempfile::tempdir().unwrap();
        fake_netdev(dir.path(), "eth0", 2);
        fs::write(dir.path().join("eth0/speed"), "-1\n").unwrap();
        let hw = LinuxHw::with_root(dir.path());
        assert_eq!(hw.interface_cfg_info("eth0").await.unwrap().speed, 0);
    }

    #[tokio::test]
    async fn test_missing_device_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let hw = LinuxHw::with_root(dir.path());
        assert!(hw.interface_counters("eth9").await.is_err());
    }
}
