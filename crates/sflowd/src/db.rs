//! Shared configuration and entity state.
//!
//! One [`SflowDb`] sits behind a single `parking_lot::RwLock`. Lifecycle
//! managers take the write lock for mutations, queries and the Aggregation
//! loop take the read lock. The lock is never held across an `.await`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::encoder::EncodeLimits;
use crate::error::{SflowError, SflowResult};
use crate::types::{
    CollectorConfig, GlobalConfig, IfIndex, InterfaceConfig, NetdevInfo, OperState,
};

pub type SharedDb = Arc<RwLock<SflowDb>>;

/// Counters shared between an entity entry and its running task.
#[derive(Debug, Default)]
pub struct ExportStats {
    oper_up: AtomicBool,
    samples: AtomicU64,
    datagrams: AtomicU64,
}

impl ExportStats {
    pub fn set_oper(&self, state: OperState) {
        self.oper_up.store(state.is_up(), Ordering::Release);
    }

    pub fn oper_state(&self) -> OperState {
        if self.oper_up.load(Ordering::Acquire) {
            OperState::Up
        } else {
            OperState::Down
        }
    }

    pub fn add_samples(&self, n: u64) {
        self.samples.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_datagram(&self) {
        self.datagrams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn datagrams(&self) -> u64 {
        self.datagrams.load(Ordering::Relaxed)
    }
}

/// Handle to a running per-entity task.
#[derive(Debug)]
pub struct TaskHandle {
    pub cancel: CancellationToken,
    pub join: JoinHandle<()>,
}

impl TaskHandle {
    /// Signals shutdown and waits for the task to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        // A panicked task has already exited, nothing left to wait for
        let _ = self.join.await;
    }
}

#[derive(Debug)]
pub struct CollectorEntry {
    pub config: CollectorConfig,
    pub stats: Arc<ExportStats>,
    pub task: Option<TaskHandle>,
}

impl CollectorEntry {
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            config,
            stats: Arc::new(ExportStats::default()),
            task: None,
        }
    }

    /// Fan-out identifier for this collector.
    pub fn collector_id(&self) -> String {
        self.config.ip.to_string()
    }
}

/// Running interface task plus its counter-poll control.
#[derive(Debug)]
pub struct InterfaceTask {
    pub handle: TaskHandle,
    pub poll_interval: watch::Sender<u32>,
}

#[derive(Debug)]
pub struct InterfaceEntry {
    pub config: InterfaceConfig,
    pub stats: Arc<ExportStats>,
    pub task: Option<InterfaceTask>,
}

impl InterfaceEntry {
    pub fn new(config: InterfaceConfig) -> Self {
        Self {
            config,
            stats: Arc::new(ExportStats::default()),
            task: None,
        }
    }
}

/// Insertion-ordered keys backing GetBulk pagination.
#[derive(Debug, Clone)]
pub struct KeyCache<K> {
    keys: Vec<K>,
}

impl<K> Default for KeyCache<K> {
    fn default() -> Self {
        Self { keys: Vec::new() }
    }
}

impl<K: PartialEq + Clone> KeyCache<K> {
    pub fn push(&mut self, key: K) {
        self.keys.push(key);
    }

    pub fn remove(&mut self, key: &K) {
        self.keys.retain(|k| k != key);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// Returns the keys for one page plus `(end_index, more)`.
    pub fn page(&self, from_index: usize, count: usize) -> SflowResult<(&[K], usize, bool)> {
        if count == 0 {
            return Err(SflowError::InvalidArgument(
                "GetBulk count must be greater than zero".to_string(),
            ));
        }
        if from_index > self.keys.len() {
            return Err(SflowError::InvalidArgument(format!(
                "GetBulk fromIndex {} out of range, {} entries configured",
                from_index,
                self.keys.len()
            )));
        }

        let end = from_index.saturating_add(count).min(self.keys.len());
        Ok((&self.keys[from_index..end], end, end < self.keys.len()))
    }
}

#[derive(Debug, Default)]
pub struct SflowDb {
    pub global: Option<GlobalConfig>,
    /// Set when interface discovery failed at startup
    pub bootstrap_failed: bool,
    pub netdevs: HashMap<IfIndex, NetdevInfo>,
    pub collectors: HashMap<IpAddr, CollectorEntry>,
    pub collector_keys: KeyCache<IpAddr>,
    pub interfaces: HashMap<IfIndex, InterfaceEntry>,
    pub interface_keys: KeyCache<IfIndex>,
}

impl SflowDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_shared(self) -> SharedDb {
        Arc::new(RwLock::new(self))
    }

    /// Replaces the netdev map from a hardware discovery.
    pub fn set_netdevs(&mut self, netdevs: Vec<NetdevInfo>) {
        self.netdevs = netdevs.into_iter().map(|n| (n.if_index, n)).collect();
    }

    pub fn resolve_intf_ref(&self, intf_ref: &str) -> Option<IfIndex> {
        self.netdevs
            .values()
            .find(|n| n.intf_ref == intf_ref)
            .map(|n| n.if_index)
    }

    pub fn global_admin_up(&self) -> bool {
        self.global.as_ref().is_some_and(|g| g.admin_state.is_up())
    }

    /// Limits the Aggregation loop applies to each record.
    pub fn encode_limits(&self) -> Option<EncodeLimits> {
        self.global.as_ref().map(|g| EncodeLimits {
            max_sampled_size: g.max_sampled_size,
            max_datagram_size: g.max_datagram_size,
        })
    }

    pub fn sampling_rate(&self, if_index: IfIndex) -> Option<u32> {
        self.interfaces
            .get(&if_index)
            .map(|e| e.config.sampling_rate)
    }

    pub fn insert_collector(&mut self, entry: CollectorEntry) {
        let ip = entry.config.ip;
        self.collectors.insert(ip, entry);
        self.collector_keys.push(ip);
    }

    pub fn remove_collector(&mut self, ip: &IpAddr) -> Option<CollectorEntry> {
        let entry = self.collectors.remove(ip)?;
        self.collector_keys.remove(ip);
        Some(entry)
    }

    pub fn insert_interface(&mut self, entry: InterfaceEntry) {
        let if_index = entry.config.if_index;
        self.interfaces.insert(if_index, entry);
        self.interface_keys.push(if_index);
    }

    pub fn remove_interface(&mut self, if_index: IfIndex) -> Option<InterfaceEntry> {
        let entry = self.interfaces.remove(&if_index)?;
        self.interface_keys.remove(&if_index);
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AdminState;

    fn collector(ip: &str) -> CollectorEntry {
        CollectorEntry::new(CollectorConfig {
            ip: ip.parse().unwrap(),
            udp_port: 6343,
            admin_state: AdminState::Up,
        })
    }

    #[test]
    fn test_key_cache_follows_map() {
        let mut db = SflowDb::new();
        db.insert_collector(collector("10.0.0.1"));
        db.insert_collector(collector("10.0.0.2"));
        db.insert_collector(collector("10.0.0.3"));

        db.remove_collector(&"10.0.0.2".parse().unwrap());
        let keys: Vec<String> = db.collector_keys.keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["10.0.0.1", "10.0.0.3"]);
        assert_eq!(db.collectors.len(), db.collector_keys.len());

        assert!(db.remove_collector(&"10.0.0.2".parse().unwrap()).is_none());
        assert_eq!(db.collector_keys.len(), 2);
    }

    #[test]
    fn test_page_bounds() {
        let mut cache = KeyCache::default();
        for k in 0..5 {
            cache.push(k);
        }

        let (keys, end, more) = cache.page(0, 2).unwrap();
        assert_eq!((keys, end, more), (&[0, 1][..], 2, true));

        let (keys, end, more) = cache.page(4, 2).unwrap();
        assert_eq!((keys, end, more), (&[4][..], 5, false));

        let (keys, end, more) = cache.page(5, 2).unwrap();
        assert!(keys.is_empty());
        assert_eq!((end, more), (5, false));

        assert!(cache.page(6, 1).is_err());
        assert!(cache.page(0, 0).is_err());
    }

    #[test]
    fn test_empty_cache_first_page() {
        let cache: KeyCache<i32> = KeyCache::default();
        let (keys, end, more) = cache.page(0, 10).unwrap();
        assert!(keys.is_empty());
        assert_eq!((end, more), (0, false));
    }

    #[test]
    fn test_resolve_intf_ref() {
        let mut db = SflowDb::new();
        db.set_netdevs(vec![NetdevInfo {
            if_index: 17,
            intf_ref: "Ethernet4".into(),
            netdev_name: "eth4".into(),
        }]);
        assert_eq!(db.resolve_intf_ref("Ethernet4"), Some(17));
        assert_eq!(db.resolve_intf_ref("Ethernet8"), None);
    }

    #[test]
    fn test_export_stats() {
        let stats = ExportStats::default();
        assert_eq!(stats.oper_state(), OperState::Down);
        stats.set_oper(OperState::Up);
        stats.add_samples(3);
        stats.add_datagram();
        assert_eq!(stats.oper_state(), OperState::Up);
        assert_eq!((stats.samples(), stats.datagrams()), (3, 1));
    }
}
