//! Datagram store and reference table.
//!
//! Owned by the Fan-out loop alone. A datagram stays in the store exactly
//! while its reference set is non-empty.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use super::{CollectorId, DatagramKey, TransmitReceipt};
use crate::encoder::Datagram;
use crate::types::IfIndex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub published: u64,
    pub retired: u64,
    /// Collector ids removed from reference sets, by receipt or termination
    pub reference_removals: u64,
}

/// Result of applying a transmit receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Other collectors still owe a receipt
    Pending,
    /// Last reference dropped, datagram freed
    Retired,
    /// No outstanding reference for this (key, collector)
    Unknown,
}

#[derive(Debug, Default)]
pub struct DatagramLedger {
    store: HashMap<IfIndex, BTreeMap<u64, Arc<Datagram>>>,
    refs: HashMap<DatagramKey, HashSet<CollectorId>>,
    stats: LedgerStats,
}

impl DatagramLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a datagram delivered to `recipients`. With no recipients the
    /// datagram is retired on the spot and never enters the store.
    pub fn publish(
        &mut self,
        key: DatagramKey,
        datagram: Arc<Datagram>,
        recipients: HashSet<CollectorId>,
    ) -> bool {
        self.stats.published += 1;
        if recipients.is_empty() {
            self.stats.retired += 1;
            return false;
        }

        self.store
            .entry(key.if_index)
            .or_default()
            .insert(key.seq, datagram);
        self.refs.insert(key, recipients);
        true
    }

    /// Drops one collector's reference on one datagram.
    pub fn acknowledge(&mut self, receipt: &TransmitReceipt) -> AckOutcome {
        let Some(pending) = self.refs.get_mut(&receipt.key) else {
            return AckOutcome::Unknown;
        };
        if !pending.remove(&receipt.collector_id) {
            return AckOutcome::Unknown;
        }
        self.stats.reference_removals += 1;

        if pending.is_empty() {
            self.retire(receipt.key);
            AckOutcome::Retired
        } else {
            AckOutcome::Pending
        }
    }

    /// Drops every reference held by a terminated collector. Returns the
    /// number of datagrams retired as a result.
    pub fn release_collector(&mut self, collector_id: &str) -> usize {
        let mut emptied = Vec::new();
        for (key, pending) in self.refs.iter_mut() {
            if pending.remove(collector_id) {
                self.stats.reference_removals += 1;
                if pending.is_empty() {
                    emptied.push(*key);
                }
            }
        }

        for key in &emptied {
            self.retire(*key);
        }
        emptied.len()
    }

    fn retire(&mut self, key: DatagramKey) {
        self.refs.remove(&key);
        if let Some(per_intf) = self.store.get_mut(&key.if_index) {
            per_intf.remove(&key.seq);
            if per_intf.is_empty() {
                self.store.remove(&key.if_index);
            }
        }
        self.stats.retired += 1;
    }

    #[cfg(test)]
    pub fn contains(&self, key: &DatagramKey) -> bool {
        self.store
            .get(&key.if_index)
            .is_some_and(|m| m.contains_key(&key.seq))
    }

    #[cfg(test)]
    pub fn get(&self, key: &DatagramKey) -> Option<Arc<Datagram>> {
        self.store.get(&key.if_index)?.get(&key.seq).cloned()
    }

    #[cfg(test)]
    pub fn pending_for(&self, key: &DatagramKey) -> Option<&HashSet<CollectorId>> {
        self.refs.get(key)
    }

    /// Datagrams currently held.
    pub fn stored(&self) -> usize {
        self.store.values().map(BTreeMap::len).sum()
    }

    pub fn outstanding_references(&self) -> usize {
        self.refs.values().map(HashSet::len).sum()
    }

    pub fn stats(&self) -> LedgerStats {
        self.stats
    }

    /// True when the store and reference table describe the same key set.
    #[cfg(test)]
    pub fn is_consistent(&self) -> bool {
        self.refs.len() == self.stored()
            && self.refs.iter().all(|(k, v)| !v.is_empty() && self.contains(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn dgram() -> Arc<Datagram> {
        Arc::new(Datagram {
            bytes: vec![0; 8],
            num_samples: 1,
        })
    }

    fn key(if_index: IfIndex, seq: u64) -> DatagramKey {
        DatagramKey { if_index, seq }
    }

    fn ids(names: &[&str]) -> HashSet<CollectorId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn receipt(k: DatagramKey, id: &str) -> TransmitReceipt {
        TransmitReceipt {
            key: k,
            collector_id: id.to_string(),
        }
    }

    #[test]
    fn test_zero_recipients_retired_immediately() {
        let mut ledger = DatagramLedger::new();
        for seq in 0..50 {
            assert!(!ledger.publish(key(1, seq), dgram(), HashSet::new()));
        }
        assert_eq!(ledger.stored(), 0);
        assert_eq!(ledger.stats().retired, 50);
        assert!(ledger.is_consistent());
    }

    #[test]
    fn test_retired_only_after_every_receipt() {
        let mut ledger = DatagramLedger::new();
        let k = key(3, 0);
        ledger.publish(k, dgram(), ids(&["a", "b", "c"]));

        assert_eq!(ledger.acknowledge(&receipt(k, "a")), AckOutcome::Pending);
        assert_eq!(ledger.acknowledge(&receipt(k, "c")), AckOutcome::Pending);
        assert!(ledger.contains(&k));
        assert_eq!(ledger.pending_for(&k), Some(&ids(&["b"])));

        assert_eq!(ledger.acknowledge(&receipt(k, "b")), AckOutcome::Retired);
        assert!(!ledger.contains(&k));
        assert!(ledger.pending_for(&k).is_none());
        assert!(ledger.is_consistent());
    }

    #[test]
    fn test_duplicate_and_stray_receipts_ignored() {
        let mut ledger = DatagramLedger::new();
        let k = key(3, 0);
        ledger.publish(k, dgram(), ids(&["a", "b"]));

        assert_eq!(ledger.acknowledge(&receipt(k, "a")), AckOutcome::Pending);
        assert_eq!(ledger.acknowledge(&receipt(k, "a")), AckOutcome::Unknown);
        assert_eq!(ledger.acknowledge(&receipt(k, "z")), AckOutcome::Unknown);
        assert_eq!(ledger.acknowledge(&receipt(key(3, 9), "a")), AckOutcome::Unknown);
        assert!(ledger.contains(&k));
        assert_eq!(ledger.stats().reference_removals, 1);
    }

    #[test]
    fn test_receipt_then_termination_retires() {
        let mut ledger = DatagramLedger::new();
        let k = key(5, 1);
        ledger.publish(k, dgram(), ids(&["a", "b"]));

        assert_eq!(ledger.acknowledge(&receipt(k, "a")), AckOutcome::Pending);
        assert!(ledger.contains(&k));

        assert_eq!(ledger.release_collector("b"), 1);
        assert!(!ledger.contains(&k));
        assert_eq!(ledger.stats().reference_removals, 2);
        assert!(ledger.is_consistent());
    }

    #[test]
    fn test_termination_only_touches_that_collector() {
        let mut ledger = DatagramLedger::new();
        ledger.publish(key(1, 0), dgram(), ids(&["a", "b"]));
        ledger.publish(key(1, 1), dgram(), ids(&["b"]));
        ledger.publish(key(2, 2), dgram(), ids(&["a"]));

        assert_eq!(ledger.release_collector("b"), 1);
        assert!(ledger.contains(&key(1, 0)));
        assert!(!ledger.contains(&key(1, 1)));
        assert!(ledger.contains(&key(2, 2)));
        assert_eq!(ledger.outstanding_references(), 2);

        assert_eq!(ledger.release_collector("b"), 0);
        assert_eq!(ledger.release_collector("a"), 2);
        assert_eq!(ledger.stored(), 0);
        assert!(ledger.is_consistent());
    }
}
