//! Aggregation loop: records in, keyed datagrams out.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    AggregationEvent, CounterSampleRecord, DatagramInfo, DatagramKey, FlowSampleRecord,
};
use crate::db::SharedDb;
use crate::encoder::{Datagram, DatagramEncoder};
use crate::error::CodecError;
use crate::types::IfIndex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationStats {
    pub flow_records: u64,
    pub counter_records: u64,
    pub published: u64,
    pub encode_failures: u64,
    /// First record per interface, dropped after priming the store slot
    pub priming_drops: u64,
    /// Records for interfaces no longer configured
    pub stale_records: u64,
    pub next_seq: u64,
}

pub struct AggregationLoop {
    db: SharedDb,
    encoder: DatagramEncoder,
    flow_rx: mpsc::Receiver<FlowSampleRecord>,
    counter_rx: mpsc::Receiver<CounterSampleRecord>,
    events_rx: mpsc::Receiver<AggregationEvent>,
    ready_tx: mpsc::Sender<DatagramInfo>,
    /// Interfaces whose store slot exists
    primed: HashSet<IfIndex>,
    next_seq: u64,
    stats: AggregationStats,
    cancel: CancellationToken,
}

impl AggregationLoop {
    pub fn new(
        db: SharedDb,
        flow_rx: mpsc::Receiver<FlowSampleRecord>,
        counter_rx: mpsc::Receiver<CounterSampleRecord>,
        events_rx: mpsc::Receiver<AggregationEvent>,
        ready_tx: mpsc::Sender<DatagramInfo>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            db,
            encoder: DatagramEncoder::new(),
            flow_rx,
            counter_rx,
            events_rx,
            ready_tx,
            primed: HashSet::new(),
            next_seq: 0,
            stats: AggregationStats::default(),
            cancel,
        }
    }

    pub async fn run(mut self) {
        debug!("Aggregation loop started");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Some(record) = self.flow_rx.recv() => {
                    self.stats.flow_records += 1;
                    let if_index = record.if_index;
                    let encoded = self.encode_flow(&record);
                    if !self.publish(if_index, encoded).await {
                        break;
                    }
                }
                Some(record) = self.counter_rx.recv() => {
                    self.stats.counter_records += 1;
                    let if_index = record.if_index;
                    let encoded = self.encode_counter(&record);
                    if !self.publish(if_index, encoded).await {
                        break;
                    }
                }
                else => break,
            }
        }

        info!(
            published = self.stats.published,
            failures = self.stats.encode_failures,
            "Aggregation loop stopped"
        );
    }

    fn handle_event(&mut self, event: AggregationEvent) {
        match event {
            AggregationEvent::AgentAddress(addr) => self.encoder.rebind(addr),
            AggregationEvent::ClearEncoder => {
                debug!("GlobalConfig removed, encoder cleared");
                self.encoder.clear();
            }
            AggregationEvent::Stats(reply) => {
                let mut stats = self.stats;
                stats.next_seq = self.next_seq;
                let _ = reply.send(stats);
            }
        }
    }

    /// Reads the tunables and encodes. `None` means the record is dropped.
    fn encode_flow(&mut self, record: &FlowSampleRecord) -> Option<Result<Datagram, CodecError>> {
        let (limits, rate) = {
            let db = self.db.read();
            (db.encode_limits(), db.sampling_rate(record.if_index))
        };
        let Some(rate) = rate else {
            self.stats.stale_records += 1;
            debug!(if_index = record.if_index, "Flow record for unconfigured interface dropped");
            return None;
        };
        let Some(limits) = limits else {
            return Some(Err(CodecError::NotInitialized));
        };
        Some(self.encoder.encode_flow_sample(record, rate, &limits))
    }

    fn encode_counter(
        &mut self,
        record: &CounterSampleRecord,
    ) -> Option<Result<Datagram, CodecError>> {
        let (limits, configured) = {
            let db = self.db.read();
            (
                db.encode_limits(),
                db.interfaces.contains_key(&record.if_index),
            )
        };
        if !configured {
            self.stats.stale_records += 1;
            debug!(if_index = record.if_index, "Counter record for unconfigured interface dropped");
            return None;
        }
        let Some(limits) = limits else {
            return Some(Err(CodecError::NotInitialized));
        };
        Some(self.encoder.encode_counter_sample(record, &limits))
    }

    /// Keys and forwards an encoded datagram. Returns false once Fan-out is gone.
    async fn publish(
        &mut self,
        if_index: IfIndex,
        encoded: Option<Result<Datagram, CodecError>>,
    ) -> bool {
        let datagram = match encoded {
            None => return true,
            Some(Ok(datagram)) => datagram,
            Some(Err(e)) => {
                self.stats.encode_failures += 1;
                warn!(if_index, error = %e, "Failed to encode sFlow datagram, record dropped");
                return true;
            }
        };

        // The first datagram for an interface only creates its store slot and
        // is not published.
        if self.primed.insert(if_index) {
            self.stats.priming_drops += 1;
            debug!(if_index, "First record for interface dropped after priming store slot");
            return true;
        }

        let key = DatagramKey {
            if_index,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        let info = DatagramInfo {
            key,
            datagram: Arc::new(datagram),
        };
        if self.ready_tx.send(info).await.is_err() {
            warn!("Fan-out loop gone, stopping aggregation");
            return false;
        }
        self.stats.published += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{InterfaceEntry, SflowDb};
    use crate::tables::counters::GENERIC_IF_CTRS;
    use crate::types::{AdminState, GlobalConfig, InterfaceConfig};
    use std::collections::BTreeMap;
    use tokio::sync::oneshot;

    struct Harness {
        db: SharedDb,
        flow_tx: mpsc::Sender<FlowSampleRecord>,
        counter_tx: mpsc::Sender<CounterSampleRecord>,
        events_tx: mpsc::Sender<AggregationEvent>,
        ready_rx: mpsc::Receiver<DatagramInfo>,
        cancel: CancellationToken,
    }

    fn start() -> Harness {
        let mut db = SflowDb::new();
        db.global = Some(GlobalConfig {
            vrf: "default".into(),
            admin_state: AdminState::Up,
            agent_address: "192.0.2.1".parse().unwrap(),
            max_sampled_size: 128,
            counter_poll_interval: 0,
            max_datagram_size: 0,
        });
        for if_index in [1, 2] {
            db.insert_interface(InterfaceEntry::new(InterfaceConfig {
                if_index,
                intf_ref: format!("Ethernet{}", if_index),
                admin_state: AdminState::Up,
                sampling_rate: 1000,
            }));
        }
        let db = db.into_shared();

        let (flow_tx, flow_rx) = mpsc::channel(16);
        let (counter_tx, counter_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::channel(16);
        let (ready_tx, ready_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let agg = AggregationLoop::new(
            db.clone(),
            flow_rx,
            counter_rx,
            events_rx,
            ready_tx,
            cancel.clone(),
        );
        tokio::spawn(agg.run());

        Harness {
            db,
            flow_tx,
            counter_tx,
            events_tx,
            ready_rx,
            cancel,
        }
    }

    impl Harness {
        async fn bind(&self) {
            self.events_tx
                .send(AggregationEvent::AgentAddress("192.0.2.1".parse().unwrap()))
                .await
                .unwrap();
        }

        async fn flow(&self, if_index: IfIndex) {
            self.flow_tx
                .send(FlowSampleRecord {
                    if_index,
                    data: vec![0xab; 60],
                    frame_length: 60,
                })
                .await
                .unwrap();
        }

        async fn stats(&self) -> AggregationStats {
            let (tx, rx) = oneshot::channel();
            self.events_tx.send(AggregationEvent::Stats(tx)).await.unwrap();
            rx.await.unwrap()
        }

        /// Records race the stats query, so poll until all were consumed.
        async fn settle(&self, records: u64) -> AggregationStats {
            loop {
                let stats = self.stats().await;
                if stats.flow_records + stats.counter_records >= records {
                    return stats;
                }
                tokio::task::yield_now().await;
            }
        }
    }

    #[tokio::test]
    async fn test_first_record_per_interface_is_not_published() {
        let mut h = start();
        h.bind().await;

        h.flow(1).await;
        h.flow(1).await;
        h.flow(1).await;

        let first = h.ready_rx.recv().await.unwrap();
        let second = h.ready_rx.recv().await.unwrap();
        assert_eq!(first.key, DatagramKey { if_index: 1, seq: 0 });
        assert_eq!(second.key, DatagramKey { if_index: 1, seq: 1 });

        let stats = h.settle(3).await;
        assert_eq!(stats.priming_drops, 1);
        assert_eq!(stats.published, 2);
        assert!(h.ready_rx.try_recv().is_err());
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_sequence_shared_across_interfaces_and_kinds() {
        let mut h = start();
        h.bind().await;

        h.flow(1).await;
        h.flow(2).await;
        h.flow(1).await;
        h.counter_tx
            .send(CounterSampleRecord {
                if_index: 2,
                record_type: GENERIC_IF_CTRS,
                values: BTreeMap::new(),
            })
            .await
            .unwrap();
        h.settle(4).await;

        let mut seqs = Vec::new();
        while let Ok(info) = h.ready_rx.try_recv() {
            seqs.push(info.key.seq);
        }
        assert_eq!(seqs, vec![0, 1]);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_records_dropped_without_encoder() {
        let mut h = start();

        h.flow(1).await;
        h.flow(1).await;
        let stats = h.settle(2).await;
        assert_eq!(stats.encode_failures, 2);
        assert_eq!(stats.next_seq, 0);
        assert!(h.ready_rx.try_recv().is_err());

        // no failed record primed the slot
        h.bind().await;
        h.flow(1).await;
        h.flow(1).await;
        let info = h.ready_rx.recv().await.unwrap();
        assert_eq!(info.key.seq, 0);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_stale_interface_record_dropped() {
        let h = start();
        h.bind().await;
        h.db.write().remove_interface(2);

        h.flow(2).await;
        let stats = h.settle(1).await;
        assert_eq!(stats.stale_records, 1);
        assert_eq!(stats.encode_failures, 0);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_clear_encoder_stops_publishing() {
        let mut h = start();
        h.bind().await;
        h.flow(1).await;
        h.flow(1).await;
        assert_eq!(h.ready_rx.recv().await.unwrap().key.seq, 0);

        h.events_tx.send(AggregationEvent::ClearEncoder).await.unwrap();
        h.flow(1).await;
        let stats = h.settle(3).await;
        assert_eq!(stats.encode_failures, 1);
        assert_eq!(stats.published, 1);
        h.cancel.cancel();
    }
}
