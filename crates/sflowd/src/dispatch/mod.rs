//! Dispatch core
//!
//! Two always-on loops sit between the interface tasks and the collector
//! tasks:
//!
//! - **Aggregation** drains flow and counter records, encodes each into a
//!   datagram keyed by `(ifIndex, sequence)` and emits a ready event.
//! - **Fan-out** owns the datagram store and reference table. It delivers
//!   every ready datagram to each registered collector mailbox and retires
//!   the datagram once every recipient has posted a receipt or terminated.
//!
//! Collector registration, receipts and termination signals share one FIFO
//! mailbox into Fan-out, so a collector's termination is always handled
//! before a later re-registration under the same id.

mod aggregation;
mod fanout;
mod ledger;

pub use aggregation::{AggregationLoop, AggregationStats};
pub use fanout::{FanoutLoop, FanoutStats};
pub use ledger::{AckOutcome, DatagramLedger, LedgerStats};

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::QueueConfig;
use crate::db::SharedDb;
use crate::encoder::Datagram;
use crate::error::{SflowError, SflowResult};
use crate::types::IfIndex;

/// Collector identifier used by Fan-out (the collector IP as text).
pub type CollectorId = String;

/// Store key of one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatagramKey {
    pub if_index: IfIndex,
    pub seq: u64,
}

/// Captured packet forwarded by an interface task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSampleRecord {
    pub if_index: IfIndex,
    pub data: Vec<u8>,
    /// Length of the frame on the wire, at least `data.len()`
    pub frame_length: u32,
}

/// Counter snapshot forwarded by an interface task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSampleRecord {
    pub if_index: IfIndex,
    /// Counter record type, e.g. `GENERIC_IF_CTRS`
    pub record_type: u32,
    /// Counter kind to value
    pub values: BTreeMap<u32, u64>,
}

/// A stored datagram together with its key.
#[derive(Debug, Clone)]
pub struct DatagramInfo {
    pub key: DatagramKey,
    pub datagram: Arc<Datagram>,
}

/// Posted by a collector task after each write attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmitReceipt {
    pub key: DatagramKey,
    pub collector_id: CollectorId,
}

/// Global-config change notifications for Aggregation.
#[derive(Debug)]
pub enum AggregationEvent {
    /// Rebuild the encoder for a new agent address
    AgentAddress(IpAddr),
    /// GlobalConfig deleted, drop the encoder
    ClearEncoder,
    Stats(oneshot::Sender<AggregationStats>),
}

/// Everything Fan-out consumes besides ready events.
#[derive(Debug)]
pub enum FanoutEvent {
    Register {
        collector_id: CollectorId,
        mailbox: mpsc::Sender<DatagramInfo>,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        collector_id: CollectorId,
        ack: oneshot::Sender<()>,
    },
    Receipt(TransmitReceipt),
    Terminated(CollectorId),
    Stats(oneshot::Sender<FanoutStats>),
}

/// Cloneable access to the dispatch loops.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    flow_tx: mpsc::Sender<FlowSampleRecord>,
    counter_tx: mpsc::Sender<CounterSampleRecord>,
    aggregation_tx: mpsc::Sender<AggregationEvent>,
    fanout_tx: mpsc::Sender<FanoutEvent>,
    cancel: CancellationToken,
}

impl DispatchHandle {
    /// Sender interface tasks use for flow records.
    pub fn flow_sender(&self) -> mpsc::Sender<FlowSampleRecord> {
        self.flow_tx.clone()
    }

    /// Sender interface tasks use for counter records.
    pub fn counter_sender(&self) -> mpsc::Sender<CounterSampleRecord> {
        self.counter_tx.clone()
    }

    /// Sender collector tasks use for receipts and termination.
    pub fn fanout_sender(&self) -> mpsc::Sender<FanoutEvent> {
        self.fanout_tx.clone()
    }

    /// Starts delivering datagrams to `mailbox`. Returns once Fan-out has
    /// recorded the registration.
    pub async fn register(
        &self,
        collector_id: CollectorId,
        mailbox: mpsc::Sender<DatagramInfo>,
    ) -> SflowResult<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.fanout_tx
            .send(FanoutEvent::Register {
                collector_id,
                mailbox,
                ack,
            })
            .await
            .map_err(|_| SflowError::ChannelClosed("fan-out"))?;
        ack_rx
            .await
            .map_err(|_| SflowError::ChannelClosed("fan-out register ack"))
    }

    /// Stops delivering to `collector_id`. Returns once no further datagram
    /// will be placed in its mailbox.
    pub async fn unregister(&self, collector_id: CollectorId) -> SflowResult<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.fanout_tx
            .send(FanoutEvent::Unregister { collector_id, ack })
            .await
            .map_err(|_| SflowError::ChannelClosed("fan-out"))?;
        ack_rx
            .await
            .map_err(|_| SflowError::ChannelClosed("fan-out unregister ack"))
    }

    pub async fn rebind_encoder(&self, agent_address: IpAddr) -> SflowResult<()> {
        self.aggregation_tx
            .send(AggregationEvent::AgentAddress(agent_address))
            .await
            .map_err(|_| SflowError::ChannelClosed("aggregation"))
    }

    pub async fn clear_encoder(&self) -> SflowResult<()> {
        self.aggregation_tx
            .send(AggregationEvent::ClearEncoder)
            .await
            .map_err(|_| SflowError::ChannelClosed("aggregation"))
    }

    pub async fn fanout_stats(&self) -> SflowResult<FanoutStats> {
        let (tx, rx) = oneshot::channel();
        self.fanout_tx
            .send(FanoutEvent::Stats(tx))
            .await
            .map_err(|_| SflowError::ChannelClosed("fan-out"))?;
        rx.await.map_err(|_| SflowError::ChannelClosed("fan-out stats"))
    }

    pub async fn aggregation_stats(&self) -> SflowResult<AggregationStats> {
        let (tx, rx) = oneshot::channel();
        self.aggregation_tx
            .send(AggregationEvent::Stats(tx))
            .await
            .map_err(|_| SflowError::ChannelClosed("aggregation"))?;
        rx.await
            .map_err(|_| SflowError::ChannelClosed("aggregation stats"))
    }

    /// Signals both loops to exit.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Join handles of the two dispatch loops.
#[derive(Debug)]
pub struct DispatchTasks {
    pub aggregation: JoinHandle<()>,
    pub fanout: JoinHandle<()>,
}

impl DispatchTasks {
    pub async fn join(self) {
        let _ = self.aggregation.await;
        let _ = self.fanout.await;
        debug!("Dispatch loops stopped");
    }
}

/// Spawns the Aggregation and Fan-out loops.
pub fn spawn(db: SharedDb, queues: &QueueConfig) -> (DispatchHandle, DispatchTasks) {
    let cancel = CancellationToken::new();

    let (flow_tx, flow_rx) = mpsc::channel(queues.intf_record);
    let (counter_tx, counter_rx) = mpsc::channel(queues.intf_record);
    let (aggregation_tx, aggregation_rx) = mpsc::channel(queues.aggregation_control);
    let (ready_tx, ready_rx) = mpsc::channel(queues.dgram_ready);
    let (fanout_tx, fanout_rx) = mpsc::channel(queues.fanout_control);

    let aggregation = AggregationLoop::new(
        db,
        flow_rx,
        counter_rx,
        aggregation_rx,
        ready_tx,
        cancel.clone(),
    );
    let fanout = FanoutLoop::new(ready_rx, fanout_rx, cancel.clone());

    let tasks = DispatchTasks {
        aggregation: tokio::spawn(aggregation.run()),
        fanout: tokio::spawn(fanout.run()),
    };
    let handle = DispatchHandle {
        flow_tx,
        counter_tx,
        aggregation_tx,
        fanout_tx,
        cancel,
    };
    (handle, tasks)
}
