//! Interface sampling task.
//!
//! Forwards every captured frame on one device as a flow record and, on a
//! separate timer, forwards a generic interface counter snapshot. The poll
//! period arrives over a `watch` channel so a global update can retune it
//! without restarting the task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{CaptureBackend, CapturedFrame, PacketSource};
use crate::db::ExportStats;
use crate::dispatch::{CounterSampleRecord, FlowSampleRecord};
use crate::error::SflowResult;
use crate::hw::SflowHw;
use crate::tables::counters::*;
use crate::tables::wire::{
    IF_DIRECTION_FULL_DUPLEX, IF_DIRECTION_HALF_DUPLEX, IF_OPER_STATUS_DOWN, IF_OPER_STATUS_UP,
    IF_PROMISCUOUS_MODE_UNSUPPORTED,
};
use crate::types::{IfIndex, IntfCfgInfo, IntfCounters, OperState};

pub struct SamplingTask {
    pub if_index: IfIndex,
    pub intf_ref: String,
    /// Kernel device the capture is opened on
    pub device: String,
    pub capture: Arc<dyn CaptureBackend>,
    pub hw: Arc<dyn SflowHw>,
    pub flow_tx: mpsc::Sender<FlowSampleRecord>,
    pub counter_tx: mpsc::Sender<CounterSampleRecord>,
    pub stats: Arc<ExportStats>,
    pub cancel: CancellationToken,
    /// Counter poll period in seconds, 0 disables polling
    pub poll_interval: watch::Receiver<u32>,
}

fn poll_ticker(seconds: u32) -> Option<Interval> {
    if seconds == 0 {
        return None;
    }
    let period = Duration::from_secs(u64::from(seconds));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Builds the counter-kind table for one generic interface counter record.
pub fn generic_counter_values(
    counters: &IntfCounters,
    cfg: &IntfCfgInfo,
) -> BTreeMap<u32, u64> {
    let duplex = if cfg.full_duplex {
        IF_DIRECTION_FULL_DUPLEX
    } else {
        IF_DIRECTION_HALF_DUPLEX
    };
    let oper = if counters.oper_up {
        IF_OPER_STATUS_UP
    } else {
        IF_OPER_STATUS_DOWN
    };

    BTreeMap::from([
        (GEN_IF_CTR_SPEED, cfg.speed),
        (GEN_IF_CTR_DUPLEX, u64::from(duplex)),
        (GEN_IF_CTR_OPERSTATUS, u64::from(oper)),
        (GEN_IF_CTR_IN_OCTETS, counters.in_octets),
        (GEN_IF_CTR_IN_UCAST, counters.in_ucast_pkts),
        (GEN_IF_CTR_IN_MCAST, counters.in_mcast_pkts),
        (GEN_IF_CTR_IN_BCAST, counters.in_bcast_pkts),
        (GEN_IF_CTR_IN_DISCARDS, counters.in_discards),
        (GEN_IF_CTR_IN_ERRORS, counters.in_errors),
        (GEN_IF_CTR_IN_UNKNOWN_PROTO, counters.in_unknown_protos),
        (GEN_IF_CTR_OUT_OCTETS, counters.out_octets),
        (GEN_IF_CTR_OUT_UCAST, counters.out_ucast_pkts),
        (GEN_IF_CTR_OUT_MCAST, counters.out_mcast_pkts),
        (GEN_IF_CTR_OUT_BCAST, counters.out_bcast_pkts),
        (GEN_IF_CTR_OUT_DISCARDS, counters.out_discards),
        (GEN_IF_CTR_OUT_ERRORS, counters.out_errors),
        (GEN_IF_CTR_PROM_MODE, u64::from(IF_PROMISCUOUS_MODE_UNSUPPORTED)),
    ])
}

impl SamplingTask {
    /// Runs until cancelled. `init` carries the capture-open result.
    pub async fn run(mut self, init: oneshot::Sender<SflowResult<()>>) {
        let mut source = match self.capture.open(&self.device).await {
            Ok(source) => Some(source),
            Err(e) => {
                self.stats.set_oper(OperState::Down);
                warn!(if_index = self.if_index, device = %self.device, error = %e, "Failed to open capture");
                let _ = init.send(Err(e));
                return;
            }
        };

        self.stats.set_oper(OperState::Up);
        if init.send(Ok(())).is_err() {
            self.stats.set_oper(OperState::Down);
            return;
        }
        info!(
            if_index = self.if_index,
            device = %self.device,
            backend = self.capture.name(),
            "Interface sampling task started"
        );

        let mut ticker = poll_ticker(*self.poll_interval.borrow_and_update());
        let mut poll_control_open = true;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                changed = self.poll_interval.changed(), if poll_control_open => {
                    if changed.is_err() {
                        poll_control_open = false;
                        continue;
                    }
                    let seconds = *self.poll_interval.borrow_and_update();
                    debug!(if_index = self.if_index, seconds, "Counter poll interval changed");
                    ticker = poll_ticker(seconds);
                }
                _ = next_tick(&mut ticker) => self.poll_counters().await,
                frame = next_frame(&mut source) => match frame {
                    Ok(Some(frame)) => {
                        if !self.forward_flow(frame).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        warn!(if_index = self.if_index, device = %self.device, "Capture ended");
                        source = None;
                    }
                    Err(e) => {
                        warn!(if_index = self.if_index, device = %self.device, error = %e, "Capture failed");
                        source = None;
                    }
                },
            }
        }

        drop(source);
        self.stats.set_oper(OperState::Down);
        info!(if_index = self.if_index, "Interface sampling task stopped");
    }

    /// Returns false once Aggregation is gone.
    async fn forward_flow(&self, frame: CapturedFrame) -> bool {
        let record = FlowSampleRecord {
            if_index: self.if_index,
            data: frame.data,
            frame_length: frame.frame_length,
        };
        if self.flow_tx.send(record).await.is_err() {
            debug!(if_index = self.if_index, "Flow record queue closed");
            return false;
        }
        self.stats.add_samples(1);
        true
    }

    async fn poll_counters(&self) {
        let counters = match self.hw.interface_counters(&self.intf_ref).await {
            Ok(counters) => counters,
            Err(e) => {
                warn!(if_index = self.if_index, error = %e, "Failed to read interface counters");
                return;
            }
        };
        let cfg = match self.hw.interface_cfg_info(&self.intf_ref).await {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(if_index = self.if_index, error = %e, "Failed to read interface config");
                return;
            }
        };

        let record = CounterSampleRecord {
            if_index: self.if_index,
            record_type: GENERIC_IF_CTRS,
            values: generic_counter_values(&counters, &cfg),
        };
        if self.counter_tx.send(record).await.is_err() {
            debug!(if_index = self.if_index, "Counter record queue closed");
        }
    }
}

async fn next_frame(
    source: &mut Option<Box<dyn PacketSource>>,
) -> SflowResult<Option<CapturedFrame>> {
    match source {
        Some(source) => source.next_packet().await,
        None => std::future::pending().await,
    }
}
