//! Fan-out loop: delivery to collector mailboxes and datagram retirement.

use std::collections::{BTreeMap, HashSet};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ledger::{AckOutcome, DatagramLedger, LedgerStats};
use super::{CollectorId, DatagramInfo, FanoutEvent};

/// Snapshot of Fan-out bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub ledger: LedgerStats,
    /// Successful placements into collector mailboxes
    pub deliveries: u64,
    /// Placements skipped because a mailbox was full or closed
    pub dropped_deliveries: u64,
    pub stored: usize,
    pub outstanding_references: usize,
    pub registered_collectors: usize,
}

pub struct FanoutLoop {
    ready_rx: mpsc::Receiver<DatagramInfo>,
    events_rx: mpsc::Receiver<FanoutEvent>,
    mailboxes: BTreeMap<CollectorId, mpsc::Sender<DatagramInfo>>,
    ledger: DatagramLedger,
    deliveries: u64,
    dropped_deliveries: u64,
    cancel: CancellationToken,
}

impl FanoutLoop {
    pub fn new(
        ready_rx: mpsc::Receiver<DatagramInfo>,
        events_rx: mpsc::Receiver<FanoutEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ready_rx,
            events_rx,
            mailboxes: BTreeMap::new(),
            ledger: DatagramLedger::new(),
            deliveries: 0,
            dropped_deliveries: 0,
            cancel,
        }
    }

    pub async fn run(mut self) {
        debug!("Fan-out loop started");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Some(info) = self.ready_rx.recv() => self.handle_ready(info),
                else => break,
            }
        }

        info!(
            stored = self.ledger.stored(),
            outstanding = self.ledger.outstanding_references(),
            "Fan-out loop stopped"
        );
    }

    fn handle_ready(&mut self, info: DatagramInfo) {
        let mut recipients = HashSet::with_capacity(self.mailboxes.len());
        let mut closed = Vec::new();

        for (collector_id, mailbox) in &self.mailboxes {
            match mailbox.try_send(info.clone()) {
                Ok(()) => {
                    recipients.insert(collector_id.clone());
                    self.deliveries += 1;
                }
                Err(TrySendError::Full(_)) => {
                    self.dropped_deliveries += 1;
                    warn!(collector = %collector_id, key = ?info.key, "Collector mailbox full, datagram not delivered");
                }
                Err(TrySendError::Closed(_)) => {
                    self.dropped_deliveries += 1;
                    closed.push(collector_id.clone());
                }
            }
        }

        for collector_id in closed {
            warn!(collector = %collector_id, "Collector mailbox closed, unregistering");
            self.mailboxes.remove(&collector_id);
        }

        if !self.ledger.publish(info.key, info.datagram, recipients) {
            debug!(key = ?info.key, "No collectors registered, datagram retired");
        }
    }

    fn handle_event(&mut self, event: FanoutEvent) {
        match event {
            FanoutEvent::Register {
                collector_id,
                mailbox,
                ack,
            } => {
                debug!(collector = %collector_id, "Registering collector mailbox");
                self.mailboxes.insert(collector_id, mailbox);
                let _ = ack.send(());
            }
            FanoutEvent::Unregister { collector_id, ack } => {
                if self.mailboxes.remove(&collector_id).is_none() {
                    debug!(collector = %collector_id, "Unregister for unknown collector");
                }
                let _ = ack.send(());
            }
            FanoutEvent::Receipt(receipt) => match self.ledger.acknowledge(&receipt) {
                AckOutcome::Retired => {
                    debug!(key = ?receipt.key, "All collectors done, datagram retired")
                }
                AckOutcome::Pending => {}
                AckOutcome::Unknown => {
                    warn!(collector = %receipt.collector_id, key = ?receipt.key, "Transmit receipt without outstanding reference")
                }
            },
            FanoutEvent::Terminated(collector_id) => {
                // A task may exit on its own while still registered
                self.mailboxes.remove(&collector_id);
                let retired = self.ledger.release_collector(&collector_id);
                debug!(collector = %collector_id, retired, "Released references of terminated collector");
            }
            FanoutEvent::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn stats(&self) -> FanoutStats {
        FanoutStats {
            ledger: self.ledger.stats(),
            deliveries: self.deliveries,
            dropped_deliveries: self.dropped_deliveries,
            stored: self.ledger.stored(),
            outstanding_references: self.ledger.outstanding_references(),
            registered_collectors: self.mailboxes.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DatagramKey, TransmitReceipt};
    use crate::encoder::Datagram;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    struct Harness {
        ready_tx: mpsc::Sender<DatagramInfo>,
        events_tx: mpsc::Sender<FanoutEvent>,
        cancel: CancellationToken,
        join: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        fn start() -> Self {
            let (ready_tx, ready_rx) = mpsc::channel(16);
            let (events_tx, events_rx) = mpsc::channel(16);
            let cancel = CancellationToken::new();
            let join = tokio::spawn(FanoutLoop::new(ready_rx, events_rx, cancel.clone()).run());
            Self {
                ready_tx,
                events_tx,
                cancel,
                join,
            }
        }

        async fn register(&self, id: &str, capacity: usize) -> mpsc::Receiver<DatagramInfo> {
            let (mailbox, rx) = mpsc::channel(capacity);
            let (ack, ack_rx) = oneshot::channel();
            self.events_tx
                .send(FanoutEvent::Register {
                    collector_id: id.to_string(),
                    mailbox,
                    ack,
                })
                .await
                .unwrap();
            ack_rx.await.unwrap();
            rx
        }

        async fn stats(&self) -> FanoutStats {
            let (tx, rx) = oneshot::channel();
            self.events_tx.send(FanoutEvent::Stats(tx)).await.unwrap();
            rx.await.unwrap()
        }

        async fn ready(&self, seq: u64) -> DatagramKey {
            let key = DatagramKey { if_index: 1, seq };
            self.ready_tx
                .send(DatagramInfo {
                    key,
                    datagram: Arc::new(Datagram {
                        bytes: vec![1, 2, 3, 4],
                        num_samples: 1,
                    }),
                })
                .await
                .unwrap();
            key
        }

        /// Ready events race the stats query, so poll until Fan-out caught up.
        async fn wait_published(&self, n: u64) -> FanoutStats {
            loop {
                let stats = self.stats().await;
                if stats.ledger.published >= n {
                    return stats;
                }
                tokio::task::yield_now().await;
            }
        }

        async fn stop(self) {
            self.cancel.cancel();
            self.join.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_delivers_to_every_registered_collector() {
        let h = Harness::start();
        let mut a = h.register("a", 8).await;
        let mut b = h.register("b", 8).await;

        let key = h.ready(0).await;
        assert_eq!(a.recv().await.unwrap().key, key);
        assert_eq!(b.recv().await.unwrap().key, key);

        let stats = h.stats().await;
        assert_eq!(stats.deliveries, 2);
        assert_eq!(stats.stored, 1);
        assert_eq!(stats.outstanding_references, 2);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_receipt_and_termination_retire_datagram() {
        let h = Harness::start();
        let mut a = h.register("a", 8).await;
        let mut b = h.register("b", 8).await;

        let key = h.ready(0).await;
        a.recv().await.unwrap();
        b.recv().await.unwrap();

        h.events_tx
            .send(FanoutEvent::Receipt(TransmitReceipt {
                key,
                collector_id: "a".into(),
            }))
            .await
            .unwrap();
        assert_eq!(h.stats().await.stored, 1);

        h.events_tx
            .send(FanoutEvent::Terminated("b".into()))
            .await
            .unwrap();
        let stats = h.stats().await;
        assert_eq!(stats.stored, 0);
        assert_eq!(stats.ledger.reference_removals, 2);
        assert_eq!(stats.registered_collectors, 1);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_full_mailbox_does_not_block_others() {
        let h = Harness::start();
        let _slow = h.register("slow", 1).await;
        let mut fast = h.register("fast", 8).await;

        h.ready(0).await;
        h.ready(1).await;
        assert_eq!(fast.recv().await.unwrap().key.seq, 0);
        assert_eq!(fast.recv().await.unwrap().key.seq, 1);

        let stats = h.stats().await;
        assert_eq!(stats.deliveries, 3);
        assert_eq!(stats.dropped_deliveries, 1);
        // seq 1 only references "fast"
        assert_eq!(stats.outstanding_references, 3);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_unregistered_collector_receives_nothing() {
        let h = Harness::start();
        let mut a = h.register("a", 8).await;

        let (ack, ack_rx) = oneshot::channel();
        h.events_tx
            .send(FanoutEvent::Unregister {
                collector_id: "a".into(),
                ack,
            })
            .await
            .unwrap();
        ack_rx.await.unwrap();

        h.ready(0).await;
        let stats = h.wait_published(1).await;
        assert_eq!(stats.stored, 0);
        assert_eq!(stats.ledger.retired, 1);
        assert!(a.try_recv().is_err());
        h.stop().await;
    }
}
