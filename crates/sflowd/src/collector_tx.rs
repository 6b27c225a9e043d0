//! Collector transmit task.
//!
//! One task per running collector. It owns the UDP socket, drains the
//! collector's mailbox in order and posts a receipt for every datagram it
//! attempted to send, whether or not the write succeeded.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::ExportStats;
use crate::dispatch::{CollectorId, DatagramInfo, FanoutEvent, TransmitReceipt};
use crate::error::{SflowError, SflowResult};
use crate::types::OperState;

pub struct CollectorTask {
    pub collector_id: CollectorId,
    pub destination: SocketAddr,
    pub mailbox: mpsc::Receiver<DatagramInfo>,
    pub fanout_tx: mpsc::Sender<FanoutEvent>,
    pub stats: Arc<ExportStats>,
    pub cancel: CancellationToken,
}

async fn open_socket(destination: SocketAddr) -> std::io::Result<UdpSocket> {
    let local: SocketAddr = match destination.ip() {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(destination).await?;
    Ok(socket)
}

impl CollectorTask {
    /// Runs until cancelled. `init` carries the socket-open result; nothing is
    /// sent after a failed init.
    pub async fn run(mut self, init: oneshot::Sender<SflowResult<()>>) {
        let socket = match open_socket(self.destination).await {
            Ok(socket) => socket,
            Err(e) => {
                self.stats.set_oper(OperState::Down);
                warn!(collector = %self.collector_id, error = %e, "Failed to open collector socket");
                let _ = init.send(Err(SflowError::task_startup(
                    "collector",
                    self.collector_id.clone(),
                    e.to_string(),
                )));
                return;
            }
        };

        self.stats.set_oper(OperState::Up);
        if init.send(Ok(())).is_err() {
            // Starter gave up waiting, nobody will register this task
            self.stats.set_oper(OperState::Down);
            return;
        }
        info!(collector = %self.collector_id, destination = %self.destination, "Collector transmit task started");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                msg = self.mailbox.recv() => {
                    let Some(info) = msg else { break };
                    self.transmit(&socket, &info).await;

                    let receipt = TransmitReceipt {
                        key: info.key,
                        collector_id: self.collector_id.clone(),
                    };
                    if self.fanout_tx.send(FanoutEvent::Receipt(receipt)).await.is_err() {
                        break;
                    }
                }
            }
        }

        drop(socket);
        self.stats.set_oper(OperState::Down);
        if self
            .fanout_tx
            .send(FanoutEvent::Terminated(self.collector_id.clone()))
            .await
            .is_err()
        {
            debug!(collector = %self.collector_id, "Fan-out already stopped");
        }
        info!(collector = %self.collector_id, "Collector transmit task stopped");
    }

    async fn transmit(&self, socket: &UdpSocket, info: &DatagramInfo) {
        match socket.send(&info.datagram.bytes).await {
            Ok(_) => {
                self.stats.add_datagram();
                self.stats.add_samples(u64::from(info.datagram.num_samples));
            }
            Err(e) => {
                warn!(collector = %self.collector_id, key = ?info.key, error = %e, "Failed to send sFlow datagram");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DatagramKey;
    use crate::encoder::Datagram;

    struct Started {
        mailbox: mpsc::Sender<DatagramInfo>,
        fanout_rx: mpsc::Receiver<FanoutEvent>,
        stats: Arc<ExportStats>,
        cancel: CancellationToken,
        join: tokio::task::JoinHandle<()>,
        init: SflowResult<()>,
    }

    async fn start(destination: SocketAddr) -> Started {
        let (mailbox, rx) = mpsc::channel(8);
        let (fanout_tx, fanout_rx) = mpsc::channel(8);
        let stats = Arc::new(ExportStats::default());
        let cancel = CancellationToken::new();
        let task = CollectorTask {
            collector_id: destination.ip().to_string(),
            destination,
            mailbox: rx,
            fanout_tx,
            stats: stats.clone(),
            cancel: cancel.clone(),
        };
        let (init_tx, init_rx) = oneshot::channel();
        let join = tokio::spawn(task.run(init_tx));
        let init = init_rx.await.unwrap();
        Started {
            mailbox,
            fanout_rx,
            stats,
            cancel,
            join,
            init,
        }
    }

    fn info(seq: u64) -> DatagramInfo {
        DatagramInfo {
            key: DatagramKey { if_index: 1, seq },
            datagram: Arc::new(Datagram {
                bytes: vec![0xde, 0xad, 0xbe, 0xef],
                num_samples: 1,
            }),
        }
    }

    #[tokio::test]
    async fn test_sends_and_posts_receipt() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut t = start(listener.local_addr().unwrap()).await;
        assert!(t.init.is_ok());
        assert_eq!(t.stats.oper_state(), OperState::Up);

        t.mailbox.send(info(4)).await.unwrap();
        let mut buf = [0u8; 16];
        let n = listener.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0xde, 0xad, 0xbe, 0xef]);

        match t.fanout_rx.recv().await.unwrap() {
            FanoutEvent::Receipt(r) => assert_eq!(r.key.seq, 4),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(t.stats.datagrams(), 1);
        assert_eq!(t.stats.samples(), 1);

        t.cancel.cancel();
        t.join.await.unwrap();
        match t.fanout_rx.recv().await.unwrap() {
            FanoutEvent::Terminated(id) => assert_eq!(id, "127.0.0.1"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(t.stats.oper_state(), OperState::Down);
    }

    // connect(2) to the limited broadcast address fails without SO_BROADCAST
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_socket_open_failure_reports_init_error() {
        let mut t = start("255.255.255.255:6343".parse().unwrap()).await;
        assert!(t.init.unwrap_err().is_startup_failure());
        assert_eq!(t.stats.oper_state(), OperState::Down);

        t.join.await.unwrap();
        // No receipt, termination or anything else reached Fan-out
        assert!(t.fanout_rx.recv().await.is_none());
        assert_eq!(t.stats.datagrams(), 0);
        drop(t.mailbox);
    }

    #[tokio::test]
    async fn test_failed_write_still_posts_receipt() {
        // Nothing listens on the port: the first send may succeed, later ones
        // may fail with ECONNREFUSED. Either way every datagram gets a receipt.
        let unused = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let destination = unused.local_addr().unwrap();
        drop(unused);

        let mut t = start(destination).await;
        for seq in 0..3 {
            t.mailbox.send(info(seq)).await.unwrap();
        }
        for seq in 0..3 {
            match t.fanout_rx.recv().await.unwrap() {
                FanoutEvent::Receipt(r) => assert_eq!(r.key.seq, seq),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(t.stats.datagrams() <= 3);
        t.cancel.cancel();
        t.join.await.unwrap();
    }
}
