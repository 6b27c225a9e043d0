//! Collector lifecycle manager.
//!
//! A collector runs only while both its own and the global admin state are
//! UP. Starting spawns a [`CollectorTask`], waits for its socket to open and
//! then registers its mailbox with Fan-out. Stopping unregisters first and
//! only then cancels the task, so Fan-out never delivers into a mailbox whose
//! reader is gone.

use std::net::{IpAddr, SocketAddr};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::collector_tx::CollectorTask;
use crate::db::{CollectorEntry, SflowDb, TaskHandle};
use crate::error::{SflowError, SflowResult};
use crate::server::SflowServer;
use crate::tables::limits::MAX_UDP_PORT;
use crate::types::{AdminState, BulkInfo, CollectorConfig, SflowCollector, SflowCollectorState};

fn parse_port(port: i32) -> Option<u16> {
    if (0..=MAX_UDP_PORT).contains(&port) {
        Some(port as u16)
    } else {
        None
    }
}

impl SflowServer {
    pub(crate) fn validate_create_collector(
        &self,
        obj: &SflowCollector,
    ) -> SflowResult<CollectorConfig> {
        let fail = |reason: &str| {
            SflowError::validation(format!("Create SflowCollector failed. {}", reason))
        };
        let db = self.db.read();

        if db.global.is_none() {
            return Err(fail("Sflow global object not created"));
        }
        let ip: IpAddr = obj
            .ip_addr
            .parse()
            .map_err(|_| fail("Invalid collector IP value provided"))?;
        if db.collectors.contains_key(&ip) {
            return Err(fail("Collector configuration already exists"));
        }
        let udp_port = parse_port(obj.udp_port).ok_or_else(|| fail("Invalid UDP port value provided"))?;
        let admin_state = AdminState::parse(&obj.admin_state)
            .ok_or_else(|| fail("Invalid AdminState value provided"))?;

        Ok(CollectorConfig {
            ip,
            udp_port,
            admin_state,
        })
    }

    /// Stores the collector and starts it when allowed. A start failure is
    /// returned but the collector stays configured, oper-down.
    #[instrument(skip_all, fields(collector = %obj.ip_addr))]
    pub(crate) async fn create_collector(&self, obj: &SflowCollector) -> SflowResult<()> {
        let config = self.validate_create_collector(obj)?;
        let ip = config.ip;
        let start = {
            let mut db = self.db.write();
            let start = db.global_admin_up() && config.admin_state.is_up();
            db.insert_collector(CollectorEntry::new(config));
            start
        };
        info!("SflowCollector created");

        if start {
            self.start_collector(ip).await?;
        }
        Ok(())
    }

    pub(crate) fn validate_update_collector(
        &self,
        obj: &SflowCollector,
    ) -> SflowResult<CollectorConfig> {
        let fail = |reason: &str| {
            SflowError::validation(format!("Update SflowCollector failed. {}", reason))
        };

        let ip: IpAddr = obj
            .ip_addr
            .parse()
            .map_err(|_| fail("Invalid collector IP value provided"))?;
        if !self.db.read().collectors.contains_key(&ip) {
            return Err(fail("Collector configuration does not exist"));
        }
        let udp_port = parse_port(obj.udp_port).ok_or_else(|| fail("Invalid UdpPort value provided"))?;
        let admin_state = AdminState::parse(&obj.admin_state)
            .ok_or_else(|| fail("Invalid AdminState value provided"))?;

        Ok(CollectorConfig {
            ip,
            udp_port,
            admin_state,
        })
    }

    /// A changed port or admin state restarts the task while global admin is
    /// UP: unregister, stop, then start again if the new admin state is UP.
    #[instrument(skip_all, fields(collector = %obj.ip_addr))]
    pub(crate) async fn update_collector(&self, obj: &SflowCollector) -> SflowResult<()> {
        let new = self.validate_update_collector(obj)?;
        let ip = new.ip;

        let (restart, global_up) = {
            let mut db = self.db.write();
            let global_up = db.global_admin_up();
            let Some(entry) = db.collectors.get_mut(&ip) else {
                return Err(SflowError::not_found("SflowCollector", ip.to_string()));
            };
            let restart =
                entry.config.udp_port != new.udp_port || entry.config.admin_state != new.admin_state;
            entry.config = new.clone();
            (restart, global_up)
        };
        info!(udp_port = new.udp_port, admin_state = new.admin_state.as_str(), "SflowCollector updated");

        if !restart || !global_up {
            return Ok(());
        }
        self.stop_collector(ip).await?;
        if new.admin_state.is_up() {
            self.start_collector(ip).await?;
        }
        Ok(())
    }

    pub(crate) fn validate_delete_collector(&self, ip_addr: &str) -> SflowResult<IpAddr> {
        let fail = || {
            SflowError::validation("Delete SflowCollector failed. Collector configuration does not exist")
        };
        let ip: IpAddr = ip_addr.parse().map_err(|_| fail())?;
        if !self.db.read().collectors.contains_key(&ip) {
            return Err(fail());
        }
        Ok(ip)
    }

    #[instrument(skip(self))]
    pub(crate) async fn delete_collector(&self, ip_addr: &str) -> SflowResult<()> {
        let ip = self.validate_delete_collector(ip_addr)?;
        let stopped = self.stop_collector(ip).await;
        self.db.write().remove_collector(&ip);
        info!("SflowCollector deleted");
        stopped
    }

    /// Spawns the transmit task, waits for its init result and registers its
    /// mailbox. No-op if the collector is already running.
    pub(crate) async fn start_collector(&self, ip: IpAddr) -> SflowResult<()> {
        let (config, stats, collector_id) = {
            let db = self.db.read();
            let entry = db
                .collectors
                .get(&ip)
                .ok_or_else(|| SflowError::not_found("SflowCollector", ip.to_string()))?;
            if entry.task.is_some() {
                return Ok(());
            }
            (entry.config.clone(), entry.stats.clone(), entry.collector_id())
        };

        let (mailbox_tx, mailbox_rx) = mpsc::channel(self.queues.collector);
        let cancel = CancellationToken::new();
        let task = CollectorTask {
            collector_id: collector_id.clone(),
            destination: SocketAddr::new(config.ip, config.udp_port),
            mailbox: mailbox_rx,
            fanout_tx: self.dispatch.fanout_sender(),
            stats,
            cancel: cancel.clone(),
        };

        let (init_tx, init_rx) = oneshot::channel();
        let join = tokio::spawn(task.run(init_tx));
        let init = init_rx
            .await
            .unwrap_or_else(|_| Err(SflowError::ChannelClosed("collector init")));
        if let Err(e) = init {
            let _ = join.await;
            return Err(e);
        }

        let handle = TaskHandle { cancel, join };
        if let Err(e) = self.dispatch.register(collector_id, mailbox_tx).await {
            handle.stop().await;
            return Err(e);
        }

        let orphan = {
            let mut db = self.db.write();
            match db.collectors.get_mut(&ip) {
                Some(entry) => {
                    entry.task = Some(handle);
                    None
                }
                None => Some(handle),
            }
        };
        if let Some(handle) = orphan {
            // Entry vanished while starting
            let _ = self.dispatch.unregister(ip.to_string()).await;
            handle.stop().await;
            return Err(SflowError::not_found("SflowCollector", ip.to_string()));
        }

        info!(collector = %ip, udp_port = config.udp_port, "Collector started");
        Ok(())
    }

    /// Unregisters the mailbox, waits for Fan-out to acknowledge, then stops
    /// the task. No-op if the collector is not running.
    pub(crate) async fn stop_collector(&self, ip: IpAddr) -> SflowResult<()> {
        let handle = self
            .db
            .write()
            .collectors
            .get_mut(&ip)
            .and_then(|entry| entry.task.take());
        let Some(handle) = handle else {
            return Ok(());
        };

        let unregistered = self.dispatch.unregister(ip.to_string()).await;
        if let Err(e) = &unregistered {
            warn!(collector = %ip, error = %e, "Failed to unregister collector");
        }
        handle.stop().await;
        info!(collector = %ip, "Collector stopped");
        unregistered
    }
}

fn state_of(entry: &CollectorEntry) -> SflowCollectorState {
    SflowCollectorState {
        ip_addr: entry.config.ip.to_string(),
        oper_state: entry.stats.oper_state().as_str().to_string(),
        num_sflow_samples_exported: entry.stats.samples(),
        num_datagram_exported: entry.stats.datagrams(),
    }
}

pub fn collector_state(db: &SflowDb, ip_addr: &str) -> SflowResult<SflowCollectorState> {
    ip_addr
        .parse::<IpAddr>()
        .ok()
        .and_then(|ip| db.collectors.get(&ip))
        .map(state_of)
        .ok_or_else(|| {
            SflowError::validation("Get SflowCollectorState failed. Invalid IpAddr key provided")
        })
}

/// One page of collector states in creation order.
pub fn bulk_collector_state(
    db: &SflowDb,
    from_index: usize,
    count: usize,
) -> SflowResult<BulkInfo<SflowCollectorState>> {
    let (keys, end_index, more) = db.collector_keys.page(from_index, count)?;
    let items = keys
        .iter()
        .filter_map(|ip| db.collectors.get(ip))
        .map(state_of)
        .collect();
    Ok(BulkInfo {
        items,
        end_index,
        more,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::*;
    use crate::types::OperState;
    use pretty_assertions::assert_eq;
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn test_create_validation() {
        let t = TestServer::new().await;
        let s = &t.server;

        let err = s
            .create_collector(&collector("10.0.0.5", 6343, "UP"))
            .await
            .unwrap_err();
        assert!(err.is_validation());

        s.create_global(&global("DOWN")).await.unwrap();
        let err = s
            .create_collector(&collector("10.0.0.5", 70000, "UP"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Create SflowCollector failed. Invalid UDP port value provided"
        );
        assert!(s.create_collector(&collector("10.0.0", 6343, "UP")).await.is_err());
        assert!(s.create_collector(&collector("10.0.0.5", 6343, "On")).await.is_err());
        assert!(s.db.read().collectors.is_empty());

        s.create_collector(&collector("10.0.0.5", 6343, "UP"))
            .await
            .unwrap();
        let err = s
            .create_collector(&collector("10.0.0.5", 6344, "UP"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Create SflowCollector failed. Collector configuration already exists"
        );
        t.stop().await;
    }

    #[tokio::test]
    async fn test_start_registers_with_fanout() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port() as i32;

        let t = TestServer::new().await;
        let s = &t.server;
        s.create_global(&global("UP")).await.unwrap();
        s.create_collector(&collector("127.0.0.1", port, "UP"))
            .await
            .unwrap();

        let state = collector_state(&s.db.read(), "127.0.0.1").unwrap();
        assert_eq!(state.oper_state, "UP");
        assert_eq!(s.dispatch.fanout_stats().await.unwrap().registered_collectors, 1);

        s.update_collector(&collector("127.0.0.1", port, "DOWN"))
            .await
            .unwrap();
        assert_eq!(s.dispatch.fanout_stats().await.unwrap().registered_collectors, 0);
        let stats = s.db.read().collectors[&"127.0.0.1".parse::<IpAddr>().unwrap()].stats.clone();
        assert_eq!(stats.oper_state(), OperState::Down);

        s.delete_collector("127.0.0.1").await.unwrap();
        assert!(collector_state(&s.db.read(), "127.0.0.1").is_err());
        assert!(s.delete_collector("127.0.0.1").await.is_err());
        t.stop().await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_start_failure_keeps_entry_unregistered() {
        let t = TestServer::new().await;
        let s = &t.server;
        s.create_global(&global("UP")).await.unwrap();

        let err = s
            .create_collector(&collector("255.255.255.255", 6343, "UP"))
            .await
            .unwrap_err();
        assert!(err.is_startup_failure());

        let db = s.db.read();
        let entry = &db.collectors[&"255.255.255.255".parse::<IpAddr>().unwrap()];
        assert!(entry.task.is_none());
        assert_eq!(entry.stats.oper_state(), OperState::Down);
        assert_eq!(entry.config.admin_state, AdminState::Up);
        drop(db);
        assert_eq!(s.dispatch.fanout_stats().await.unwrap().registered_collectors, 0);

        // Admin toggle retries the start and fails the same way
        s.update_collector(&collector("255.255.255.255", 6343, "DOWN"))
            .await
            .unwrap();
        assert!(s
            .update_collector(&collector("255.255.255.255", 6343, "UP"))
            .await
            .unwrap_err()
            .is_startup_failure());
        assert_eq!(s.dispatch.fanout_stats().await.unwrap().registered_collectors, 0);

        s.delete_collector("255.255.255.255").await.unwrap();
        assert!(s.db.read().collectors.is_empty());
        t.stop().await;
    }

    #[tokio::test]
    async fn test_port_change_restarts_task() {
        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let t = TestServer::new().await;
        let s = &t.server;
        s.create_global(&global("UP")).await.unwrap();
        let port = |sock: &UdpSocket| sock.local_addr().unwrap().port() as i32;
        s.create_collector(&collector("127.0.0.1", port(&first), "UP"))
            .await
            .unwrap();
        s.update_collector(&collector("127.0.0.1", port(&second), "UP"))
            .await
            .unwrap();

        let db = s.db.read();
        let entry = &db.collectors[&"127.0.0.1".parse::<IpAddr>().unwrap()];
        assert_eq!(entry.config.udp_port as i32, port(&second));
        assert!(entry.task.is_some());
        drop(db);

        assert!(s
            .update_collector(&collector("127.0.0.1", -1, "UP"))
            .await
            .is_err());
        t.stop().await;
    }

    #[tokio::test]
    async fn test_bulk_pages_in_creation_order() {
        let t = TestServer::new().await;
        let s = &t.server;
        s.create_global(&global("DOWN")).await.unwrap();
        for ip in ["10.0.0.3", "10.0.0.1", "10.0.0.2"] {
            s.create_collector(&collector(ip, 6343, "UP")).await.unwrap();
        }

        let db = s.db.read();
        let page = bulk_collector_state(&db, 0, 2).unwrap();
        let ips: Vec<_> = page.items.iter().map(|c| c.ip_addr.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.3", "10.0.0.1"]);
        assert_eq!((page.end_index, page.more), (2, true));

        let page = bulk_collector_state(&db, page.end_index, 2).unwrap();
        assert_eq!(page.count(), 1);
        assert!(!page.more);
        assert!(bulk_collector_state(&db, 0, 0).is_err());
        drop(db);
        t.stop().await;
    }
}
