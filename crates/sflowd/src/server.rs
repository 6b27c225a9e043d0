//! Configuration server.
//!
//! Create/Update/Delete requests are queued to one [`SflowServer`] loop and
//! handled strictly one at a time, so a lifecycle operation that waits on a
//! task's init acknowledgment delays every request behind it. State queries
//! bypass the loop and read the shared db directly.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capture::CaptureBackend;
use crate::collector;
use crate::config::QueueConfig;
use crate::db::{SflowDb, SharedDb};
use crate::dispatch::{self, AggregationStats, DispatchHandle, DispatchTasks, FanoutStats};
use crate::error::{SflowError, SflowResult};
use crate::hw::SflowHw;
use crate::intf;
use crate::types::{
    BulkInfo, SflowCollector, SflowCollectorState, SflowGlobal, SflowIntf, SflowIntfState,
};

type Reply<T> = oneshot::Sender<SflowResult<T>>;

/// One queued configuration operation.
#[derive(Debug)]
pub enum ServerRequest {
    CreateGlobal(SflowGlobal, Reply<()>),
    UpdateGlobal(SflowGlobal, Reply<()>),
    DeleteGlobal(Reply<()>),
    CreateCollector(SflowCollector, Reply<()>),
    UpdateCollector(SflowCollector, Reply<()>),
    DeleteCollector(String, Reply<()>),
    CreateIntf(SflowIntf, Reply<()>),
    UpdateIntf(SflowIntf, Reply<()>),
    DeleteIntf(String, Reply<()>),
    /// Stop every task, then the dispatch loops
    Shutdown(oneshot::Sender<()>),
}

/// Owner of the lifecycle managers. Each manager lives in its own module as
/// an `impl SflowServer` block.
pub struct SflowServer {
    pub(crate) db: SharedDb,
    pub(crate) hw: Arc<dyn SflowHw>,
    pub(crate) capture: Arc<dyn CaptureBackend>,
    pub(crate) dispatch: DispatchHandle,
    pub(crate) queues: QueueConfig,
}

impl SflowServer {
    pub fn new(
        db: SharedDb,
        hw: Arc<dyn SflowHw>,
        capture: Arc<dyn CaptureBackend>,
        dispatch: DispatchHandle,
        queues: QueueConfig,
    ) -> Self {
        Self {
            db,
            hw,
            capture,
            dispatch,
            queues,
        }
    }

    /// Serves requests until shutdown or until every handle is dropped.
    pub async fn run(self, mut requests: mpsc::Receiver<ServerRequest>, tasks: DispatchTasks) {
        info!("sflowd server started");

        let mut shutdown_ack = None;
        while let Some(request) = requests.recv().await {
            match request {
                ServerRequest::CreateGlobal(obj, reply) => {
                    let _ = reply.send(self.create_global(&obj).await);
                }
                ServerRequest::UpdateGlobal(obj, reply) => {
                    let _ = reply.send(self.update_global(&obj).await);
                }
                ServerRequest::DeleteGlobal(reply) => {
                    let _ = reply.send(self.delete_global().await);
                }
                ServerRequest::CreateCollector(obj, reply) => {
                    let _ = reply.send(self.create_collector(&obj).await);
                }
                ServerRequest::UpdateCollector(obj, reply) => {
                    let _ = reply.send(self.update_collector(&obj).await);
                }
                ServerRequest::DeleteCollector(ip, reply) => {
                    let _ = reply.send(self.delete_collector(&ip).await);
                }
                ServerRequest::CreateIntf(obj, reply) => {
                    let _ = reply.send(self.create_intf(&obj).await);
                }
                ServerRequest::UpdateIntf(obj, reply) => {
                    let _ = reply.send(self.update_intf(&obj).await);
                }
                ServerRequest::DeleteIntf(intf_ref, reply) => {
                    let _ = reply.send(self.delete_intf(&intf_ref).await);
                }
                ServerRequest::Shutdown(ack) => {
                    shutdown_ack = Some(ack);
                    break;
                }
            }
        }

        self.stop_all().await;
        self.dispatch.shutdown();
        tasks.join().await;
        info!("sflowd server stopped");

        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    /// Stops every running interface and collector task. Configuration is
    /// left in place.
    pub(crate) async fn stop_all(&self) {
        let (interfaces, collectors) = {
            let db = self.db.read();
            (
                db.interface_keys.keys().to_vec(),
                db.collector_keys.keys().to_vec(),
            )
        };

        for if_index in interfaces {
            self.stop_interface(if_index).await;
        }
        for ip in collectors {
            if let Err(e) = self.stop_collector(ip).await {
                warn!(collector = %ip, error = %e, "Failed to stop collector cleanly");
            }
        }
    }

    /// Starts every stopped interface and collector whose admin state is UP.
    /// Individual failures are logged and leave that entity oper-down.
    pub(crate) async fn start_all(&self) {
        let (interfaces, collectors) = {
            let db = self.db.read();
            let interfaces: Vec<_> = db
                .interface_keys
                .keys()
                .iter()
                .filter(|k| {
                    db.interfaces
                        .get(*k)
                        .is_some_and(|e| e.config.admin_state.is_up() && e.task.is_none())
                })
                .copied()
                .collect();
            let collectors: Vec<_> = db
                .collector_keys
                .keys()
                .iter()
                .filter(|k| {
                    db.collectors
                        .get(*k)
                        .is_some_and(|e| e.config.admin_state.is_up() && e.task.is_none())
                })
                .copied()
                .collect();
            (interfaces, collectors)
        };

        for ip in collectors {
            if let Err(e) = self.start_collector(ip).await {
                warn!(collector = %ip, error = %e, "Failed to start collector");
            }
        }
        for if_index in interfaces {
            if let Err(e) = self.start_interface(if_index).await {
                warn!(if_index, error = %e, "Failed to start interface sampling");
            }
        }
    }
}

/// Builds the netdev map from the hardware plugin. A failure is remembered so
/// that GlobalConfig creation can refuse to proceed.
pub async fn bootstrap(db: &SharedDb, hw: &dyn SflowHw) {
    match hw.list_monitorable_interfaces().await {
        Ok(netdevs) => {
            info!(plugin = hw.name(), count = netdevs.len(), "Discovered monitorable interfaces");
            let mut db = db.write();
            db.set_netdevs(netdevs);
            db.bootstrap_failed = false;
        }
        Err(e) => {
            error!(plugin = hw.name(), error = %e, "Failed to construct sflow infrastructure");
            db.write().bootstrap_failed = true;
        }
    }
}

/// Bootstraps, starts the dispatch loops and the server loop.
pub async fn spawn(
    hw: Arc<dyn SflowHw>,
    capture: Arc<dyn CaptureBackend>,
    queues: QueueConfig,
) -> (ServerHandle, JoinHandle<()>) {
    let db = SflowDb::new().into_shared();
    bootstrap(&db, hw.as_ref()).await;

    let (dispatch, tasks) = dispatch::spawn(db.clone(), &queues);
    let (tx, rx) = mpsc::channel(queues.server_request);

    let server = SflowServer::new(db.clone(), hw, capture, dispatch.clone(), queues);
    let join = tokio::spawn(server.run(rx, tasks));

    (ServerHandle { tx, db, dispatch }, join)
}

/// Configuration surface of the daemon.
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::Sender<ServerRequest>,
    db: SharedDb,
    dispatch: DispatchHandle,
}

impl ServerHandle {
    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> ServerRequest) -> SflowResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SflowError::ChannelClosed("server"))?;
        rx.await.map_err(|_| SflowError::ChannelClosed("server reply"))?
    }

    pub async fn create_global(&self, obj: SflowGlobal) -> SflowResult<()> {
        self.call(|r| ServerRequest::CreateGlobal(obj, r)).await
    }

    pub async fn update_global(&self, obj: SflowGlobal) -> SflowResult<()> {
        self.call(|r| ServerRequest::UpdateGlobal(obj, r)).await
    }

    pub async fn delete_global(&self) -> SflowResult<()> {
        self.call(ServerRequest::DeleteGlobal).await
    }

    pub async fn create_collector(&self, obj: SflowCollector) -> SflowResult<()> {
        self.call(|r| ServerRequest::CreateCollector(obj, r)).await
    }

    pub async fn update_collector(&self, obj: SflowCollector) -> SflowResult<()> {
        self.call(|r| ServerRequest::UpdateCollector(obj, r)).await
    }

    pub async fn delete_collector(&self, ip_addr: &str) -> SflowResult<()> {
        let ip_addr = ip_addr.to_string();
        self.call(|r| ServerRequest::DeleteCollector(ip_addr, r))
            .await
    }

    pub async fn create_intf(&self, obj: SflowIntf) -> SflowResult<()> {
        self.call(|r| ServerRequest::CreateIntf(obj, r)).await
    }

    pub async fn update_intf(&self, obj: SflowIntf) -> SflowResult<()> {
        self.call(|r| ServerRequest::UpdateIntf(obj, r)).await
    }

    pub async fn delete_intf(&self, intf_ref: &str) -> SflowResult<()> {
        let intf_ref = intf_ref.to_string();
        self.call(|r| ServerRequest::DeleteIntf(intf_ref, r)).await
    }

    pub fn get_global(&self) -> Option<SflowGlobal> {
        self.db.read().global.as_ref().map(|g| g.to_object())
    }

    pub fn get_collector_state(&self, ip_addr: &str) -> SflowResult<SflowCollectorState> {
        collector::collector_state(&self.db.read(), ip_addr)
    }

    pub fn get_bulk_collector_state(
        &self,
        from_index: usize,
        count: usize,
    ) -> SflowResult<BulkInfo<SflowCollectorState>> {
        collector::bulk_collector_state(&self.db.read(), from_index, count)
    }

    pub fn get_intf_state(&self, intf_ref: &str) -> SflowResult<SflowIntfState> {
        intf::intf_state(&self.db.read(), intf_ref)
    }

    pub fn get_bulk_intf_state(
        &self,
        from_index: usize,
        count: usize,
    ) -> SflowResult<BulkInfo<SflowIntfState>> {
        intf::bulk_intf_state(&self.db.read(), from_index, count)
    }

    pub async fn fanout_stats(&self) -> SflowResult<FanoutStats> {
        self.dispatch.fanout_stats().await
    }

    pub async fn aggregation_stats(&self) -> SflowResult<AggregationStats> {
        self.dispatch.aggregation_stats().await
    }

    /// Stops every task and the dispatch loops, then returns.
    pub async fn shutdown(&self) -> SflowResult<()> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(ServerRequest::Shutdown(ack))
            .await
            .map_err(|_| SflowError::ChannelClosed("server"))?;
        rx.await
            .map_err(|_| SflowError::ChannelClosed("server shutdown ack"))?;
        debug!("sflowd server shutdown acknowledged");
        Ok(())
    }
}
