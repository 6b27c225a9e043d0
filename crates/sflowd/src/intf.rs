//! Interface sampling manager.
//!
//! Interfaces are keyed by the ifIndex their operator-facing name resolves to
//! in the bootstrap netdev map. Starting an interface spawns its
//! [`SamplingTask`], waits for the capture to open, then enables sampling and
//! programs the rate in hardware. Any failure tears the task back down.

use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::db::{InterfaceEntry, InterfaceTask, SflowDb, TaskHandle};
use crate::error::{SflowError, SflowResult};
use crate::intf_poller::SamplingTask;
use crate::server::SflowServer;
use crate::types::{AdminState, BulkInfo, IfIndex, InterfaceConfig, SflowIntf, SflowIntfState};

impl SflowServer {
    fn parse_intf(&self, op: &str, obj: &SflowIntf) -> SflowResult<InterfaceConfig> {
        let fail = |reason: &str| SflowError::validation(format!("{} SflowIntf failed. {}", op, reason));

        let if_index = self
            .db
            .read()
            .resolve_intf_ref(&obj.intf_ref)
            .ok_or_else(|| fail("Invalid IntfRef value provided"))?;
        let admin_state = AdminState::parse(&obj.admin_state)
            .ok_or_else(|| fail("Invalid AdminState value provided"))?;
        if obj.sampling_rate < 0 {
            return Err(fail("Invalid SamplingRate value provided"));
        }

        Ok(InterfaceConfig {
            if_index,
            intf_ref: obj.intf_ref.clone(),
            admin_state,
            sampling_rate: obj.sampling_rate as u32,
        })
    }

    pub(crate) fn validate_create_intf(&self, obj: &SflowIntf) -> SflowResult<InterfaceConfig> {
        if self.db.read().global.is_none() {
            return Err(SflowError::validation(
                "Create SflowIntf failed. Sflow global object not created",
            ));
        }
        let config = self.parse_intf("Create", obj)?;
        if self.db.read().interfaces.contains_key(&config.if_index) {
            return Err(SflowError::validation(
                "Create SflowIntf failed. Interface configuration already exists",
            ));
        }
        Ok(config)
    }

    /// Stores the interface and starts sampling when allowed. A start failure
    /// is returned but the interface stays configured, oper-down.
    #[instrument(skip_all, fields(intf = %obj.intf_ref))]
    pub(crate) async fn create_intf(&self, obj: &SflowIntf) -> SflowResult<()> {
        let config = self.validate_create_intf(obj)?;
        let if_index = config.if_index;
        let start = {
            let mut db = self.db.write();
            let start = db.global_admin_up() && config.admin_state.is_up();
            db.insert_interface(InterfaceEntry::new(config));
            start
        };
        info!(if_index, "SflowIntf created");

        if start {
            self.start_interface(if_index).await?;
        }
        Ok(())
    }

    pub(crate) fn validate_update_intf(&self, obj: &SflowIntf) -> SflowResult<InterfaceConfig> {
        let config = self.parse_intf("Update", obj)?;
        if !self.db.read().interfaces.contains_key(&config.if_index) {
            return Err(SflowError::validation(
                "Update SflowIntf failed. Interface configuration does not exist",
            ));
        }
        Ok(config)
    }

    /// An admin state change restarts the task while global admin is UP. A
    /// rate change on a running task is pushed to hardware in place; the new
    /// rate is kept even if hardware rejects it.
    #[instrument(skip_all, fields(intf = %obj.intf_ref))]
    pub(crate) async fn update_intf(&self, obj: &SflowIntf) -> SflowResult<()> {
        let new = self.validate_update_intf(obj)?;
        let if_index = new.if_index;

        let (admin_changed, rate_changed, running, global_up) = {
            let mut db = self.db.write();
            let global_up = db.global_admin_up();
            let Some(entry) = db.interfaces.get_mut(&if_index) else {
                return Err(SflowError::not_found("SflowIntf", new.intf_ref.clone()));
            };
            let admin_changed = entry.config.admin_state != new.admin_state;
            let rate_changed = entry.config.sampling_rate != new.sampling_rate;
            entry.config = new.clone();
            (admin_changed, rate_changed, entry.task.is_some(), global_up)
        };
        info!(
            if_index,
            admin_state = new.admin_state.as_str(),
            sampling_rate = new.sampling_rate,
            "SflowIntf updated"
        );

        if admin_changed && global_up {
            self.stop_interface(if_index).await;
            if new.admin_state.is_up() {
                self.start_interface(if_index).await?;
            }
        } else if rate_changed && running {
            self.hw.set_sampling_rate(if_index, new.sampling_rate).await?;
        }
        Ok(())
    }

    pub(crate) fn validate_delete_intf(&self, intf_ref: &str) -> SflowResult<IfIndex> {
        let db = self.db.read();
        let if_index = db.resolve_intf_ref(intf_ref).ok_or_else(|| {
            SflowError::validation("Delete SflowIntf failed. Invalid IntfRef value provided")
        })?;
        if !db.interfaces.contains_key(&if_index) {
            return Err(SflowError::validation(
                "Delete SflowIntf failed. Interface configuration does not exist",
            ));
        }
        Ok(if_index)
    }

    #[instrument(skip(self))]
    pub(crate) async fn delete_intf(&self, intf_ref: &str) -> SflowResult<()> {
        let if_index = self.validate_delete_intf(intf_ref)?;
        self.stop_interface(if_index).await;
        self.db.write().remove_interface(if_index);
        info!(if_index, "SflowIntf deleted");
        Ok(())
    }

    /// Spawns the sampling task, waits for its init result, then enables
    /// sampling and sets the rate. No-op if the interface is already running.
    pub(crate) async fn start_interface(&self, if_index: IfIndex) -> SflowResult<()> {
        let (config, stats, device, poll_seconds) = {
            let db = self.db.read();
            let entry = db
                .interfaces
                .get(&if_index)
                .ok_or_else(|| SflowError::not_found("SflowIntf", if_index.to_string()))?;
            if entry.task.is_some() {
                return Ok(());
            }
            let device = db
                .netdevs
                .get(&if_index)
                .map(|n| n.netdev_name.clone())
                .unwrap_or_else(|| entry.config.intf_ref.clone());
            let poll_seconds = db.global.as_ref().map_or(0, |g| g.counter_poll_interval);
            (entry.config.clone(), entry.stats.clone(), device, poll_seconds)
        };

        let (poll_tx, poll_rx) = watch::channel(poll_seconds);
        let cancel = CancellationToken::new();
        let task = SamplingTask {
            if_index,
            intf_ref: config.intf_ref.clone(),
            device,
            capture: self.capture.clone(),
            hw: self.hw.clone(),
            flow_tx: self.dispatch.flow_sender(),
            counter_tx: self.dispatch.counter_sender(),
            stats,
            cancel: cancel.clone(),
            poll_interval: poll_rx,
        };

        let (init_tx, init_rx) = oneshot::channel();
        let join = tokio::spawn(task.run(init_tx));
        let init = init_rx
            .await
            .unwrap_or_else(|_| Err(SflowError::ChannelClosed("interface init")));
        if let Err(e) = init {
            let _ = join.await;
            return Err(e);
        }
        let handle = TaskHandle { cancel, join };

        if let Err(e) = self.hw.enable_sampling(if_index).await {
            handle.stop().await;
            return Err(e);
        }
        if let Err(e) = self.hw.set_sampling_rate(if_index, config.sampling_rate).await {
            handle.stop().await;
            self.disable_sampling(if_index).await;
            return Err(e);
        }

        let orphan = {
            let mut db = self.db.write();
            match db.interfaces.get_mut(&if_index) {
                Some(entry) => {
                    entry.task = Some(InterfaceTask {
                        handle,
                        poll_interval: poll_tx,
                    });
                    None
                }
                None => Some(handle),
            }
        };
        if let Some(handle) = orphan {
            handle.stop().await;
            self.disable_sampling(if_index).await;
            return Err(SflowError::not_found("SflowIntf", if_index.to_string()));
        }

        info!(if_index, sampling_rate = config.sampling_rate, "Interface sampling started");
        Ok(())
    }

    /// Cancels the task, waits for it to exit, then disables sampling in
    /// hardware. No-op if the interface is not running.
    pub(crate) async fn stop_interface(&self, if_index: IfIndex) {
        let task = self
            .db
            .write()
            .interfaces
            .get_mut(&if_index)
            .and_then(|entry| entry.task.take());
        let Some(task) = task else {
            return;
        };

        task.handle.stop().await;
        self.disable_sampling(if_index).await;
        info!(if_index, "Interface sampling stopped");
    }

    async fn disable_sampling(&self, if_index: IfIndex) {
        if let Err(e) = self.hw.disable_sampling(if_index).await {
            warn!(if_index, error = %e, "Failed to disable sampling");
        }
    }
}

fn state_of(entry: &InterfaceEntry) -> SflowIntfState {
    SflowIntfState {
        intf_ref: entry.config.intf_ref.clone(),
        oper_state: entry.stats.oper_state().as_str().to_string(),
        num_sflow_samples_exported: entry.stats.samples(),
    }
}

pub fn intf_state(db: &SflowDb, intf_ref: &str) -> SflowResult<SflowIntfState> {
    db.resolve_intf_ref(intf_ref)
        .and_then(|if_index| db.interfaces.get(&if_index))
        .map(state_of)
        .ok_or_else(|| {
            SflowError::validation("Get SflowIntfState failed. Invalid IntfRef key provided")
        })
}

/// One page of interface states in creation order.
pub fn bulk_intf_state(
    db: &SflowDb,
    from_index: usize,
    count: usize,
) -> SflowResult<BulkInfo<SflowIntfState>> {
    let (keys, end_index, more) = db.interface_keys.page(from_index, count)?;
    let items = keys
        .iter()
        .filter_map(|if_index| db.interfaces.get(if_index))
        .map(state_of)
        .collect();
    Ok(BulkInfo {
        items,
        end_index,
        more,
    })
}
