//! Global controller.
//!
//! The singleton GlobalConfig gates every task: nothing runs unless its own
//! admin state and the global admin state are both UP.

use std::net::IpAddr;
use tracing::{debug, info, instrument};

use crate::error::{SflowError, SflowResult};
use crate::server::SflowServer;
use crate::tables::limits::{MAX_UDP_DATAGRAM_SIZE, SFLOW_PKT_MAX_SAMPLED_SIZE};
use crate::types::{AdminState, GlobalConfig, GlobalUpdateMask, SflowGlobal};

/// Validates every field of `obj`. `op` prefixes the error message.
fn parse_global(op: &str, obj: &SflowGlobal) -> SflowResult<GlobalConfig> {
    let fail = |reason: &str| SflowError::validation(format!("{} SflowGlobal failed. {}", op, reason));

    let admin_state =
        AdminState::parse(&obj.admin_state).ok_or_else(|| fail("Invalid AdminState value provided"))?;
    let agent_address: IpAddr = obj
        .agent_ip_addr
        .parse()
        .map_err(|_| fail("Invalid agent ip address attribute value provided"))?;
    if !(0..=SFLOW_PKT_MAX_SAMPLED_SIZE).contains(&obj.max_sampled_size) {
        return Err(fail("Invalid MaxSampledSize value provided"));
    }
    if obj.counter_poll_interval < 0 {
        return Err(fail("Invalid CounterPollInterval value provided"));
    }
    if !(0..=MAX_UDP_DATAGRAM_SIZE).contains(&obj.max_datagram_size) {
        return Err(fail("Invalid MaxDatagramSize value provided"));
    }

    Ok(GlobalConfig {
        vrf: obj.vrf.clone(),
        admin_state,
        agent_address,
        max_sampled_size: obj.max_sampled_size as u32,
        counter_poll_interval: obj.counter_poll_interval as u32,
        max_datagram_size: obj.max_datagram_size as u32,
    })
}

impl SflowServer {
    pub(crate) fn validate_create_global(&self, obj: &SflowGlobal) -> SflowResult<GlobalConfig> {
        {
            let db = self.db.read();
            if db.bootstrap_failed {
                return Err(SflowError::validation(
                    "Create SflowGlobal failed. Sflow infrastructure not initialized",
                ));
            }
            if db.global.is_some() {
                return Err(SflowError::validation(
                    "Create SflowGlobal failed. Sflow global object already exists",
                ));
            }
        }
        parse_global("Create", obj)
    }

    #[instrument(skip_all, fields(admin_state = %obj.admin_state, agent = %obj.agent_ip_addr))]
    pub(crate) async fn create_global(&self, obj: &SflowGlobal) -> SflowResult<()> {
        let config = self.validate_create_global(obj)?;
        let agent_address = config.agent_address;
        self.db.write().global = Some(config);

        self.dispatch.rebind_encoder(agent_address).await?;
        info!("SflowGlobal created");
        Ok(())
    }

    pub(crate) fn validate_update_global(&self, obj: &SflowGlobal) -> SflowResult<GlobalConfig> {
        if self.db.read().global.is_none() {
            return Err(SflowError::validation(
                "Update SflowGlobal failed, global object not created yet",
            ));
        }
        parse_global("Update", obj)
    }

    /// Applies `obj` and runs the side effects of each changed field.
    #[instrument(skip_all, fields(admin_state = %obj.admin_state, agent = %obj.agent_ip_addr))]
    pub(crate) async fn update_global(&self, obj: &SflowGlobal) -> SflowResult<()> {
        let new = self.validate_update_global(obj)?;
        let old = {
            let mut db = self.db.write();
            db.global.replace(new.clone())
        };
        let Some(old) = old else {
            return Err(SflowError::not_found("SflowGlobal", "global"));
        };

        let mask = GlobalUpdateMask::between(&old, &new);
        if mask.is_empty() {
            debug!("SflowGlobal unchanged");
            return Ok(());
        }

        if mask.contains(GlobalUpdateMask::AGENT_ADDRESS) {
            self.dispatch.rebind_encoder(new.agent_address).await?;
        }
        if mask.contains(GlobalUpdateMask::COUNTER_POLL_INTERVAL) {
            self.push_poll_interval(new.counter_poll_interval);
        }
        if mask.contains(GlobalUpdateMask::ADMIN_STATE) {
            if new.admin_state.is_up() {
                info!("Global admin state UP, starting tasks");
                self.start_all().await;
            } else {
                info!("Global admin state DOWN, stopping tasks");
                self.stop_all().await;
            }
        }

        info!("SflowGlobal updated");
        Ok(())
    }

    /// Retunes the counter poller of every running interface task.
    fn push_poll_interval(&self, seconds: u32) {
        let db = self.db.read();
        for entry in db.interfaces.values() {
            if let Some(task) = &entry.task {
                task.poll_interval.send_replace(seconds);
            }
        }
    }

    pub(crate) fn validate_delete_global(&self) -> SflowResult<()> {
        let db = self.db.read();
        if db.global.is_none() {
            return Err(SflowError::validation(
                "Delete SflowGlobal failed. Sflow global object not created",
            ));
        }
        if !db.collectors.is_empty() {
            return Err(SflowError::validation(
                "Delete SflowGlobal failed. Please delete all sflow collector config before deleting SflowGlobal",
            ));
        }
        if !db.interfaces.is_empty() {
            return Err(SflowError::validation(
                "Delete SflowGlobal failed. Please delete all sflow interface config before deleting SflowGlobal",
            ));
        }
        Ok(())
    }

    #[instrument(skip_all)]
    pub(crate) async fn delete_global(&self) -> SflowResult<()> {
        self.validate_delete_global()?;
        self.db.write().global = None;
        self.dispatch.clear_encoder().await?;
        info!("SflowGlobal deleted");
        Ok(())
    }
}
