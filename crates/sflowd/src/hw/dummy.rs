//! In-memory hardware plugin.
//!
//! Records every call and lets callers inject failures, so lifecycle paths
//! can be driven without a switch.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use super::SflowHw;
use crate::error::{SflowError, SflowResult};
use crate::types::{IfIndex, IntfCfgInfo, IntfCounters, NetdevInfo};

/// A call made against the plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HwCall {
    Enable(IfIndex),
    Disable(IfIndex),
    SetRate(IfIndex, u32),
}

#[derive(Debug, Default)]
struct State {
    netdevs: Vec<NetdevInfo>,
    enabled: HashSet<IfIndex>,
    rates: HashMap<IfIndex, u32>,
    counters: HashMap<String, IntfCounters>,
    calls: Vec<HwCall>,
    fail_list: bool,
    fail_enable: HashSet<IfIndex>,
    fail_rate: HashSet<IfIndex>,
    fail_counters: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct DummyHw {
    state: Mutex<State>,
}

impl DummyHw {
    pub fn new(netdevs: Vec<NetdevInfo>) -> Self {
        Self {
            state: Mutex::new(State {
                netdevs,
                ..Default::default()
            }),
        }
    }

    /// `count` front-panel ports named Ethernet0, Ethernet4, ... with
    /// ifIndex starting at 1.
    pub fn with_ports(count: i32) -> Self {
        let netdevs = (0..count)
            .map(|i| {
                let name = format!("Ethernet{}", i * 4);
                NetdevInfo {
                    if_index: i + 1,
                    intf_ref: name.clone(),
                    netdev_name: name,
                }
            })
            .collect();
        Self::new(netdevs)
    }

    pub fn calls(&self) -> Vec<HwCall> {
        self.state.lock().calls.clone()
    }

    pub fn is_enabled(&self, if_index: IfIndex) -> bool {
        self.state.lock().enabled.contains(&if_index)
    }

    pub fn rate(&self, if_index: IfIndex) -> Option<u32> {
        self.state.lock().rates.get(&if_index).copied()
    }

    pub fn set_counters(&self, intf_ref: &str, counters: IntfCounters) {
        self.state
            .lock()
            .counters
            .insert(intf_ref.to_string(), counters);
    }

    pub fn fail_list(&self, fail: bool) {
        self.state.lock().fail_list = fail;
    }

    pub fn fail_enable(&self, if_index: IfIndex, fail: bool) {
        toggle(&mut self.state.lock().fail_enable, if_index, fail);
    }

    pub fn fail_rate(&self, if_index: IfIndex, fail: bool) {
        toggle(&mut self.state.lock().fail_rate, if_index, fail);
    }

    pub fn fail_counters(&self, intf_ref: &str, fail: bool) {
        toggle(&mut self.state.lock().fail_counters, intf_ref.to_string(), fail);
    }
}

fn toggle<T: std::hash::Hash + Eq>(set: &mut HashSet<T>, item: T, on: bool) {
    if on {
        set.insert(item);
    } else {
        set.remove(&item);
    }
}

#[async_trait]
impl SflowHw for DummyHw {
    fn name(&self) -> &'static str {
        "dummy"
    }

    async fn list_monitorable_interfaces(&self) -> SflowResult<Vec<NetdevInfo>> {
        let state = self.state.lock();
        if state.fail_list {
            return Err(SflowError::Config(
                "interface discovery unavailable".to_string(),
            ));
        }
        Ok(state.netdevs.clone())
    }

    async fn enable_sampling(&self, if_index: IfIndex) -> SflowResult<()> {
        let mut state = self.state.lock();
        state.calls.push(HwCall::Enable(if_index));
        if state.fail_enable.contains(&if_index) {
            return Err(SflowError::hardware(
                "enable_sampling",
                if_index,
                "injected failure",
            ));
        }
        state.enabled.insert(if_index);
        Ok(())
    }

    async fn disable_sampling(&self, if_index: IfIndex) -> SflowResult<()> {
        let mut state = self.state.lock();
        state.calls.push(HwCall::Disable(if_index));
        state.enabled.remove(&if_index);
        Ok(())
    }

    async fn set_sampling_rate(&self, if_index: IfIndex, rate: u32) -> SflowResult<()> {
        let mut state = self.state.lock();
        state.calls.push(HwCall::SetRate(if_index, rate));
        if state.fail_rate.contains(&if_index) {
            return Err(SflowError::hardware(
                "set_sampling_rate",
                if_index,
                "injected failure",
            ));
        }
        state.rates.insert(if_index, rate);
        Ok(())
    }

    async fn interface_counters(&self, intf_ref: &str) -> SflowResult<IntfCounters> {
        let state = self.state.lock();
        if state.fail_counters.contains(intf_ref) {
            return Err(SflowError::not_found("counters", intf_ref));
        }
        Ok(state.counters.get(intf_ref).copied().unwrap_or(IntfCounters {
            oper_up: true,
            ..Default::default()
        }))
    }

    async fn interface_cfg_info(&self, _intf_ref: &str) -> SflowResult<IntfCfgInfo> {
        Ok(IntfCfgInfo {
            speed: 100_000_000_000,
            full_duplex: true,
        })
    }
}
