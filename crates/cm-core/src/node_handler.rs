/*
 * SPDX-License-Identifier: Apache-2.0
 */

//! Per-node view: config, capabilities, live resource headroom, device
//! allocations, and the pending run-request bundle for a single placement
//! pass.

use std::collections::BTreeMap;

use cm_model::ident::{InstanceIdent, NodeId};
use cm_model::instance::InstanceInfo;
use cm_model::network::NetworkParameters;
use cm_model::node::{NodeConfig, NodeInfo, NodeMonitoringAverages};
use cm_model::service::{LayerInfo, ServiceConfig, ServiceDevice, ServiceInfo};
use cm_model::CmResult;

/// Services, layers and instances queued for dispatch on this node during
/// the current pass. The balancer only ever appends; it never mutates
/// existing entries within a pass.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub services: Vec<ServiceInfo>,
    pub layers: Vec<LayerInfo>,
    pub instances: Vec<InstanceInfo>,
}

pub struct NodeHandler {
    info: NodeInfo,
    is_local: bool,
    config: NodeConfig,
    monitoring: NodeMonitoringAverages,

    is_waiting: bool,
    available_cpu: u64,
    available_ram: u64,
    available_state: u64,
    available_storage: u64,
    /// Remaining share per device name; exclusive devices (`shared_count ==
    /// None`) start at 1 and drop to 0 after the first allocation.
    device_allocations: BTreeMap<String, i64>,

    run_request: RunRequest,
}

impl NodeHandler {
    pub fn init(info: NodeInfo, config: NodeConfig, is_local: bool, rebalancing: bool) -> Self {
        let mut handler = Self {
            info,
            is_local,
            config,
            monitoring: NodeMonitoringAverages::default(),
            is_waiting: true,
            available_cpu: 0,
            available_ram: 0,
            available_state: 0,
            available_storage: 0,
            device_allocations: BTreeMap::new(),
            run_request: RunRequest::default(),
        };
        handler.reset_device_allocations();
        handler.init_available_resources(rebalancing);
        handler
    }

    pub fn update_node_data(&mut self, monitoring: NodeMonitoringAverages, rebalancing: bool) {
        self.monitoring = monitoring;
        self.reset_device_allocations();
        self.init_available_resources(rebalancing);
        self.run_request = RunRequest::default();
    }

    fn reset_device_allocations(&mut self) {
        self.device_allocations.clear();
        for device in &self.info.declared_devices {
            let share = device.shared_count.map(|n| n as i64).unwrap_or(1);
            self.device_allocations.insert(device.name.clone(), share);
        }
    }

    /// `availableCPU = maxDMIPS - avgMonitored.cpu_non_aos`, likewise RAM.
    /// Under a rebalance also subtract CPU/RAM attributed to currently
    /// running Aos instances, so the balancer sees an empty headroom before
    /// re-adding the instances it re-chooses.
    fn init_available_resources(&mut self, rebalancing: bool) {
        let mut cpu = self.info.max_dmips.saturating_sub(self.monitoring.cpu_non_aos);
        let mut ram = self.info.total_ram.saturating_sub(self.monitoring.ram_non_aos);
        if rebalancing {
            cpu = cpu.saturating_sub(self.monitoring.cpu_aos);
            ram = ram.saturating_sub(self.monitoring.ram_aos);
        }
        self.available_cpu = cpu;
        self.available_ram = ram;
        self.available_state = self.partition_size("state");
        self.available_storage = self.partition_size("storage");
    }

    pub fn set_waiting(&mut self, waiting: bool) {
        self.is_waiting = waiting;
    }

    pub fn is_waiting(&self) -> bool {
        self.is_waiting
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn partition_size(&self, partition_type: &str) -> u64 {
        self.info.partition_size(partition_type)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: NodeConfig) {
        self.config = config;
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn node_id(&self) -> &NodeId {
        &self.info.node_id
    }

    pub fn scheduled_instances(&self) -> &[InstanceInfo] {
        &self.run_request.instances
    }

    pub fn run_request(&self) -> &RunRequest {
        &self.run_request
    }

    pub fn available_cpu(&self) -> u64 {
        self.available_cpu
    }

    pub fn available_ram(&self) -> u64 {
        self.available_ram
    }

    pub fn available_state(&self) -> u64 {
        self.available_state
    }

    pub fn available_storage(&self) -> u64 {
        self.available_storage
    }

    /// True iff every required device is declared on the node and has
    /// remaining share.
    pub fn has_devices(&self, devices: &[ServiceDevice]) -> bool {
        devices.iter().all(|d| {
            self.device_allocations
                .get(&d.name)
                .is_some_and(|remaining| *remaining > 0)
        })
    }

    fn clamp_resource(total: u64, quota: Option<u64>, ratio: f64) -> u64 {
        match quota {
            Some(q) => q.min(total),
            None => ((total as f64) * (ratio / 100.0)).floor() as u64,
        }
    }

    pub fn requested_cpu(&self, config: &ServiceConfig) -> u64 {
        let ratio = self
            .config
            .resource_ratios
            .map(|r| r.cpu)
            .unwrap_or(cm_model::node::DEFAULT_RESOURCE_RATIO);
        Self::clamp_resource(self.info.max_dmips, config.cpu_quota, ratio)
    }

    pub fn requested_ram(&self, config: &ServiceConfig) -> u64 {
        let ratio = self
            .config
            .resource_ratios
            .map(|r| r.ram)
            .unwrap_or(cm_model::node::DEFAULT_RESOURCE_RATIO);
        Self::clamp_resource(self.info.total_ram, config.ram_quota, ratio)
    }

    pub fn req_state_size(&self, config: &ServiceConfig) -> u64 {
        let total = self.partition_size("state");
        let ratio = self
            .config
            .resource_ratios
            .map(|r| r.state)
            .unwrap_or(cm_model::node::DEFAULT_RESOURCE_RATIO);
        Self::clamp_resource(total, config.state_quota, ratio)
    }

    pub fn req_storage_size(&self, config: &ServiceConfig) -> u64 {
        let total = self.partition_size("storage");
        let ratio = self
            .config
            .resource_ratios
            .map(|r| r.storage)
            .unwrap_or(cm_model::node::DEFAULT_RESOURCE_RATIO);
        Self::clamp_resource(total, config.storage_quota, ratio)
    }

    /// Appends to the per-node bundle, deducts CPU/RAM from headroom,
    /// decrements device allocations. The balancer calls this exactly once
    /// per placed instance; it never mutates entries already in the bundle.
    pub fn add_run_request(&mut self, instance: InstanceInfo, service: ServiceInfo, layers: Vec<LayerInfo>) {
        let cpu = self.requested_cpu(&service.config);
        let ram = self.requested_ram(&service.config);
        let state = self.req_state_size(&service.config);
        let storage = self.req_storage_size(&service.config);
        self.available_cpu = self.available_cpu.saturating_sub(cpu);
        self.available_ram = self.available_ram.saturating_sub(ram);
        self.available_state = self.available_state.saturating_sub(state);
        self.available_storage = self.available_storage.saturating_sub(storage);

        for device in &service.config.devices {
            if let Some(remaining) = self.device_allocations.get_mut(&device.name) {
                *remaining -= 1;
            }
        }

        self.run_request.services.push(service);
        self.run_request.layers.extend(layers);
        self.run_request.instances.push(instance);
    }

    pub fn update_network_params(&mut self, instance: &InstanceIdent, params: NetworkParameters) {
        if let Some(info) = self
            .run_request
            .instances
            .iter_mut()
            .find(|i| &i.ident == instance)
        {
            info.network = Some(params);
        }
    }

    /// Sort by `NodeConfig.priority` descending, tie-break by node id
    /// ascending. Nodes in non-online state are omitted.
    pub fn by_priority<'a>(nodes: impl IntoIterator<Item = &'a NodeHandler>) -> Vec<&'a NodeHandler> {
        let mut active: Vec<&NodeHandler> = nodes
            .into_iter()
            .filter(|n| n.info.state.is_active())
            .collect();
        active.sort_by(|a, b| {
            b.config
                .priority
                .cmp(&a.config.priority)
                .then_with(|| a.node_id().cmp(b.node_id()))
        });
        active
    }
}

/// Dispatches the accumulated run request to the node's runtime interface.
/// Kept as a free function rather than a method on [`NodeHandler`] so the
/// handler itself stays `Send`-friendly data with no collaborator reference.
pub async fn dispatch_run_request(
    runtime: &dyn cm_storage::NodeRuntime,
    node_id: &NodeId,
    stop: &[InstanceIdent],
    run_request: &RunRequest,
    force_restart: bool,
) -> CmResult<cm_storage::RunOutcome> {
    let start: Vec<_> = run_request
        .instances
        .iter()
        .cloned()
        .zip(run_request.services.iter().cloned())
        .map(|(instance, service)| (instance, service, run_request.layers.clone()))
        .collect();
    runtime.start_instances(node_id, stop, &start, force_restart).await
}
