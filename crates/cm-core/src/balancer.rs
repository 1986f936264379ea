/*
 * SPDX-License-Identifier: Apache-2.0
 */

//! Service balancer: a placement pass over a batch of `RunServiceRequest`s.
//! Six-step pipeline per instance (static filter, active filter, capacity
//! filter, top-priority filter, select node, reserve), preceded by a
//! unit-wide storage/state quota pre-check and a policy-pinning pre-pass.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cm_model::ident::{InstanceIdent, NodeId};
use cm_model::instance::{InstanceRunState, InstanceStatus, RunServiceRequest};
use cm_model::service::{BalancingPolicy, ServiceConfig};
use cm_model::CmError;

use cm_storage::{ImageProvider, NetworkManager};
use cm_storage::network::NetworkInstanceData;

use crate::instance::InstanceManager;
use crate::node_handler::NodeHandler;

pub struct Balancer {
    image_provider: Arc<dyn ImageProvider>,
    network_manager: Arc<dyn NetworkManager>,
    instance_manager: Arc<InstanceManager>,
}

/// Result of a placement pass: the per-instance status to report upward,
/// plus the per-node stop/force-restart bookkeeping the Launcher needs to
/// dispatch `StartInstances`.
#[derive(Debug, Default)]
pub struct PlacementOutcome {
    pub statuses: Vec<InstanceStatus>,
    pub stop: BTreeMap<NodeId, Vec<InstanceIdent>>,
    pub force_restart: BTreeMap<NodeId, bool>,
}

impl Balancer {
    pub fn new(
        image_provider: Arc<dyn ImageProvider>,
        network_manager: Arc<dyn NetworkManager>,
        instance_manager: Arc<InstanceManager>,
    ) -> Self {
        Self {
            image_provider,
            network_manager,
            instance_manager,
        }
    }

    pub async fn place(
        &self,
        nodes: &mut BTreeMap<NodeId, NodeHandler>,
        requests: &[RunServiceRequest],
    ) -> PlacementOutcome {
        let previous_on_node: BTreeMap<NodeId, BTreeSet<InstanceIdent>> = {
            let mut map = BTreeMap::new();
            for node_id in nodes.keys() {
                let prior: BTreeSet<_> = self
                    .instance_manager
                    .instances_on_node(node_id)
                    .await
                    .into_iter()
                    .map(|i| i.ident)
                    .collect();
                map.insert(node_id.clone(), prior);
            }
            map
        };

        let mut statuses = Vec::with_capacity(requests.len());
        let mut pending_network: Vec<(InstanceIdent, NodeId, cm_model::ident::NetworkId)> = Vec::new();

        for request in requests {
            match self.place_one(nodes, request).await {
                Ok((node_id, networks)) => {
                    for network_id in networks {
                        pending_network.push((request.ident.clone(), node_id.clone(), network_id));
                    }
                    statuses.push(InstanceStatus {
                        ident: request.ident.clone(),
                        node_id: Some(node_id),
                        state: InstanceRunState::Active,
                        error: None,
                    });
                }
                Err(err) => {
                    tracing::warn!(instance = %request.ident, error = %err, "placement failed");
                    statuses.push(InstanceStatus {
                        ident: request.ident.clone(),
                        node_id: None,
                        state: InstanceRunState::Failed,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        for (ident, node_id, network_id) in pending_network {
            let data = NetworkInstanceData::default();
            match self
                .network_manager
                .prepare_instance_network_parameters(&ident, &network_id, &node_id, &data)
                .await
            {
                Ok(params) => {
                    if let Some(node) = nodes.get_mut(&node_id) {
                        node.update_network_params(&ident, params);
                    }
                }
                Err(err) => {
                    tracing::warn!(instance = %ident, network = %network_id, error = %err, "network preparation failed");
                }
            }
        }

        let mut outcome = PlacementOutcome {
            statuses,
            ..Default::default()
        };
        for (node_id, node) in nodes.iter() {
            let now_on_node: BTreeSet<_> = node.scheduled_instances().iter().map(|i| i.ident.clone()).collect();
            let prior = previous_on_node.get(node_id).cloned().unwrap_or_default();
            let stop: Vec<_> = prior.difference(&now_on_node).cloned().collect();
            for ident in &stop {
                if let Err(err) = self.instance_manager.cache_instance(ident).await {
                    tracing::warn!(instance = %ident, error = %err, "failed to cache displaced instance");
                }
            }
            outcome.force_restart.insert(node_id.clone(), !stop.is_empty());
            outcome.stop.insert(node_id.clone(), stop);
        }
        outcome
    }

    async fn place_one(
        &self,
        nodes: &mut BTreeMap<NodeId, NodeHandler>,
        request: &RunServiceRequest,
    ) -> Result<(NodeId, Vec<cm_model::ident::NetworkId>), CmError> {
        let service = self
            .image_provider
            .get_service_info(&request.ident.item_id)
            .await
            .map_err(|_| CmError::not_found(format!("service {} not found", request.ident.item_id)))?;
        let layers = self.image_provider.get_layers(&service.layer_digests).await?;

        self.check_unit_quota(nodes, &service.config)?;

        let pinned = self.pinned_node(nodes, request, &service.config).await;
        let node_id = match pinned {
            Some(node_id) => node_id,
            None => self.select_node(nodes, &service.config)?,
        };

        let node = nodes.get(&node_id).expect("selected node exists in map");
        let info = self
            .instance_manager
            .setup_instance(request, node, &service)
            .await?;

        let node = nodes.get_mut(&node_id).expect("selected node exists in map");
        node.add_run_request(info, service.clone(), layers);

        Ok((node_id, request.networks.clone()))
    }

    /// Request size > sum of partition capacity across the unit fails
    /// immediately, before any per-node filter runs.
    fn check_unit_quota(&self, nodes: &BTreeMap<NodeId, NodeHandler>, config: &ServiceConfig) -> Result<(), CmError> {
        if let Some(quota) = config.state_quota {
            let total: u64 = nodes.values().map(|n| n.partition_size("state")).sum();
            if quota > total {
                return Err(CmError::no_memory("requested state quota exceeds unit-wide state capacity"));
            }
        }
        if let Some(quota) = config.storage_quota {
            let total: u64 = nodes.values().map(|n| n.partition_size("storage")).sum();
            if quota > total {
                return Err(CmError::no_memory("requested storage quota exceeds unit-wide storage capacity"));
            }
        }
        Ok(())
    }

    /// If balancing is disabled and the instance's previously assigned node
    /// still passes the static/active/capacity filters, pin to it.
    async fn pinned_node(
        &self,
        nodes: &BTreeMap<NodeId, NodeHandler>,
        request: &RunServiceRequest,
        config: &ServiceConfig,
    ) -> Option<NodeId> {
        if config.balancing_policy != BalancingPolicy::Disabled {
            return None;
        }
        let current = self.instance_manager.get_instance(&request.ident).await?;
        let node = nodes.get(&current.node_id)?;
        if passes_static_filter(node, config) && node.info().state.is_active() && has_capacity(node, config) {
            Some(current.node_id)
        } else {
            None
        }
    }

    fn select_node(&self, nodes: &BTreeMap<NodeId, NodeHandler>, config: &ServiceConfig) -> Result<NodeId, CmError> {
        let all: Vec<&NodeHandler> = nodes.values().collect();

        let runtime_ok: Vec<&NodeHandler> = all
            .iter()
            .copied()
            .filter(|n| n.info().declared_runtimes.contains(&config.runner))
            .collect();
        if runtime_ok.is_empty() {
            return Err(CmError::not_found("no nodes with required runners"));
        }

        let label_ok: Vec<&NodeHandler> = runtime_ok
            .into_iter()
            .filter(|n| config.labels.iter().all(|l| n.config().labels.contains(l)))
            .collect();
        if label_ok.is_empty() {
            return Err(CmError::not_found("no nodes with instance labels"));
        }

        let resource_ok: Vec<&NodeHandler> = label_ok
            .into_iter()
            .filter(|n| config.resources.iter().all(|r| n.info().declared_resources.contains(r)))
            .collect();
        if resource_ok.is_empty() {
            return Err(CmError::not_found("no nodes with required resources"));
        }

        let device_ok: Vec<&NodeHandler> = resource_ok
            .into_iter()
            .filter(|n| n.has_devices(&config.devices))
            .collect();
        if device_ok.is_empty() {
            return Err(CmError::not_found("no nodes with required devices"));
        }

        let active_ok: Vec<&NodeHandler> = device_ok.into_iter().filter(|n| n.info().state.is_active()).collect();
        if active_ok.is_empty() {
            return Err(CmError::not_found("no online nodes available"));
        }

        let capacity_ok: Vec<&NodeHandler> = active_ok.into_iter().filter(|n| has_capacity(n, config)).collect();
        if capacity_ok.is_empty() {
            return Err(CmError::failed("no nodes with sufficient CPU or RAM headroom"));
        }

        let max_priority = capacity_ok.iter().map(|n| n.config().priority).max().expect("non-empty");
        let mut top: Vec<&NodeHandler> = capacity_ok
            .into_iter()
            .filter(|n| n.config().priority == max_priority)
            .collect();
        top.sort_by(|a, b| a.node_id().cmp(b.node_id()));
        Ok(top[0].node_id().clone())
    }
}

fn passes_static_filter(node: &NodeHandler, config: &ServiceConfig) -> bool {
    node.info().declared_runtimes.contains(&config.runner)
        && config.labels.iter().all(|l| node.config().labels.contains(l))
        && config
            .resources
            .iter()
            .all(|r| node.info().declared_resources.contains(r))
        && node.has_devices(&config.devices)
}

fn has_capacity(node: &NodeHandler, config: &ServiceConfig) -> bool {
    node.available_cpu() >= node.requested_cpu(config)
        && node.available_ram() >= node.requested_ram(config)
        && node.available_state() >= node.req_state_size(config)
        && node.available_storage() >= node.req_storage_size(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_model::ident::InstanceIdent;
    use cm_model::node::{NodeConfig, NodeInfo, NodeState};
    use cm_model::service::{ServiceDevice, ServiceInfo};
    use cm_storage::test_util::{
        InMemoryFsPlatform, InMemoryFsWatcher, InMemoryStorage, RecordingSender, SequentialNetworkManager,
        StaticImageProvider,
    };
    use std::collections::BTreeMap as Map;

    fn node(node_id: &str, priority: i64, max_dmips: u64, total_ram: u64) -> NodeHandler {
        let mut config = NodeConfig::default();
        config.priority = priority;
        NodeHandler::init(
            NodeInfo {
                node_id: node_id.to_string(),
                node_type: "generic".to_string(),
                max_dmips,
                total_ram,
                partitions: Map::from([("state".to_string(), 4096), ("storage".to_string(), 4096)]),
                declared_resources: vec![],
                declared_runtimes: vec!["runc".to_string()],
                declared_devices: vec![],
                state: NodeState::Online,
            },
            config,
            true,
            false,
        )
    }

    fn service(id: &str, cpu_quota: Option<u64>) -> ServiceInfo {
        ServiceInfo {
            service_id: id.to_string(),
            version: "1".to_string(),
            layer_digests: vec![],
            config: ServiceConfig {
                runner: "runc".to_string(),
                labels: vec![],
                resources: vec![],
                devices: vec![],
                cpu_quota,
                ram_quota: None,
                state_quota: None,
                storage_quota: None,
                balancing_policy: Default::default(),
                networks: vec![],
                exposed_ports: vec![],
            },
        }
    }

    fn balancer(provider: Arc<StaticImageProvider>) -> Balancer {
        let storage_state = crate::storage_state::StorageState::new(
            crate::storage_state::Config {
                storage_dir: "/tmp/cm-balancer-test/storages".to_string(),
                state_dir: "/tmp/cm-balancer-test/states".to_string(),
            },
            Arc::new(InMemoryFsPlatform::new()),
            Arc::new(InMemoryFsWatcher::new()),
            Arc::new(RecordingSender::new()),
        );
        let instance_manager = Arc::new(InstanceManager::new(
            Arc::new(InMemoryStorage::new()),
            storage_state,
            crate::instance::Config::default(),
        ));
        Balancer::new(provider, Arc::new(SequentialNetworkManager::new()), instance_manager)
    }

    #[tokio::test]
    async fn picks_highest_priority_then_lowest_node_id() {
        let provider = Arc::new(StaticImageProvider::new());
        provider.add_service(service("svc", None));
        let b = balancer(provider);

        let mut nodes = BTreeMap::new();
        nodes.insert("b".to_string(), node("b", 10, 1000, 1000));
        nodes.insert("a".to_string(), node("a", 10, 1000, 1000));
        nodes.insert("c".to_string(), node("c", 5, 1000, 1000));

        let request = RunServiceRequest {
            ident: InstanceIdent::new("svc", "subj", 0),
            labels: vec![],
            priority: 0,
            networks: vec![],
        };
        let outcome = b.place(&mut nodes, &[request]).await;
        assert_eq!(outcome.statuses[0].node_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn unknown_service_fails_not_found() {
        let provider = Arc::new(StaticImageProvider::new());
        let b = balancer(provider);
        let mut nodes = BTreeMap::new();
        nodes.insert("a".to_string(), node("a", 0, 1000, 1000));

        let request = RunServiceRequest {
            ident: InstanceIdent::new("missing", "subj", 0),
            labels: vec![],
            priority: 0,
            networks: vec![],
        };
        let outcome = b.place(&mut nodes, &[request]).await;
        assert_eq!(outcome.statuses[0].state, InstanceRunState::Failed);
    }

    #[tokio::test]
    async fn insufficient_cpu_fails_with_capacity_message() {
        let provider = Arc::new(StaticImageProvider::new());
        provider.add_service(service("svc", Some(2000)));
        let b = balancer(provider);
        let mut nodes = BTreeMap::new();
        nodes.insert("a".to_string(), node("a", 0, 1000, 1000));

        let request = RunServiceRequest {
            ident: InstanceIdent::new("svc", "subj", 0),
            labels: vec![],
            priority: 0,
            networks: vec![],
        };
        let outcome = b.place(&mut nodes, &[request]).await;
        assert_eq!(outcome.statuses[0].state, InstanceRunState::Failed);
    }

    #[test]
    fn missing_device_fails_static_filter() {
        let n = node("a", 0, 1000, 1000);
        let devices = vec![ServiceDevice { name: "gpu0".to_string() }];
        assert!(!n.has_devices(&devices));
    }
}
