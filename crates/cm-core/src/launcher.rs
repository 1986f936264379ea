/*
 * SPDX-License-Identifier: Apache-2.0
 */

//! Top-level controller: initializes per-node handlers from the node info
//! provider, runs placement passes under a single lock, and dispatches
//! start/stop batches to node runtimes with bounded concurrency.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;

use cm_model::ident::{InstanceIdent, NodeId};
use cm_model::instance::{InstanceStatus, RunServiceRequest};
use cm_model::limits::MAX_NUM_CONCURRENT_ITEMS;
use cm_model::node::NodeMonitoringAverages;
use cm_model::CmResult;

use cm_storage::{NodeInfoProvider, NodeRuntime, ResourceManager, RunStatusListener};

use crate::balancer::Balancer;
use crate::instance::InstanceManager;
use crate::node_handler::{self, NodeHandler, RunRequest};

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub nodes_connection_timeout: Duration,
    pub max_num_concurrent_items: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nodes_connection_timeout: Duration::from_secs(60),
            max_num_concurrent_items: MAX_NUM_CONCURRENT_ITEMS,
        }
    }
}

struct State {
    nodes: BTreeMap<NodeId, NodeHandler>,
    monitoring: BTreeMap<NodeId, NodeMonitoringAverages>,
    run_status: BTreeMap<InstanceIdent, InstanceStatus>,
    desired: Vec<RunServiceRequest>,
}

/// A single [`tokio::sync::Mutex`] protects nodes, run status, and the
/// current desired set. `RunInstances` holds it for the whole pass,
/// including dispatch, so at most one pass is ever in flight.
pub struct Launcher {
    config: Config,
    resource_manager: Arc<dyn ResourceManager>,
    node_info_provider: Arc<dyn NodeInfoProvider>,
    runtime: Arc<dyn NodeRuntime>,
    instance_manager: Arc<InstanceManager>,
    balancer: Balancer,
    listener: Mutex<Option<Arc<dyn RunStatusListener>>>,
    state: Mutex<State>,
}

impl Launcher {
    pub fn new(
        config: Config,
        resource_manager: Arc<dyn ResourceManager>,
        node_info_provider: Arc<dyn NodeInfoProvider>,
        runtime: Arc<dyn NodeRuntime>,
        instance_manager: Arc<InstanceManager>,
        balancer: Balancer,
    ) -> Self {
        Self {
            config,
            resource_manager,
            node_info_provider,
            runtime,
            instance_manager,
            balancer,
            listener: Mutex::new(None),
            state: Mutex::new(State {
                nodes: BTreeMap::new(),
                monitoring: BTreeMap::new(),
                run_status: BTreeMap::new(),
                desired: Vec::new(),
            }),
        }
    }

    pub async fn set_listener(&self, listener: Arc<dyn RunStatusListener>) {
        *self.listener.lock().await = Some(listener);
    }

    /// Loads persistent instances, then builds one [`NodeHandler`] per node
    /// known to the node info provider. Does not block on node readiness;
    /// callers that need a readiness gate should poll `get_node_info`
    /// themselves against `NodesConnectionTimeout`.
    pub async fn start(&self) -> CmResult<()> {
        self.instance_manager.load().await?;

        let node_ids = self.node_info_provider.get_all_node_ids().await?;
        let mut state = self.state.lock().await;
        for node_id in node_ids {
            let unit_info = self.node_info_provider.get_node_info(&node_id).await?;
            let node_config = self
                .resource_manager
                .get_node_config(&node_id, &unit_info.info.node_type)
                .await?;
            let handler = NodeHandler::init(unit_info.info, node_config, false, false);
            state.nodes.insert(node_id, handler);
        }
        Ok(())
    }

    /// Reports monitoring for a node, used to seed `NodeHandler`'s available
    /// headroom before the next placement pass (and replayed verbatim on a
    /// rebalance pass).
    pub async fn update_node_monitoring(&self, node_id: &NodeId, monitoring: NodeMonitoringAverages) {
        let mut state = self.state.lock().await;
        state.monitoring.insert(node_id.clone(), monitoring);
        if let Some(node) = state.nodes.get_mut(node_id) {
            node.update_node_data(monitoring, false);
        }
    }

    /// Runs a full placement pass and dispatches the resulting start/stop
    /// batches. Holds the launcher's lock for the whole pass, including
    /// dispatch, so a second call blocks until this one completes.
    pub async fn run_instances(&self, requests: &[RunServiceRequest], rebalancing: bool) -> Vec<InstanceStatus> {
        let mut state = self.state.lock().await;
        state.desired = requests.to_vec();

        if rebalancing {
            let monitoring = state.monitoring.clone();
            for (node_id, node) in state.nodes.iter_mut() {
                let m = monitoring.get(node_id).copied().unwrap_or_default();
                node.update_node_data(m, true);
            }
        }

        let outcome = self.balancer.place(&mut state.nodes, requests).await;

        let dispatch_items: Vec<(NodeId, Vec<InstanceIdent>, RunRequest, bool)> = state
            .nodes
            .iter()
            .filter_map(|(node_id, node)| {
                let stop = outcome.stop.get(node_id).cloned().unwrap_or_default();
                let force_restart = outcome.force_restart.get(node_id).copied().unwrap_or(false);
                let run_request = node.run_request().clone();
                if stop.is_empty() && run_request.instances.is_empty() {
                    None
                } else {
                    Some((node_id.clone(), stop, run_request, force_restart))
                }
            })
            .collect();

        let runtime = self.runtime.clone();
        let concurrency = self.config.max_num_concurrent_items.max(1);
        stream::iter(dispatch_items)
            .for_each_concurrent(concurrency, |(node_id, stop, run_request, force_restart)| {
                let runtime = runtime.clone();
                async move {
                    match node_handler::dispatch_run_request(runtime.as_ref(), &node_id, &stop, &run_request, force_restart).await
                    {
                        Ok(result) => {
                            if result.reboot_required {
                                tracing::info!(node_id = %node_id, "node reboot required after dispatch");
                            }
                        }
                        Err(err) => {
                            tracing::warn!(node_id = %node_id, error = %err, "dispatch to node runtime failed");
                        }
                    }
                }
            })
            .await;

        for status in &outcome.statuses {
            state.run_status.insert(status.ident.clone(), status.clone());
        }
        let snapshot: Vec<InstanceStatus> = state.run_status.values().cloned().collect();
        drop(state);

        if let Some(listener) = self.listener.lock().await.clone() {
            listener.on_run_status_changed(snapshot.clone()).await;
        }
        outcome.statuses
    }

    pub async fn rebalance(&self) -> Vec<InstanceStatus> {
        let current = self.state.lock().await.desired.clone();
        self.run_instances(&current, true).await
    }

    /// Merges an out-of-band per-instance status report (e.g. a runtime
    /// reporting an instance crashed after dispatch) into the global status
    /// set and forwards it to the listener.
    pub async fn on_status_changed(&self, status: InstanceStatus) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.run_status.insert(status.ident.clone(), status);
            state.run_status.values().cloned().collect::<Vec<_>>()
        };
        if let Some(listener) = self.listener.lock().await.clone() {
            listener.on_run_status_changed(snapshot).await;
        }
    }

    pub async fn node_ids(&self) -> Vec<NodeId> {
        self.state.lock().await.nodes.keys().cloned().collect()
    }

    /// Waits for every registered node to become ready, as reported by the
    /// node info provider, bounded by `NodesConnectionTimeout`.
    pub async fn wait_for_nodes_ready(&self) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.nodes_connection_timeout;
        loop {
            let ids = self.node_ids().await;
            let mut all_ready = true;
            for id in &ids {
                match self.node_info_provider.get_node_info(id).await {
                    Ok(info) => {
                        if !info.is_connected && info.info.state != cm_model::node::NodeState::Error {
                            all_ready = false;
                            break;
                        }
                    }
                    Err(_) => {
                        all_ready = false;
                        break;
                    }
                }
            }
            if all_ready || tokio::time::Instant::now() >= deadline {
                return all_ready;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Stop is a no-op beyond draining: `RunInstances` already awaits
    /// dispatch before releasing the lock, so taking the lock here is
    /// sufficient to guarantee no pass is in flight.
    pub async fn stop(&self) {
        let _ = self.state.lock().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_model::node::{NodeConfig, NodeInfo, NodeState};
    use cm_model::service::ServiceInfo;
    use cm_storage::test_util::{
        InMemoryFsPlatform, InMemoryFsWatcher, InMemoryStorage, RecordingNodeRuntime, RecordingRunStatusListener,
        RecordingSender, SequentialNetworkManager, StaticImageProvider, StaticResourceManager,
    };
    use std::collections::BTreeMap as Map;

    struct FixedNodeInfoProvider(Map<NodeId, cm_storage::UnitNodeInfo>);

    #[async_trait::async_trait]
    impl NodeInfoProvider for FixedNodeInfoProvider {
        async fn get_all_node_ids(&self) -> CmResult<Vec<NodeId>> {
            Ok(self.0.keys().cloned().collect())
        }

        async fn get_node_info(&self, node_id: &NodeId) -> CmResult<cm_storage::UnitNodeInfo> {
            self.0
                .get(node_id)
                .cloned()
                .ok_or_else(|| cm_model::CmError::not_found("no such node"))
        }

        async fn subscribe_listener(&self, _listener: Arc<dyn cm_storage::NodeInfoListener>) -> CmResult<()> {
            Ok(())
        }

        async fn unsubscribe_listener(&self, _listener: &Arc<dyn cm_storage::NodeInfoListener>) -> CmResult<()> {
            Ok(())
        }
    }

    fn unit_node_info(node_id: &str) -> cm_storage::UnitNodeInfo {
        cm_storage::UnitNodeInfo {
            info: NodeInfo {
                node_id: node_id.to_string(),
                node_type: "generic".to_string(),
                max_dmips: 1000,
                total_ram: 1000,
                partitions: Map::new(),
                declared_resources: vec![],
                declared_runtimes: vec!["runc".to_string()],
                declared_devices: vec![],
                state: NodeState::Online,
            },
            is_connected: true,
        }
    }

    fn launcher(provider: Arc<StaticImageProvider>, nodes: Vec<&str>) -> Launcher {
        let node_info_provider = Arc::new(FixedNodeInfoProvider(
            nodes.into_iter().map(|n| (n.to_string(), unit_node_info(n))).collect(),
        ));
        let storage_state = crate::storage_state::StorageState::new(
            crate::storage_state::Config {
                storage_dir: "/tmp/cm-launcher-test/storages".to_string(),
                state_dir: "/tmp/cm-launcher-test/states".to_string(),
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
        let balancer = Balancer::new(
            provider,
            Arc::new(SequentialNetworkManager::new()),
            instance_manager.clone(),
        );
        Launcher::new(
            Config::default(),
            Arc::new(StaticResourceManager::new()),
            node_info_provider,
            Arc::new(RecordingNodeRuntime::new()),
            instance_manager,
            balancer,
        )
    }

    #[tokio::test]
    async fn start_builds_one_handler_per_node() {
        let launcher = launcher(Arc::new(StaticImageProvider::new()), vec!["a", "b"]);
        launcher.start().await.unwrap();
        let mut ids = launcher.node_ids().await;
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn run_instances_notifies_listener_with_merged_status() {
        let provider = Arc::new(StaticImageProvider::new());
        provider.add_service(ServiceInfo {
            service_id: "svc".to_string(),
            version: "1".to_string(),
            layer_digests: vec![],
            config: cm_model::service::ServiceConfig {
                runner: "runc".to_string(),
                labels: vec![],
                resources: vec![],
                devices: vec![],
                cpu_quota: None,
                ram_quota: None,
                state_quota: None,
                storage_quota: None,
                balancing_policy: Default::default(),
                networks: vec![],
                exposed_ports: vec![],
            },
        });
        let launcher = launcher(provider, vec!["a"]);
        launcher.start().await.unwrap();
        let recorder = Arc::new(RecordingRunStatusListener::new());
        launcher.set_listener(recorder.clone()).await;

        let request = RunServiceRequest {
            ident: InstanceIdent::new("svc", "subj", 0),
            labels: vec![],
            priority: 0,
            networks: vec![],
        };
        let statuses = launcher.run_instances(&[request], false).await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(recorder.batches.lock().unwrap().len(), 1);
    }
}
