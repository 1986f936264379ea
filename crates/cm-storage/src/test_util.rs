/*
 * SPDX-License-Identifier: Apache-2.0
 */

//! In-memory collaborator doubles, one per trait in this crate, following
//! the stub-per-interface convention of the reference test fixtures this
//! workspace's launcher/storagestate tests use. Shipped behind `test-util`
//! so `cm-core` and the binary crate's integration tests can depend on them
//! without pulling test code into release builds.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use cm_model::ident::{InstanceIdent, NetworkId, NodeId};
use cm_model::instance::InstanceInfo;
use cm_model::network::{InstanceNetworkInfo, NetworkParameters};
use cm_model::node::NodeConfig;
use cm_model::service::{LayerInfo, ServiceInfo};
use cm_model::state::{NewState, StateRequest};
use cm_model::update::{DesiredStatus, ItemStatus, UnitStatus, UpdateItem, UpdateState};
use cm_model::{CmError, CmResult};

use crate::fs::{FsEvent, FsEventSubscriber, FsPlatform, FsWatcher};
use crate::image::{ImageManager, ImageProvider, ServiceListener};
use crate::launcher::RunStatusListener;
use crate::network::{NetworkInstanceData, NetworkManager};
use crate::node_info::{NodeInfoSource, NodeInfoSourceListener};
use crate::node_runtime::{NodeRuntime, ResourceManager, RunOutcome};
use crate::sender::{StorageStateSender, UnitStatusSender};

#[derive(Default)]
struct StorageState {
    instances: BTreeMap<InstanceIdent, InstanceInfo>,
    desired_status: Option<DesiredStatus>,
    update_state: UpdateState,
}

/// In-memory [`Storage`](crate::Storage), read-your-writes, idempotent
/// add/update - matching the contract the design assumes of the real store.
#[derive(Default)]
pub struct InMemoryStorage(Mutex<StorageState>);

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl crate::storage::Storage for InMemoryStorage {
    async fn add_instance(&self, info: &InstanceInfo) -> CmResult<()> {
        self.0
            .lock()
            .unwrap()
            .instances
            .insert(info.ident.clone(), info.clone());
        Ok(())
    }

    async fn update_instance(&self, info: &InstanceInfo) -> CmResult<()> {
        self.add_instance(info).await
    }

    async fn remove_instance(&self, ident: &InstanceIdent) -> CmResult<()> {
        self.0.lock().unwrap().instances.remove(ident);
        Ok(())
    }

    async fn get_instance(&self, ident: &InstanceIdent) -> CmResult<Option<InstanceInfo>> {
        Ok(self.0.lock().unwrap().instances.get(ident).cloned())
    }

    async fn get_active_instances(&self) -> CmResult<Vec<InstanceInfo>> {
        Ok(self.0.lock().unwrap().instances.values().cloned().collect())
    }

    async fn store_desired_status(&self, status: &DesiredStatus) -> CmResult<()> {
        self.0.lock().unwrap().desired_status = Some(status.clone());
        Ok(())
    }

    async fn get_desired_status(&self) -> CmResult<Option<DesiredStatus>> {
        Ok(self.0.lock().unwrap().desired_status.clone())
    }

    async fn store_update_state(&self, state: UpdateState) -> CmResult<()> {
        self.0.lock().unwrap().update_state = state;
        Ok(())
    }

    async fn get_update_state(&self) -> CmResult<UpdateState> {
        Ok(self.0.lock().unwrap().update_state)
    }
}

/// Records every message sent to it; never fails.
#[derive(Default)]
pub struct RecordingSender {
    pub state_requests: Mutex<Vec<StateRequest>>,
    pub new_states: Mutex<Vec<NewState>>,
    pub unit_statuses: Mutex<Vec<UnitStatus>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageStateSender for RecordingSender {
    async fn send_state_request(&self, request: StateRequest) -> CmResult<()> {
        self.state_requests.lock().unwrap().push(request);
        Ok(())
    }

    async fn send_new_state(&self, state: NewState) -> CmResult<()> {
        self.new_states.lock().unwrap().push(state);
        Ok(())
    }
}

#[async_trait]
impl UnitStatusSender for RecordingSender {
    async fn send_unit_status(&self, status: UnitStatus) -> CmResult<()> {
        self.unit_statuses.lock().unwrap().push(status);
        Ok(())
    }
}

/// Fixed per-node config lookup; returns `NodeConfig::default()` unless
/// overridden.
#[derive(Default)]
pub struct StaticResourceManager(Mutex<BTreeMap<NodeId, NodeConfig>>);

impl StaticResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, node_id: impl Into<NodeId>, config: NodeConfig) {
        self.0.lock().unwrap().insert(node_id.into(), config);
    }
}

#[async_trait]
impl ResourceManager for StaticResourceManager {
    async fn get_node_config(&self, node_id: &NodeId, _node_type: &str) -> CmResult<NodeConfig> {
        Ok(self.0.lock().unwrap().get(node_id).cloned().unwrap_or_default())
    }
}

/// Records every start/stop batch dispatched to it; always succeeds.
#[derive(Default)]
pub struct RecordingNodeRuntime {
    pub calls: Mutex<Vec<(NodeId, Vec<InstanceIdent>, usize, bool)>>,
}

impl RecordingNodeRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeRuntime for RecordingNodeRuntime {
    async fn start_instances(
        &self,
        node_id: &NodeId,
        stop: &[InstanceIdent],
        start: &[(InstanceInfo, ServiceInfo, Vec<LayerInfo>)],
        force_restart: bool,
    ) -> CmResult<RunOutcome> {
        self.calls
            .lock()
            .unwrap()
            .push((node_id.clone(), stop.to_vec(), start.len(), force_restart));
        Ok(RunOutcome::default())
    }
}

/// Deterministic network allocator: IP/subnet derived from a monotonically
/// increasing counter, matching the design's "deterministic per network, not
/// necessarily stable across rebalances" requirement.
#[derive(Default)]
pub struct SequentialNetworkManager(Mutex<u32>);

impl SequentialNetworkManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NetworkManager for SequentialNetworkManager {
    async fn prepare_instance_network_parameters(
        &self,
        _ident: &InstanceIdent,
        network_id: &NetworkId,
        _node_id: &NodeId,
        data: &NetworkInstanceData,
    ) -> CmResult<NetworkParameters> {
        let mut counter = self.0.lock().unwrap();
        *counter += 1;
        Ok(NetworkParameters {
            network_id: network_id.clone(),
            ip: format!("10.0.{}.{}", *counter / 254, *counter % 254 + 1),
            subnet: "10.0.0.0/16".to_string(),
            exposed_ports: data.exposed_ports.clone(),
        })
    }

    async fn remove_instance_network_parameters(
        &self,
        _ident: &InstanceIdent,
        _node_id: &NodeId,
    ) -> CmResult<()> {
        Ok(())
    }

    async fn get_instances(&self) -> CmResult<Vec<InstanceNetworkInfo>> {
        Ok(Vec::new())
    }

    async fn update_provider_network(&self, _network_id: &NetworkId) -> CmResult<()> {
        Ok(())
    }
}

/// Serves service/layer info from a fixed in-memory table, with a removal
/// listener slot.
#[derive(Default)]
pub struct StaticImageProvider {
    services: Mutex<BTreeMap<String, ServiceInfo>>,
    layers: Mutex<BTreeMap<String, LayerInfo>>,
    listeners: Mutex<Vec<Arc<dyn ServiceListener>>>,
}

impl StaticImageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(&self, info: ServiceInfo) {
        self.services.lock().unwrap().insert(info.service_id.clone(), info);
    }

    pub fn add_layer(&self, info: LayerInfo) {
        self.layers.lock().unwrap().insert(info.digest.clone(), info);
    }

    pub async fn remove_service(&self, service_id: &str) {
        self.services.lock().unwrap().remove(service_id);
        for listener in self.listeners.lock().unwrap().iter() {
            listener.on_service_removed(service_id).await;
        }
    }
}

#[async_trait]
impl ImageProvider for StaticImageProvider {
    async fn get_service_info(&self, service_id: &str) -> CmResult<ServiceInfo> {
        self.services
            .lock()
            .unwrap()
            .get(service_id)
            .cloned()
            .ok_or_else(|| CmError::not_found(format!("service {service_id} not found")))
    }

    async fn get_layers(&self, digests: &[String]) -> CmResult<Vec<LayerInfo>> {
        let layers = self.layers.lock().unwrap();
        digests
            .iter()
            .map(|d| {
                layers
                    .get(d)
                    .cloned()
                    .ok_or_else(|| CmError::not_found(format!("layer {d} not found")))
            })
            .collect()
    }

    async fn subscribe_listener(&self, listener: Arc<dyn ServiceListener>) -> CmResult<()> {
        self.listeners.lock().unwrap().push(listener);
        Ok(())
    }
}

/// Always-succeeds image manager; echoes back a success status per item.
#[derive(Default)]
pub struct NoopImageManager {
    pub cancel_calls: Mutex<u32>,
}

impl NoopImageManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ImageManager for NoopImageManager {
    async fn download_update_items(&self, items: &[UpdateItem]) -> CmResult<Vec<ItemStatus>> {
        Ok(items
            .iter()
            .map(|i| ItemStatus {
                item_id: i.item_id.clone(),
                error: None,
            })
            .collect())
    }

    async fn install_update_items(&self, items: &[UpdateItem]) -> CmResult<Vec<ItemStatus>> {
        self.download_update_items(items).await
    }

    async fn cancel(&self) {
        *self.cancel_calls.lock().unwrap() += 1;
    }
}

/// Records every status batch it is handed; never fails.
#[derive(Default)]
pub struct RecordingRunStatusListener {
    pub batches: Mutex<Vec<Vec<cm_model::instance::InstanceStatus>>>,
}

impl RecordingRunStatusListener {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStatusListener for RecordingRunStatusListener {
    async fn on_run_status_changed(&self, statuses: Vec<cm_model::instance::InstanceStatus>) {
        self.batches.lock().unwrap().push(statuses);
    }
}

/// In-memory filesystem platform: records quota/ownership calls, "mount
/// point" is the parent directory of any path (so two paths sharing a parent
/// are treated as the same partition).
#[derive(Default)]
pub struct InMemoryFsPlatform {
    pub quotas: Mutex<BTreeMap<(String, u32), u64>>,
    pub owners: Mutex<BTreeMap<String, (u32, u32)>>,
}

impl InMemoryFsPlatform {
    pub fn new() -> Self {
        Self::default()
    }
}

fn parent_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
    }
}

#[async_trait]
impl FsPlatform for InMemoryFsPlatform {
    async fn get_mount_point(&self, path: &str) -> CmResult<String> {
        Ok(parent_of(path))
    }

    async fn change_owner(&self, path: &str, uid: u32, gid: u32) -> CmResult<()> {
        self.owners.lock().unwrap().insert(path.to_string(), (uid, gid));
        Ok(())
    }

    async fn set_user_quota(&self, path: &str, bytes: u64, uid: u32) -> CmResult<()> {
        self.quotas.lock().unwrap().insert((path.to_string(), uid), bytes);
        Ok(())
    }

    async fn get_total_size(&self, _path: &str) -> CmResult<u64> {
        Ok(0)
    }
}

/// In-memory watcher: `fire` delivers an event synchronously to every
/// subscriber of `path`, standing in for a real filesystem notification.
#[derive(Default)]
pub struct InMemoryFsWatcher {
    subscribers: Mutex<BTreeMap<String, Arc<dyn FsEventSubscriber>>>,
}

impl InMemoryFsWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fire(&self, path: &str, event: FsEvent) {
        let subscriber = self.subscribers.lock().unwrap().get(path).cloned();
        if let Some(subscriber) = subscriber {
            subscriber.on_fs_event(path, event).await;
        }
    }

    pub fn watched_paths(&self) -> BTreeSet<String> {
        self.subscribers.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl FsWatcher for InMemoryFsWatcher {
    async fn subscribe(&self, path: &str, subscriber: Arc<dyn FsEventSubscriber>) -> CmResult<()> {
        self.subscribers.lock().unwrap().insert(path.to_string(), subscriber);
        Ok(())
    }

    async fn unsubscribe(&self, path: &str) -> CmResult<()> {
        self.subscribers.lock().unwrap().remove(path);
        Ok(())
    }
}

/// Never emits an event; a stand-in for a deployment with no live SM feed.
#[derive(Default)]
pub struct NoopNodeInfoSource {
    pub listeners: Mutex<Vec<Arc<dyn NodeInfoSourceListener>>>,
}

impl NoopNodeInfoSource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeInfoSource for NoopNodeInfoSource {
    async fn subscribe(&self, listener: Arc<dyn NodeInfoSourceListener>) -> CmResult<()> {
        self.listeners.lock().unwrap().push(listener);
        Ok(())
    }
}
