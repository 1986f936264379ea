/*
 * SPDX-License-Identifier: Apache-2.0
 */

//! Instance manager: owns the scheduled-instance records, the `[5000,
//! 10000)` UID pool, and the cached-instance TTL sweep.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::Mutex;

use cm_model::ident::{InstanceIdent, NodeId};
use cm_model::instance::{InstanceInfo, InstanceRunState, InstanceStatus, RunServiceRequest};
use cm_model::limits::{MAX_NUM_LOCKED_UIDS, UID_RANGE};
use cm_model::service::ServiceInfo;
use cm_model::{CmError, CmResult};

use cm_storage::{ServiceListener, Storage};

use crate::node_handler::NodeHandler;
use crate::storage_state::{SetupParams, StorageState};

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// How long a no-longer-desired instance stays cached before eviction.
    pub service_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

struct State {
    instances: BTreeMap<InstanceIdent, InstanceInfo>,
    statuses: BTreeMap<InstanceIdent, InstanceStatus>,
    uids: BTreeMap<InstanceIdent, u32>,
    used_uids: BTreeSet<u32>,
}

impl State {
    fn allocate_uid(&mut self, ident: &InstanceIdent) -> CmResult<u32> {
        if let Some(uid) = self.uids.get(ident) {
            return Ok(*uid);
        }
        if self.used_uids.len() >= MAX_NUM_LOCKED_UIDS {
            return Err(CmError::no_memory("UID pool exhausted"));
        }
        let uid = UID_RANGE
            .clone()
            .find(|uid| !self.used_uids.contains(uid))
            .ok_or_else(|| CmError::no_memory("no free UID in [5000, 10000)"))?;
        self.used_uids.insert(uid);
        self.uids.insert(ident.clone(), uid);
        Ok(uid)
    }

    fn release_uid(&mut self, ident: &InstanceIdent) {
        if let Some(uid) = self.uids.remove(ident) {
            self.used_uids.remove(&uid);
        }
    }
}

/// Owns the instance records; all mutation runs through one
/// [`tokio::sync::Mutex`].
pub struct InstanceManager {
    storage: Arc<dyn Storage>,
    storage_state: StorageState,
    config: Config,
    state: Mutex<State>,
}

impl InstanceManager {
    pub fn new(storage: Arc<dyn Storage>, storage_state: StorageState, config: Config) -> Self {
        Self {
            storage,
            storage_state,
            config,
            state: Mutex::new(State {
                instances: BTreeMap::new(),
                statuses: BTreeMap::new(),
                uids: BTreeMap::new(),
                used_uids: BTreeSet::new(),
            }),
        }
    }

    /// Restores in-memory state from durable storage, rebuilding the UID
    /// pool from the instances found there. Call once at startup.
    pub async fn load(&self) -> CmResult<()> {
        let active = self.storage.get_active_instances().await?;
        let mut state = self.state.lock().await;
        for instance in active {
            if state.used_uids.len() >= MAX_NUM_LOCKED_UIDS {
                return Err(CmError::no_memory("persisted instance count exceeds UID pool capacity"));
            }
            state.used_uids.insert(instance.uid);
            state.uids.insert(instance.ident.clone(), instance.uid);
            state.instances.insert(instance.ident.clone(), instance);
        }
        Ok(())
    }

    /// Allocates (or reuses) a UID, asks StorageState to set up the
    /// instance's storage/state trees, and persists the resulting record.
    /// Reassigning an instance to a new node keeps its UID and records the
    /// prior node in `prev_node_id`.
    pub async fn setup_instance(
        &self,
        request: &RunServiceRequest,
        node: &NodeHandler,
        service: &ServiceInfo,
    ) -> CmResult<InstanceInfo> {
        let ident = request.create_instance_ident();
        let mut state = self.state.lock().await;
        let uid = state.allocate_uid(&ident)?;
        let prev_node_id = state
            .instances
            .get(&ident)
            .filter(|existing| existing.node_id != *node.node_id())
            .map(|existing| existing.node_id.clone());
        drop(state);

        let state_quota = node.req_state_size(&service.config);
        let storage_quota = node.req_storage_size(&service.config);
        let (storage_path, state_path) = self
            .storage_state
            .setup(
                &ident,
                SetupParams {
                    uid,
                    gid: uid,
                    state_quota,
                    storage_quota,
                },
            )
            .await?;

        let info = InstanceInfo {
            ident: ident.clone(),
            uid,
            node_id: node.node_id().clone(),
            prev_node_id,
            runtime: service.config.runner.clone(),
            storage_path,
            state_path,
            network: None,
            cached: false,
            timestamp: SystemTime::now(),
        };

        self.storage.add_instance(&info).await?;
        self.state.lock().await.instances.insert(ident, info.clone());
        Ok(info)
    }

    /// Marks an instance as no longer desired but retained until
    /// `ServiceTTL`. Idempotent: refreshes the timestamp on every call so a
    /// flapping desired state doesn't evict prematurely.
    pub async fn cache_instance(&self, ident: &InstanceIdent) -> CmResult<()> {
        let mut state = self.state.lock().await;
        let instance = state
            .instances
            .get_mut(ident)
            .ok_or_else(|| CmError::not_found(format!("instance {ident} not found")))?;
        instance.cached = true;
        instance.timestamp = SystemTime::now();
        let info = instance.clone();
        drop(state);
        self.storage.update_instance(&info).await
    }

    /// Un-caches an instance that has become desired again, clearing the
    /// TTL clock.
    pub async fn uncache_instance(&self, ident: &InstanceIdent) -> CmResult<()> {
        let mut state = self.state.lock().await;
        let Some(instance) = state.instances.get_mut(ident) else {
            return Ok(());
        };
        instance.cached = false;
        let info = instance.clone();
        drop(state);
        self.storage.update_instance(&info).await
    }

    pub async fn set_instance_error(&self, ident: &InstanceIdent, error: impl Into<String>) {
        let node_id = self
            .state
            .lock()
            .await
            .instances
            .get(ident)
            .map(|i| i.node_id.clone());
        self.state.lock().await.statuses.insert(
            ident.clone(),
            InstanceStatus {
                ident: ident.clone(),
                node_id,
                state: InstanceRunState::Failed,
                error: Some(error.into()),
            },
        );
    }

    pub async fn clear_instance_error(&self, ident: &InstanceIdent) {
        if let Some(status) = self.state.lock().await.statuses.get_mut(ident) {
            status.state = InstanceRunState::Active;
            status.error = None;
        }
    }

    pub async fn instance_statuses(&self) -> Vec<InstanceStatus> {
        self.state.lock().await.statuses.values().cloned().collect()
    }

    pub async fn get_instance(&self, ident: &InstanceIdent) -> Option<InstanceInfo> {
        self.state.lock().await.instances.get(ident).cloned()
    }

    pub async fn active_instances(&self) -> Vec<InstanceInfo> {
        self.state
            .lock()
            .await
            .instances
            .values()
            .filter(|i| !i.cached)
            .cloned()
            .collect()
    }

    pub async fn instances_on_node(&self, node_id: &NodeId) -> Vec<InstanceInfo> {
        self.state
            .lock()
            .await
            .instances
            .values()
            .filter(|i| &i.node_id == node_id)
            .cloned()
            .collect()
    }

    pub async fn checksum(&self, ident: &InstanceIdent) -> CmResult<cm_model::state::Checksum> {
        self.storage_state.instance_checksum(ident).await
    }

    /// Sweeps cached instances past `ServiceTTL`: removes their storage and
    /// state trees, releases their UID, and drops the record. Returns the
    /// idents evicted, so the caller can also remove them from whatever
    /// node the runtime last scheduled them on.
    pub async fn update_instance_cache(&self) -> CmResult<Vec<InstanceIdent>> {
        let now = SystemTime::now();
        let expired: Vec<InstanceIdent> = {
            let state = self.state.lock().await;
            state
                .instances
                .values()
                .filter(|i| i.is_expired(self.config.service_ttl, now))
                .map(|i| i.ident.clone())
                .collect()
        };
        self.remove_idents(&expired).await?;
        Ok(expired)
    }

    /// Drops every instance backed by `item_id`, independent of its TTL or
    /// cached state. Called when the service's backing image is removed.
    async fn remove_item(&self, item_id: &str) -> CmResult<Vec<InstanceIdent>> {
        let idents: Vec<InstanceIdent> = {
            let state = self.state.lock().await;
            state
                .instances
                .keys()
                .filter(|ident| ident.item_id == item_id)
                .cloned()
                .collect()
        };
        self.remove_idents(&idents).await?;
        Ok(idents)
    }

    async fn remove_idents(&self, idents: &[InstanceIdent]) -> CmResult<()> {
        for ident in idents {
            self.storage_state.remove(ident).await?;
            self.storage.remove_instance(ident).await?;
            let mut state = self.state.lock().await;
            state.instances.remove(ident);
            state.statuses.remove(ident);
            state.release_uid(ident);
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceListener for InstanceManager {
    async fn on_service_removed(&self, service_id: &str) {
        if let Err(err) = self.remove_item(service_id).await {
            tracing::warn!(service_id, %err, "failed to drop instances for removed service");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_model::node::{NodeConfig, NodeInfo, NodeState};
    use cm_model::service::{BalancingPolicy, ServiceConfig};
    use cm_storage::test_util::{InMemoryFsPlatform, InMemoryFsWatcher, InMemoryStorage, RecordingSender};
    use std::collections::BTreeMap as Map;

    fn node_handler(node_id: &str) -> NodeHandler {
        NodeHandler::init(
            NodeInfo {
                node_id: node_id.to_string(),
                node_type: "generic".to_string(),
                max_dmips: 1000,
                total_ram: 2000,
                partitions: Map::from([("storage".to_string(), 4096), ("state".to_string(), 4096)]),
                declared_resources: vec![],
                declared_runtimes: vec![],
                declared_devices: vec![],
                state: NodeState::Online,
            },
            NodeConfig::default(),
            true,
            false,
        )
    }

    fn service() -> ServiceInfo {
        ServiceInfo {
            service_id: "svc".to_string(),
            version: "1".to_string(),
            layer_digests: vec![],
            config: ServiceConfig {
                runner: "runc".to_string(),
                labels: vec![],
                resources: vec![],
                devices: vec![],
                cpu_quota: None,
                ram_quota: None,
                state_quota: Some(1024),
                storage_quota: Some(1024),
                balancing_policy: BalancingPolicy::default(),
                networks: vec![],
                exposed_ports: vec![],
            },
        }
    }

    fn manager() -> InstanceManager {
        InstanceManager::new(
            Arc::new(InMemoryStorage::new()),
            StorageState::new(
                crate::storage_state::Config {
                    storage_dir: "/tmp/cm-instance-test/storages".to_string(),
                    state_dir: "/tmp/cm-instance-test/states".to_string(),
                },
                Arc::new(InMemoryFsPlatform::new()),
                Arc::new(InMemoryFsWatcher::new()),
                Arc::new(RecordingSender::new()),
            ),
            Config::default(),
        )
    }

    #[tokio::test]
    async fn setup_allocates_uid_within_range() {
        let mgr = manager();
        let request = RunServiceRequest {
            ident: InstanceIdent::new("item", "subj", 0),
            labels: vec![],
            priority: 0,
            networks: vec![],
        };
        let info = mgr.setup_instance(&request, &node_handler("n1"), &service()).await.unwrap();
        assert!(UID_RANGE.contains(&info.uid));
    }

    #[tokio::test]
    async fn reassigning_to_new_node_keeps_uid_and_sets_prev_node() {
        let mgr = manager();
        let request = RunServiceRequest {
            ident: InstanceIdent::new("item", "subj", 1),
            labels: vec![],
            priority: 0,
            networks: vec![],
        };
        let first = mgr.setup_instance(&request, &node_handler("n1"), &service()).await.unwrap();
        let second = mgr.setup_instance(&request, &node_handler("n2"), &service()).await.unwrap();
        assert_eq!(first.uid, second.uid);
        assert_eq!(second.prev_node_id.as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn cached_instance_is_evicted_after_ttl() {
        let mut mgr = manager();
        mgr.config.service_ttl = Duration::from_millis(1);
        let request = RunServiceRequest {
            ident: InstanceIdent::new("item", "subj", 2),
            labels: vec![],
            priority: 0,
            networks: vec![],
        };
        let info = mgr.setup_instance(&request, &node_handler("n1"), &service()).await.unwrap();
        mgr.cache_instance(&info.ident).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let evicted = mgr.update_instance_cache().await.unwrap();
        assert_eq!(evicted, vec![info.ident.clone()]);
        assert!(mgr.get_instance(&info.ident).await.is_none());
    }

    #[tokio::test]
    async fn uid_pool_rejects_beyond_capacity() {
        let mut state = State {
            instances: BTreeMap::new(),
            statuses: BTreeMap::new(),
            uids: BTreeMap::new(),
            used_uids: (UID_RANGE.start..UID_RANGE.start + MAX_NUM_LOCKED_UIDS as u32).collect(),
        };
        let ident = InstanceIdent::new("item", "subj", 99);
        assert!(matches!(state.allocate_uid(&ident), Err(CmError::NoMemory { .. })));
    }
}
