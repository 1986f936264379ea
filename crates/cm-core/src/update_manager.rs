/*
 * SPDX-License-Identifier: Apache-2.0
 */

//! Update manager: the five-state download/install/launch/finalize
//! pipeline, persisted on every transition so a restart resumes from the
//! last durable `UpdateState` with the last stored `DesiredStatus`.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};

use cm_model::update::{DesiredStatus, NodeStatus, UnitConfigStatus, UnitStatus, UpdateState};
use cm_model::CmResult;

use cm_storage::{ImageManager, Storage, UnitStatusSender};

use crate::launcher::Launcher;

struct Inner {
    update_state: UpdateState,
    pending: Option<DesiredStatus>,
    cancel: bool,
    unit_status: UnitStatus,
}

/// Owns one worker driving the state machine. `ProcessDesiredStatus`
/// enqueues and returns immediately.
pub struct UpdateManager {
    storage: Arc<dyn Storage>,
    image_manager: Arc<dyn ImageManager>,
    launcher: Arc<Launcher>,
    sender: Arc<dyn UnitStatusSender>,
    inner: Mutex<Inner>,
    notify_tx: mpsc::UnboundedSender<()>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl UpdateManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        image_manager: Arc<dyn ImageManager>,
        launcher: Arc<Launcher>,
        sender: Arc<dyn UnitStatusSender>,
    ) -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            storage,
            image_manager,
            launcher,
            sender,
            inner: Mutex::new(Inner {
                update_state: UpdateState::None,
                pending: None,
                cancel: false,
                unit_status: UnitStatus::default(),
            }),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
            shutdown_tx: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    /// Restores the persisted `UpdateState`. A non-`None` state after a
    /// restart with no stored `DesiredStatus` to resume is treated as
    /// `None` - there is nothing to resume.
    pub async fn load(&self) -> CmResult<()> {
        let state = self.storage.get_update_state().await?;
        let desired = self.storage.get_desired_status().await?;
        let mut inner = self.inner.lock().await;
        match desired {
            Some(desired) if state != UpdateState::None => {
                inner.update_state = state;
                inner.pending = Some(desired);
                drop(inner);
                let _ = self.notify_tx.send(());
            }
            _ => {
                inner.update_state = UpdateState::None;
            }
        }
        Ok(())
    }

    /// Replaces the pending desired status. A new status identical to the
    /// one already pending is ignored. Otherwise, if a pass is in flight it
    /// is canceled so the worker restarts from `Downloading` with the new
    /// status.
    pub async fn process_desired_status(&self, status: DesiredStatus) -> CmResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.pending.as_ref() == Some(&status) {
            return Ok(());
        }
        self.storage.store_desired_status(&status).await?;
        if inner.update_state != UpdateState::None {
            inner.cancel = true;
        }
        inner.pending = Some(status);
        drop(inner);
        let _ = self.notify_tx.send(());
        Ok(())
    }

    pub async fn start(self: &Arc<Self>) {
        self.load().await.ok();

        let mut rx_guard = self.notify_rx.lock().await;
        let Some(mut rx) = rx_guard.take() else {
            return;
        };
        drop(rx_guard);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    maybe = rx.recv() => {
                        if maybe.is_none() {
                            break;
                        }
                        this.drive().await;
                    }
                }
            }
        });
        *self.worker.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        let should_cancel = {
            let inner = self.inner.lock().await;
            matches!(inner.update_state, UpdateState::Downloading | UpdateState::Installing)
        };
        if should_cancel {
            self.image_manager.cancel().await;
        }
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }

    pub async fn current_state(&self) -> UpdateState {
        self.inner.lock().await.update_state
    }

    /// Runs passes until there's no pending status left to start.
    async fn drive(&self) {
        loop {
            let desired = {
                let mut inner = self.inner.lock().await;
                inner.cancel = false;
                inner.pending.take()
            };
            let Some(desired) = desired else { break };
            self.run_pipeline(desired).await;
        }
    }

    async fn is_canceled(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.cancel {
            inner.cancel = false;
            true
        } else {
            false
        }
    }

    async fn set_state(&self, state: UpdateState) {
        self.inner.lock().await.update_state = state;
        if let Err(err) = self.storage.store_update_state(state).await {
            tracing::warn!(error = %err, ?state, "failed to persist update state transition");
        }
    }

    async fn run_pipeline(&self, desired: DesiredStatus) {
        self.set_state(UpdateState::Downloading).await;
        let download_statuses = match self.image_manager.download_update_items(&desired.update_items).await {
            Ok(statuses) => statuses,
            Err(err) => {
                tracing::error!(error = %err, "download step failed, unwinding to None");
                self.set_state(UpdateState::None).await;
                return;
            }
        };
        for status in &download_statuses {
            if let Some(error) = &status.error {
                tracing::warn!(item_id = %status.item_id, error, "update item download failed");
            }
        }
        self.inner.lock().await.unit_status.update_items = download_statuses;

        if self.cancel_and_unwind().await {
            return;
        }

        self.set_state(UpdateState::Pending).await;
        self.set_state(UpdateState::Installing).await;
        self.apply_node_states(&desired).await;
        self.apply_unit_config(&desired).await;

        if self.cancel_and_unwind().await {
            return;
        }

        self.set_state(UpdateState::Launching).await;
        let statuses = self.launcher.run_instances(&desired.instances, false).await;
        self.inner.lock().await.unit_status.instances = statuses;

        if self.cancel_and_unwind().await {
            return;
        }

        self.set_state(UpdateState::Finalizing).await;
        match self.image_manager.install_update_items(&desired.update_items).await {
            Ok(statuses) => {
                for status in &statuses {
                    if let Some(error) = &status.error {
                        tracing::warn!(item_id = %status.item_id, error, "update item install failed");
                    }
                }
                self.inner.lock().await.unit_status.update_items = statuses;
            }
            Err(err) => {
                tracing::error!(error = %err, "finalize step failed, unwinding to None");
                self.set_state(UpdateState::None).await;
                return;
            }
        }

        self.set_state(UpdateState::None).await;
        let unit_status = self.inner.lock().await.unit_status.clone();
        if let Err(err) = self.sender.send_unit_status(unit_status).await {
            tracing::warn!(error = %err, "failed to send unit status");
        }
    }

    /// Returns `true` (and performs the unwind) if a cancellation was
    /// observed since the last check.
    async fn cancel_and_unwind(&self) -> bool {
        if !self.is_canceled().await {
            return false;
        }
        let was_downloading_or_installing = {
            let inner = self.inner.lock().await;
            matches!(inner.update_state, UpdateState::Downloading | UpdateState::Installing)
        };
        if was_downloading_or_installing {
            self.image_manager.cancel().await;
        }
        self.set_state(UpdateState::None).await;
        true
    }

    async fn apply_node_states(&self, desired: &DesiredStatus) {
        let mut statuses = Vec::with_capacity(desired.node_states.len());
        for update in &desired.node_states {
            tracing::info!(node_id = %update.node_id, action = ?update.action, "applying node state change");
            statuses.push(NodeStatus {
                node_id: update.node_id.clone(),
                error: None,
            });
        }
        self.inner.lock().await.unit_status.node_states = statuses;
    }

    async fn apply_unit_config(&self, desired: &DesiredStatus) {
        let Some(config) = &desired.unit_config else {
            return;
        };
        tracing::info!(version = %config.version, "applying unit config update");
        self.inner.lock().await.unit_status.unit_config = Some(UnitConfigStatus {
            version: config.version.clone(),
            error: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_model::ident::InstanceIdent;
    use cm_model::instance::RunServiceRequest;
    use cm_model::node::{NodeInfo, NodeState};
    use cm_model::update::{UpdateItem, UpdateItemType};
    use cm_storage::test_util::{
        InMemoryFsPlatform, InMemoryFsWatcher, InMemoryStorage, NoopImageManager, RecordingNodeRuntime,
        RecordingSender, SequentialNetworkManager, StaticImageProvider, StaticResourceManager,
    };
    use std::collections::BTreeMap as Map;

    struct FixedNodeInfoProvider(Map<cm_model::ident::NodeId, cm_storage::UnitNodeInfo>);

    #[async_trait::async_trait]
    impl cm_storage::NodeInfoProvider for FixedNodeInfoProvider {
        async fn get_all_node_ids(&self) -> CmResult<Vec<cm_model::ident::NodeId>> {
            Ok(self.0.keys().cloned().collect())
        }
        async fn get_node_info(&self, node_id: &cm_model::ident::NodeId) -> CmResult<cm_storage::UnitNodeInfo> {
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

    fn update_manager() -> Arc<UpdateManager> {
        let storage = Arc::new(InMemoryStorage::new());
        let storage_state = crate::storage_state::StorageState::new(
            crate::storage_state::Config {
                storage_dir: "/tmp/cm-update-test/storages".to_string(),
                state_dir: "/tmp/cm-update-test/states".to_string(),
            },
            Arc::new(InMemoryFsPlatform::new()),
            Arc::new(InMemoryFsWatcher::new()),
            Arc::new(RecordingSender::new()),
        );
        let instance_manager = Arc::new(crate::instance::InstanceManager::new(
            storage.clone(),
            storage_state,
            crate::instance::Config::default(),
        ));
        let node_info_provider = Arc::new(FixedNodeInfoProvider(Map::from([(
            "n1".to_string(),
            cm_storage::UnitNodeInfo {
                info: NodeInfo {
                    node_id: "n1".to_string(),
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
            },
        )])));
        let balancer = crate::balancer::Balancer::new(
            Arc::new(StaticImageProvider::new()),
            Arc::new(SequentialNetworkManager::new()),
            instance_manager.clone(),
        );
        let launcher = Arc::new(Launcher::new(
            crate::launcher::Config::default(),
            Arc::new(StaticResourceManager::new()),
            node_info_provider,
            Arc::new(RecordingNodeRuntime::new()),
            instance_manager,
            balancer,
        ));
        UpdateManager::new(storage, Arc::new(NoopImageManager::new()), launcher, Arc::new(RecordingSender::new()))
    }

    #[tokio::test]
    async fn pipeline_returns_to_none_on_success() {
        let mgr = update_manager();
        mgr.launcher.start().await.unwrap();
        mgr.start().await;

        let desired = DesiredStatus {
            update_items: vec![UpdateItem {
                item_id: "item".to_string(),
                item_type: UpdateItemType::Service,
                version: "1".to_string(),
                url: "https://example.invalid/item".to_string(),
            }],
            instances: vec![],
            node_states: vec![],
            unit_config: None,
        };
        mgr.process_desired_status(desired).await.unwrap();

        for _ in 0..50 {
            if mgr.current_state().await == UpdateState::None {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(mgr.current_state().await, UpdateState::None);
        mgr.stop().await;
    }

    #[tokio::test]
    async fn identical_pending_status_is_ignored() {
        let mgr = update_manager();
        let desired = DesiredStatus {
            update_items: vec![],
            instances: vec![RunServiceRequest {
                ident: InstanceIdent::new("item", "subj", 0),
                labels: vec![],
                priority: 0,
                networks: vec![],
            }],
            node_states: vec![],
            unit_config: None,
        };
        mgr.process_desired_status(desired.clone()).await.unwrap();
        mgr.process_desired_status(desired).await.unwrap();
        assert!(mgr.inner.lock().await.pending.is_some());
    }
}
