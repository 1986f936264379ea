/*
 * SPDX-License-Identifier: Apache-2.0
 */

//! Single assembly site: wires the four subsystems together from their
//! collaborators and drives startup/shutdown. No subsystem constructs its
//! own collaborators or reaches for global state.

use std::sync::Arc;

use cm_model::node::NodeInfo;
use cm_model::CmResult;

use cm_core::balancer::Balancer;
use cm_core::instance::InstanceManager;
use cm_core::launcher::Launcher;
use cm_core::node_info::{self, NodeInfoProviderCache};
use cm_core::storage_state::StorageState;
use cm_core::update_manager::UpdateManager;

use cm_storage::{
    FsPlatform, FsWatcher, ImageManager, ImageProvider, NetworkManager, NodeInfoSource, NodeRuntime, ResourceManager,
    RunStatusListener, Storage, StorageStateSender, UnitStatusSender,
};

use crate::cfg::Config;

/// Everything outside this crate's scope: the concrete clients a real
/// deployment supplies for persistence, node dispatch, image delivery, and
/// the cloud channel.
pub struct Collaborators {
    pub storage: Arc<dyn Storage>,
    pub storage_state_sender: Arc<dyn StorageStateSender>,
    pub fs_platform: Arc<dyn FsPlatform>,
    pub fs_watcher: Arc<dyn FsWatcher>,
    pub resource_manager: Arc<dyn ResourceManager>,
    pub node_runtime: Arc<dyn NodeRuntime>,
    pub node_info_source: Arc<dyn NodeInfoSource>,
    pub image_provider: Arc<dyn ImageProvider>,
    pub image_manager: Arc<dyn ImageManager>,
    pub network_manager: Arc<dyn NetworkManager>,
    pub unit_status_sender: Arc<dyn UnitStatusSender>,
    pub run_status_listener: Option<Arc<dyn RunStatusListener>>,
    /// The unit's known nodes, keyed by whether each hosts a service manager.
    pub known_nodes: Vec<(NodeInfo, bool)>,
}

/// The running system. Held by `main` for the lifetime of the process;
/// `shutdown` drains every worker before returning.
pub struct System {
    pub node_info: Arc<NodeInfoProviderCache>,
    pub launcher: Arc<Launcher>,
    pub update_manager: Arc<UpdateManager>,
    storage_state: StorageState,
}

impl System {
    pub async fn shutdown(&self) {
        self.update_manager.stop().await;
        self.launcher.stop().await;
        self.storage_state.stop().await;
        self.node_info.stop().await;
    }
}

pub async fn run(config: &Config, collaborators: Collaborators) -> CmResult<System> {
    let node_info = NodeInfoProviderCache::new(node_info::Config {
        sm_connection_timeout: config.sm_connection_timeout,
    });
    for (info, has_sm) in collaborators.known_nodes {
        node_info.add_node(info, has_sm).await;
    }
    collaborators
        .node_info_source
        .subscribe(node_info.clone() as Arc<dyn cm_storage::node_info::NodeInfoSourceListener>)
        .await?;
    node_info.start().await;

    let storage_state = StorageState::new(
        config.storage_state_config(),
        collaborators.fs_platform,
        collaborators.fs_watcher,
        collaborators.storage_state_sender,
    );
    storage_state.start().await;

    let instance_manager = Arc::new(InstanceManager::new(
        collaborators.storage.clone(),
        storage_state.clone(),
        config.instance_config(),
    ));
    collaborators
        .image_provider
        .subscribe_listener(instance_manager.clone() as Arc<dyn cm_storage::ServiceListener>)
        .await?;

    let balancer = Balancer::new(
        collaborators.image_provider,
        collaborators.network_manager,
        instance_manager.clone(),
    );

    let launcher = Arc::new(Launcher::new(
        config.launcher_config(),
        collaborators.resource_manager,
        node_info.clone() as Arc<dyn cm_storage::NodeInfoProvider>,
        collaborators.node_runtime,
        instance_manager,
        balancer,
    ));
    if let Some(listener) = collaborators.run_status_listener {
        launcher.set_listener(listener).await;
    }
    launcher.start().await?;
    launcher.wait_for_nodes_ready().await;

    let update_manager = UpdateManager::new(
        collaborators.storage,
        collaborators.image_manager,
        launcher.clone(),
        collaborators.unit_status_sender,
    );
    update_manager.start().await;

    Ok(System {
        node_info,
        launcher,
        update_manager,
        storage_state,
    })
}
