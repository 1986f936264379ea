/*
 * SPDX-License-Identifier: Apache-2.0
 */

use async_trait::async_trait;
use std::sync::Arc;

use cm_model::ident::NodeId;
use cm_model::node::NodeInfo;
use cm_model::CmResult;

/// Node information as projected for external consumers (the Launcher):
/// static facts plus connectivity.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitNodeInfo {
    pub info: NodeInfo,
    pub is_connected: bool,
}

/// Receives notification about changing node information. Held as a shared
/// handle by the provider, not a raw pointer; unsubscription is mandatory
/// before the listener is dropped.
#[async_trait]
pub trait NodeInfoListener: Send + Sync {
    async fn on_node_info_changed(&self, info: UnitNodeInfo);
}

/// Collaborator contract consumed by the Launcher: the node info provider.
/// Implemented by `cm_core::node_info::NodeInfoProviderCache`.
#[async_trait]
pub trait NodeInfoProvider: Send + Sync {
    async fn get_all_node_ids(&self) -> CmResult<Vec<NodeId>>;
    async fn get_node_info(&self, node_id: &NodeId) -> CmResult<UnitNodeInfo>;
    async fn subscribe_listener(&self, listener: Arc<dyn NodeInfoListener>) -> CmResult<()>;
    async fn unsubscribe_listener(&self, listener: &Arc<dyn NodeInfoListener>) -> CmResult<()>;
}

/// Dynamic, per-node facts reported by the node's service manager (SM): the
/// raw feed the node info cache aggregates. This is the lower-level
/// collaborator behind the cache's "dynamic service-manager reports".
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SmInfo {
    pub declared_resources: Vec<String>,
    pub declared_runtimes: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum SmEvent {
    Connected,
    Disconnected,
    InfoReceived(SmInfo),
    NodeInfoChanged(NodeInfo),
}

#[async_trait]
pub trait NodeInfoSourceListener: Send + Sync {
    async fn on_sm_event(&self, node_id: NodeId, event: SmEvent);
}

#[async_trait]
pub trait NodeInfoSource: Send + Sync {
    async fn subscribe(&self, listener: Arc<dyn NodeInfoSourceListener>) -> CmResult<()>;
}
