/*
 * SPDX-License-Identifier: Apache-2.0
 */

use async_trait::async_trait;

use cm_model::ident::{InstanceIdent, NodeId};
use cm_model::instance::InstanceInfo;
use cm_model::node::NodeConfig;
use cm_model::service::{LayerInfo, ServiceInfo};
use cm_model::CmResult;

/// Per-node runtime interface the launcher dispatches start/stop batches to.
#[async_trait]
pub trait NodeRuntime: Send + Sync {
    async fn start_instances(
        &self,
        node_id: &NodeId,
        stop: &[InstanceIdent],
        start: &[(InstanceInfo, ServiceInfo, Vec<LayerInfo>)],
        force_restart: bool,
    ) -> CmResult<RunOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunOutcome {
    pub reboot_required: bool,
}

/// Returns the operator's per-node policy.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    async fn get_node_config(&self, node_id: &NodeId, node_type: &str) -> CmResult<NodeConfig>;
}
