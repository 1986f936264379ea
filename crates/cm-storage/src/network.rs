/*
 * SPDX-License-Identifier: Apache-2.0
 */

use async_trait::async_trait;

use cm_model::ident::{InstanceIdent, NetworkId, NodeId};
use cm_model::network::{InstanceNetworkInfo, NetworkParameters};
use cm_model::CmResult;

/// Per-instance network data the balancer passes to `PrepareInstanceNetworkParameters`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkInstanceData {
    pub only_exposed_ports: bool,
    pub exposed_ports: Vec<u16>,
}

#[async_trait]
pub trait NetworkManager: Send + Sync {
    async fn prepare_instance_network_parameters(
        &self,
        ident: &InstanceIdent,
        network_id: &NetworkId,
        node_id: &NodeId,
        data: &NetworkInstanceData,
    ) -> CmResult<NetworkParameters>;

    async fn remove_instance_network_parameters(
        &self,
        ident: &InstanceIdent,
        node_id: &NodeId,
    ) -> CmResult<()>;

    async fn get_instances(&self) -> CmResult<Vec<InstanceNetworkInfo>>;
    async fn update_provider_network(&self, network_id: &NetworkId) -> CmResult<()>;
}
