/*
 * SPDX-License-Identifier: Apache-2.0
 */

use serde::{Deserialize, Serialize};

use crate::ident::{InstanceIdent, NetworkId, NodeId};

/// Per-network record. Created on first instance joining the network,
/// destroyed when no instances remain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub network_id: NetworkId,
    pub subnet: String,
    pub ip: String,
    pub vlan_id: Option<u16>,
    pub vlan_if_name: Option<String>,
    pub bridge_if_name: Option<String>,
}

/// Network parameters resolved for a single `(instance, network)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkParameters {
    pub network_id: NetworkId,
    pub ip: String,
    pub subnet: String,
    pub exposed_ports: Vec<u16>,
}

/// Per-(instance, network) persisted association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceNetworkInfo {
    pub ident: InstanceIdent,
    pub node_id: NodeId,
    pub params: NetworkParameters,
}
