/*
 * SPDX-License-Identifier: Apache-2.0
 */

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::ident::{InstanceIdent, NetworkId, NodeId};
use crate::network::NetworkParameters;

/// The scheduled instance record owned exclusively by the instance manager.
/// Created by `SetupInstance`, updated on each scheduling decision, destroyed
/// per the lifecycle rules in the component design.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub ident: InstanceIdent,
    pub uid: u32,
    pub node_id: NodeId,
    pub prev_node_id: Option<NodeId>,
    /// Runtime identifier the balancer matched this instance against (e.g.
    /// `"runc"`, `"runx"`).
    pub runtime: String,
    pub storage_path: Option<String>,
    pub state_path: Option<String>,
    pub network: Option<NetworkParameters>,
    /// Not currently desired but retained until `ServiceTTL`.
    pub cached: bool,
    pub timestamp: SystemTime,
}

impl InstanceInfo {
    pub fn is_expired(&self, service_ttl: std::time::Duration, now: SystemTime) -> bool {
        self.cached
            && now
                .duration_since(self.timestamp)
                .map(|age| age > service_ttl)
                .unwrap_or(false)
    }
}

/// A request from the update manager (or a rebalance) to run one instance of
/// a service on the unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunServiceRequest {
    pub ident: InstanceIdent,
    pub labels: Vec<String>,
    pub priority: u64,
    pub networks: Vec<NetworkId>,
}

impl RunServiceRequest {
    pub fn create_instance_ident(&self) -> InstanceIdent {
        self.ident.clone()
    }
}

/// Observed run state of a single instance, as reported up through
/// `RunStatusChanged` / `UnitStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub ident: InstanceIdent,
    pub node_id: Option<NodeId>,
    pub state: InstanceRunState,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceRunState {
    Active,
    Failed,
}
