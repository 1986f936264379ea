/*
 * SPDX-License-Identifier: Apache-2.0
 */

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ident::NodeId;

/// Declared, mostly-static facts about a node, as reported by the node info
/// provider. Immutable for the lifetime of a placement pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub node_type: String,
    pub max_dmips: u64,
    pub total_ram: u64,
    pub partitions: BTreeMap<String, u64>,
    pub declared_resources: Vec<String>,
    pub declared_runtimes: Vec<String>,
    pub declared_devices: Vec<DeviceInfo>,
    pub state: NodeState,
}

impl NodeInfo {
    /// The declared total bytes for the named partition, per `GetPartitionSize`.
    pub fn partition_size(&self, partition_type: &str) -> u64 {
        self.partitions.get(partition_type).copied().unwrap_or(0)
    }
}

/// Connectivity/provisioning state reported for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Unprovisioned,
    Provisioning,
    Online,
    Error,
}

impl NodeState {
    /// Used by the balancer's active-node filter and the priority sort: only
    /// online+provisioned nodes are eligible to receive instances.
    pub fn is_active(&self) -> bool {
        matches!(self, NodeState::Online)
    }
}

/// A device declared by a node, with how many instances may share it
/// concurrently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    /// `None` means the device is exclusive (at most one instance per pass).
    pub shared_count: Option<u32>,
}

/// Operator-provided policy for a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub priority: i64,
    pub labels: Vec<String>,
    pub resource_ratios: Option<ResourceRatios>,
    pub alert_rules: Vec<AlertRule>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            priority: 0,
            labels: Vec::new(),
            resource_ratios: None,
            alert_rules: Vec::new(),
        }
    }
}

/// Fraction of a resource an instance may claim absent an explicit quota.
/// Defaults to 50% for every resource kind, matching `cDefaultResourceRatio`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRatios {
    pub cpu: f64,
    pub ram: f64,
    pub state: f64,
    pub storage: f64,
}

pub const DEFAULT_RESOURCE_RATIO: f64 = 50.0;

impl Default for ResourceRatios {
    fn default() -> Self {
        Self {
            cpu: DEFAULT_RESOURCE_RATIO,
            ram: DEFAULT_RESOURCE_RATIO,
            state: DEFAULT_RESOURCE_RATIO,
            storage: DEFAULT_RESOURCE_RATIO,
        }
    }
}

/// Rebalance trigger condition: fires when `metric` stays above `max_threshold`
/// for `duration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub metric: AlertMetric,
    pub max_threshold: f64,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertMetric {
    Cpu,
    Ram,
}

/// Rolling monitoring averages used to derive available headroom at the
/// start of a placement pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMonitoringAverages {
    pub cpu_non_aos: u64,
    pub ram_non_aos: u64,
    pub cpu_aos: u64,
    pub ram_aos: u64,
}
