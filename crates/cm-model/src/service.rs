/*
 * SPDX-License-Identifier: Apache-2.0
 */

use serde::{Deserialize, Serialize};

/// Resolved facts about a service, as produced by the (external) image
/// provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_id: String,
    pub version: String,
    pub layer_digests: Vec<String>,
    pub config: ServiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub digest: String,
    pub local_url: String,
}

/// Placement-relevant config carried by a service's manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub runner: String,
    pub labels: Vec<String>,
    pub resources: Vec<String>,
    pub devices: Vec<ServiceDevice>,
    pub cpu_quota: Option<u64>,
    pub ram_quota: Option<u64>,
    pub state_quota: Option<u64>,
    pub storage_quota: Option<u64>,
    pub balancing_policy: BalancingPolicy,
    pub networks: Vec<String>,
    pub exposed_ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDevice {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BalancingPolicy {
    #[default]
    Enabled,
    Disabled,
}
