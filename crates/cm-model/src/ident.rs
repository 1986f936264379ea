/*
 * SPDX-License-Identifier: Apache-2.0
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Uniquely identifies a running instance across the unit. Stable across
/// restarts; used as the primary key throughout the core.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceIdent {
    pub item_id: String,
    pub subject_id: String,
    pub instance: u64,
}

impl InstanceIdent {
    pub fn new(item_id: impl Into<String>, subject_id: impl Into<String>, instance: u64) -> Self {
        Self {
            item_id: item_id.into(),
            subject_id: subject_id.into(),
            instance,
        }
    }
}

impl fmt::Display for InstanceIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.item_id, self.subject_id, self.instance)
    }
}

/// Identifies a single node within a unit.
pub type NodeId = String;

/// Identifies a network.
pub type NetworkId = String;
