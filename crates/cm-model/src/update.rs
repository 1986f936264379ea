/*
 * SPDX-License-Identifier: Apache-2.0
 */

use serde::{Deserialize, Serialize};

use crate::ident::{InstanceIdent, NodeId};
use crate::instance::InstanceStatus;

/// Persisted pipeline state. Persisted on every transition so a process
/// restart resumes at the same step with the stored [`DesiredStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UpdateState {
    #[default]
    None,
    Downloading,
    Pending,
    Installing,
    Launching,
    Finalizing,
}

impl UpdateState {
    /// The state the pipeline advances to on success from this state.
    pub fn next_on_success(self) -> Option<Self> {
        match self {
            Self::None => None,
            Self::Downloading => Some(Self::Pending),
            Self::Pending => Some(Self::Installing),
            Self::Installing => Some(Self::Launching),
            Self::Launching => Some(Self::Finalizing),
            Self::Finalizing => Some(Self::None),
        }
    }

    /// Every non-`None` state unwinds to `None` on error, per the pipeline
    /// diagram.
    pub fn on_error(self) -> Self {
        Self::None
    }
}

/// A cloud-declared desired status: the set of update items to download plus
/// the instances that should end up running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredStatus {
    pub update_items: Vec<UpdateItem>,
    pub instances: Vec<crate::instance::RunServiceRequest>,
    pub node_states: Vec<NodeStateUpdate>,
    pub unit_config: Option<UnitConfigUpdate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateItem {
    pub item_id: String,
    pub item_type: UpdateItemType,
    pub version: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateItemType {
    Service,
    Layer,
    Component,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStateUpdate {
    pub node_id: NodeId,
    pub action: NodeStateAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStateAction {
    Pause,
    Resume,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitConfigUpdate {
    pub version: String,
    pub content: String,
}

/// Per-item, per-node, per-instance, and per-unit-config status reported to
/// the cloud, per the error-handling design's user-visible failure behavior.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub update_items: Vec<ItemStatus>,
    pub node_states: Vec<NodeStatus>,
    pub instances: Vec<InstanceStatus>,
    pub unit_config: Option<UnitConfigStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemStatus {
    pub item_id: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitConfigStatus {
    pub version: String,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_advances_in_order() {
        let mut s = UpdateState::None;
        let order = [
            UpdateState::Downloading,
            UpdateState::Pending,
            UpdateState::Installing,
            UpdateState::Launching,
            UpdateState::Finalizing,
            UpdateState::None,
        ];
        s = UpdateState::Downloading;
        for expected in &order[1..] {
            s = s.next_on_success().expect("every non-terminal state advances");
            assert_eq!(s, *expected);
        }
    }

    #[test]
    fn any_state_unwinds_to_none_on_error() {
        for s in [
            UpdateState::Downloading,
            UpdateState::Pending,
            UpdateState::Installing,
            UpdateState::Launching,
            UpdateState::Finalizing,
        ] {
            assert_eq!(s.on_error(), UpdateState::None);
        }
    }
}
