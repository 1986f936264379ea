/*
 * SPDX-License-Identifier: Apache-2.0
 */

use async_trait::async_trait;

use cm_model::instance::InstanceStatus;

/// Receives the merged per-instance status set after a `RunInstances` pass.
/// Delivered in the order produced; callbacks to a single listener are
/// serialized.
#[async_trait]
pub trait RunStatusListener: Send + Sync {
    async fn on_run_status_changed(&self, statuses: Vec<InstanceStatus>);
}
