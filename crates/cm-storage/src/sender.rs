/*
 * SPDX-License-Identifier: Apache-2.0
 */

use async_trait::async_trait;

use cm_model::state::{NewState, StateRequest};
use cm_model::update::UnitStatus;
use cm_model::CmResult;

/// StorageState's cloud channel: `SendStateRequest`, `SendNewState`.
#[async_trait]
pub trait StorageStateSender: Send + Sync {
    async fn send_state_request(&self, request: StateRequest) -> CmResult<()>;
    async fn send_new_state(&self, state: NewState) -> CmResult<()>;
}

/// UpdateManager's cloud channel: `SendUnitStatus`.
#[async_trait]
pub trait UnitStatusSender: Send + Sync {
    async fn send_unit_status(&self, status: UnitStatus) -> CmResult<()>;
}
