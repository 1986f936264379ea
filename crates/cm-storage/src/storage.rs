/*
 * SPDX-License-Identifier: Apache-2.0
 */

//! The narrow persistence contract. The core never touches a database
//! directly; every read/write path to durable state goes through this trait.
//! Implementations are assumed transaction-free but read-your-writes, and
//! callers are expected to tolerate duplicate add/update calls.

use async_trait::async_trait;

use cm_model::ident::InstanceIdent;
use cm_model::instance::InstanceInfo;
use cm_model::update::{DesiredStatus, UpdateState};
use cm_model::CmResult;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn add_instance(&self, info: &InstanceInfo) -> CmResult<()>;
    async fn update_instance(&self, info: &InstanceInfo) -> CmResult<()>;
    async fn remove_instance(&self, ident: &InstanceIdent) -> CmResult<()>;
    async fn get_instance(&self, ident: &InstanceIdent) -> CmResult<Option<InstanceInfo>>;
    async fn get_active_instances(&self) -> CmResult<Vec<InstanceInfo>>;

    async fn store_desired_status(&self, status: &DesiredStatus) -> CmResult<()>;
    async fn get_desired_status(&self) -> CmResult<Option<DesiredStatus>>;

    async fn store_update_state(&self, state: UpdateState) -> CmResult<()>;
    async fn get_update_state(&self) -> CmResult<UpdateState>;
}
