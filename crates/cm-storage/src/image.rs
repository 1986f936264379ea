/*
 * SPDX-License-Identifier: Apache-2.0
 */

use async_trait::async_trait;
use std::sync::Arc;

use cm_model::service::{LayerInfo, ServiceInfo};
use cm_model::update::{ItemStatus, UpdateItem};
use cm_model::CmResult;

/// Resolves `ServiceInfo`/`LayerInfo` and their local URLs.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn get_service_info(&self, service_id: &str) -> CmResult<ServiceInfo>;
    async fn get_layers(&self, digests: &[String]) -> CmResult<Vec<LayerInfo>>;
    async fn subscribe_listener(&self, listener: Arc<dyn ServiceListener>) -> CmResult<()>;
}

/// Notifies the instance manager that a service's backing image was removed.
#[async_trait]
pub trait ServiceListener: Send + Sync {
    async fn on_service_removed(&self, service_id: &str);
}

/// Drives download/install of update items. Decrypt/verify mechanics are the
/// external collaborator's concern; the core only sees item identities and
/// outcomes.
#[async_trait]
pub trait ImageManager: Send + Sync {
    async fn download_update_items(&self, items: &[UpdateItem]) -> CmResult<Vec<ItemStatus>>;
    async fn install_update_items(&self, items: &[UpdateItem]) -> CmResult<Vec<ItemStatus>>;
    async fn cancel(&self);
}
