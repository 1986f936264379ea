/*
 * SPDX-License-Identifier: Apache-2.0
 */

use async_trait::async_trait;
use std::sync::Arc;

use cm_model::CmResult;

/// Filesystem platform operations StorageState drives directly: quota
/// application, ownership, mount-point lookups.
#[async_trait]
pub trait FsPlatform: Send + Sync {
    async fn get_mount_point(&self, path: &str) -> CmResult<String>;
    async fn change_owner(&self, path: &str, uid: u32, gid: u32) -> CmResult<()>;
    async fn set_user_quota(&self, path: &str, bytes: u64, uid: u32) -> CmResult<()>;
    async fn get_total_size(&self, path: &str) -> CmResult<u64>;
}

/// A filesystem change event delivered by [`FsWatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEvent {
    Modified,
    Removed,
}

/// Receives [`FsEvent`] notifications for paths it has subscribed to.
#[async_trait]
pub trait FsEventSubscriber: Send + Sync {
    async fn on_fs_event(&self, path: &str, event: FsEvent);
}

/// Subscribes/unsubscribes paths for change notification. `subscriber` is
/// held as a shared handle rather than a raw pointer, per the "pointer
/// graphs to owned indices" redesign note.
#[async_trait]
pub trait FsWatcher: Send + Sync {
    async fn subscribe(&self, path: &str, subscriber: Arc<dyn FsEventSubscriber>) -> CmResult<()>;
    async fn unsubscribe(&self, path: &str) -> CmResult<()>;
}
