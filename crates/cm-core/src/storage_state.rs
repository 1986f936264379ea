/*
 * SPDX-License-Identifier: Apache-2.0
 */

//! Per-instance state and storage directories with per-user filesystem
//! quotas, and bidirectional state synchronization with the cloud.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};

use cm_model::ident::InstanceIdent;
use cm_model::state::{Checksum, NewState, StateRequest, StateResult, StorageStateInfo};
use cm_model::{CmError, CmResult};

use cm_storage::fs::{FsEvent, FsEventSubscriber, FsPlatform, FsWatcher};
use cm_storage::hash::sha3_224;
use cm_storage::sender::StorageStateSender;

#[derive(Debug, Clone)]
pub struct Config {
    pub storage_dir: String,
    pub state_dir: String,
}

pub struct SetupParams {
    pub uid: u32,
    pub gid: u32,
    pub state_quota: u64,
    pub storage_quota: u64,
}

struct Inner {
    config: Config,
    platform: Arc<dyn FsPlatform>,
    watcher: Arc<dyn FsWatcher>,
    sender: Arc<dyn StorageStateSender>,
    records: Mutex<HashMap<InstanceIdent, StorageStateInfo>>,
    event_tx: mpsc::UnboundedSender<InstanceIdent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<InstanceIdent>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// The StorageState manager. Owns one worker for filesystem change events
/// plus a lock for all record-mutation paths.
#[derive(Clone)]
pub struct StorageState(Arc<Inner>);

impl StorageState {
    pub fn new(
        config: Config,
        platform: Arc<dyn FsPlatform>,
        watcher: Arc<dyn FsWatcher>,
        sender: Arc<dyn StorageStateSender>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self(Arc::new(Inner {
            config,
            platform,
            watcher,
            sender,
            records: Mutex::new(HashMap::new()),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            shutdown_tx: Mutex::new(None),
            worker: Mutex::new(None),
        }))
    }

    fn state_path(&self, ident: &InstanceIdent) -> String {
        format!(
            "{}/{}/{}/{}/state.dat",
            self.0.config.state_dir, ident.item_id, ident.subject_id, ident.instance
        )
    }

    fn storage_path(&self, ident: &InstanceIdent) -> String {
        format!(
            "{}/{}/{}/{}",
            self.0.config.storage_dir, ident.item_id, ident.subject_id, ident.instance
        )
    }

    fn state_dir(&self, ident: &InstanceIdent) -> String {
        format!(
            "{}/{}/{}/{}",
            self.0.config.state_dir, ident.item_id, ident.subject_id, ident.instance
        )
    }

    pub async fn start(&self) {
        let mut rx_guard = self.0.event_rx.lock().await;
        let Some(mut rx) = rx_guard.take() else {
            return;
        };
        drop(rx_guard);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.0.shutdown_tx.lock().await = Some(shutdown_tx);

        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    maybe_ident = rx.recv() => {
                        match maybe_ident {
                            Some(ident) => this.handle_fs_event(&ident).await,
                            None => break,
                        }
                    }
                }
            }
        });
        *self.0.worker.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        if let Some(tx) = self.0.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.0.worker.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Reads the state file, hashes it, and if the hash differs from the
    /// held checksum, emits `NewState` and records the new checksum. Events
    /// are coalesced by instance since each enqueue carries only the
    /// identifier, not the stale content.
    async fn handle_fs_event(&self, ident: &InstanceIdent) {
        let path = self.state_path(ident);
        let content = match tokio::fs::read(&path).await {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(instance = %ident, error = %err, "failed to read state file after fs event");
                return;
            }
        };
        let digest = sha3_224(&content);

        let mut records = self.0.records.lock().await;
        let Some(record) = records.get_mut(ident) else {
            return;
        };
        let checksum = Checksum::from_digest(&digest);
        if checksum == record.checksum {
            return;
        }
        record.checksum = checksum.clone();
        drop(records);

        if let Err(err) = self
            .0
            .sender
            .send_new_state(NewState {
                ident: ident.clone(),
                content,
                checksum,
            })
            .await
        {
            tracing::warn!(instance = %ident, error = %err, "failed to send new state");
        }
    }

    /// Idempotent: if a prior record exists with identical quotas, skip
    /// quota reapplication. `stateQuota==0` removes the state tree;
    /// `storageQuota==0` removes the storage tree; both-zero is valid.
    pub async fn setup(&self, ident: &InstanceIdent, params: SetupParams) -> CmResult<(Option<String>, Option<String>)> {
        let existing = self.0.records.lock().await.get(ident).cloned();
        let quotas_unchanged = existing
            .as_ref()
            .is_some_and(|r| r.state_quota == params.state_quota && r.storage_quota == params.storage_quota);

        if params.state_quota == 0 {
            self.remove_state_tree(ident).await?;
        }
        if params.storage_quota == 0 {
            self.remove_storage_tree(ident).await?;
        }

        if !quotas_unchanged {
            self.apply_quotas(ident, &params).await?;
        }

        let mut state_path = None;
        if params.state_quota > 0 {
            state_path = Some(self.ensure_state_file(ident, params.uid, params.gid).await?);
        }
        let mut storage_path = None;
        if params.storage_quota > 0 {
            storage_path = Some(self.ensure_storage_dir(ident, params.uid, params.gid).await?);
        }

        let checksum = existing.as_ref().map(|r| r.checksum.clone()).unwrap_or_default();
        if let Some(path) = &state_path {
            if let Ok(content) = tokio::fs::read(path).await {
                let digest = sha3_224(&content);
                if Checksum::from_digest(&digest) != checksum && !checksum.is_empty() {
                    self.0
                        .sender
                        .send_state_request(StateRequest {
                            ident: ident.clone(),
                            default: false,
                        })
                        .await?;
                }
            }
        }

        self.0.records.lock().await.insert(
            ident.clone(),
            StorageStateInfo {
                ident: ident.clone(),
                uid: params.uid,
                gid: params.gid,
                storage_quota: params.storage_quota,
                state_quota: params.state_quota,
                checksum,
            },
        );

        Ok((storage_path, state_path))
    }

    async fn apply_quotas(&self, ident: &InstanceIdent, params: &SetupParams) -> CmResult<()> {
        let storage_path = self.storage_path(ident);
        let state_path = self.state_dir(ident);
        let storage_mount = self.0.platform.get_mount_point(&storage_path).await?;
        let state_mount = self.0.platform.get_mount_point(&state_path).await?;

        if storage_mount == state_mount {
            let combined = params.storage_quota + params.state_quota;
            self.0.platform.set_user_quota(&storage_mount, combined, params.uid).await?;
        } else {
            if params.storage_quota > 0 {
                self.0
                    .platform
                    .set_user_quota(&storage_path, params.storage_quota, params.uid)
                    .await?;
            }
            if params.state_quota > 0 {
                self.0
                    .platform
                    .set_user_quota(&state_path, params.state_quota, params.uid)
                    .await?;
            }
        }
        Ok(())
    }

    async fn ensure_state_file(&self, ident: &InstanceIdent, uid: u32, gid: u32) -> CmResult<String> {
        let dir = self.state_dir(ident);
        let path = self.state_path(ident);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CmError::failed_with(format!("create state dir {dir}"), e))?;
        if tokio::fs::metadata(&path).await.is_err() {
            tokio::fs::write(&path, [])
                .await
                .map_err(|e| CmError::failed_with(format!("create state file {path}"), e))?;
        }
        self.0.platform.change_owner(&path, uid, gid).await?;
        self.0
            .watcher
            .subscribe(
                &path,
                Arc::new(PathSubscriber {
                    inner: Arc::downgrade(&self.0),
                    ident: ident.clone(),
                }),
            )
            .await?;
        Ok(path)
    }

    async fn ensure_storage_dir(&self, ident: &InstanceIdent, uid: u32, gid: u32) -> CmResult<String> {
        let path = self.storage_path(ident);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| CmError::failed_with(format!("create storage dir {path}"), e))?;
        self.0.platform.change_owner(&path, uid, gid).await?;
        Ok(path)
    }

    /// Rejects if `content.len() > quota`; rejects if the checksum does not
    /// match `SHA3-224(content)`; writes atomically with mode 0600.
    pub async fn update_state(&self, ident: &InstanceIdent, content: &[u8], checksum: &Checksum) -> CmResult<()> {
        let quota = {
            let records = self.0.records.lock().await;
            let record = records
                .get(ident)
                .ok_or_else(|| CmError::not_found(format!("no storage state record for {ident}")))?;
            record.state_quota
        };
        if content.len() as u64 > quota {
            return Err(CmError::invalid_argument(format!(
                "state content {} bytes exceeds quota {quota}",
                content.len()
            )));
        }
        let expected = Checksum::from_digest(&sha3_224(content));
        if &expected != checksum {
            return Err(CmError::invalid_checksum("state content does not match supplied checksum"));
        }

        let path = self.state_path(ident);
        write_atomic_0600(&path, content).await?;

        let mut records = self.0.records.lock().await;
        if let Some(record) = records.get_mut(ident) {
            record.checksum = checksum.clone();
        }
        Ok(())
    }

    /// On `Accepted`, persists the checksum; on any other result, re-emits
    /// `StateRequest(default=false)`. Rejects with `InvalidChecksum` if the
    /// supplied checksum doesn't match the held one.
    pub async fn accept_state(
        &self,
        ident: &InstanceIdent,
        checksum: &Checksum,
        result: StateResult,
        _reason: &str,
    ) -> CmResult<()> {
        let mut records = self.0.records.lock().await;
        let record = records
            .get_mut(ident)
            .ok_or_else(|| CmError::not_found(format!("no storage state record for {ident}")))?;
        if &record.checksum != checksum {
            return Err(CmError::invalid_checksum("accept_state checksum does not match held content"));
        }
        match result {
            StateResult::Accepted => Ok(()),
            StateResult::Rejected => {
                drop(records);
                self.0
                    .sender
                    .send_state_request(StateRequest {
                        ident: ident.clone(),
                        default: false,
                    })
                    .await
            }
        }
    }

    pub async fn instance_checksum(&self, ident: &InstanceIdent) -> CmResult<Checksum> {
        self.0
            .records
            .lock()
            .await
            .get(ident)
            .map(|r| r.checksum.clone())
            .ok_or_else(|| CmError::not_found(format!("no storage state record for {ident}")))
    }

    /// Stops watching; retains files on disk.
    pub async fn cleanup(&self, ident: &InstanceIdent) -> CmResult<()> {
        self.0.watcher.unsubscribe(&self.state_path(ident)).await
    }

    /// Stops watching; deletes the state tree, storage tree, and record.
    pub async fn remove(&self, ident: &InstanceIdent) -> CmResult<()> {
        self.cleanup(ident).await?;
        self.remove_state_tree(ident).await?;
        self.remove_storage_tree(ident).await?;
        self.0.records.lock().await.remove(ident);
        Ok(())
    }

    async fn remove_state_tree(&self, ident: &InstanceIdent) -> CmResult<()> {
        let dir = self.state_dir(ident);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) | Err(_) => Ok(()),
        }
    }

    async fn remove_storage_tree(&self, ident: &InstanceIdent) -> CmResult<()> {
        let dir = self.storage_path(ident);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) | Err(_) => Ok(()),
        }
    }

    pub async fn total_state_size(&self) -> CmResult<u64> {
        self.0.platform.get_total_size(&self.0.config.state_dir).await
    }

    pub async fn total_storage_size(&self) -> CmResult<u64> {
        self.0.platform.get_total_size(&self.0.config.storage_dir).await
    }

    pub async fn is_same_partition(&self) -> CmResult<bool> {
        Ok(self.0.platform.get_mount_point(&self.0.config.storage_dir).await?
            == self.0.platform.get_mount_point(&self.0.config.state_dir).await?)
    }
}

#[cfg(unix)]
async fn write_atomic_0600(path: &str, content: &[u8]) -> CmResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let tmp_path = format!("{path}.tmp");
    tokio::fs::write(&tmp_path, content)
        .await
        .map_err(|e| CmError::failed_with(format!("write {tmp_path}"), e))?;
    tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| CmError::failed_with(format!("chmod {tmp_path}"), e))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| CmError::failed_with(format!("rename {tmp_path} -> {path}"), e))
}

#[cfg(not(unix))]
async fn write_atomic_0600(path: &str, content: &[u8]) -> CmResult<()> {
    let tmp_path = format!("{path}.tmp");
    tokio::fs::write(&tmp_path, content)
        .await
        .map_err(|e| CmError::failed_with(format!("write {tmp_path}"), e))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| CmError::failed_with(format!("rename {tmp_path} -> {path}"), e))
}

struct PathSubscriber {
    inner: Weak<Inner>,
    ident: InstanceIdent,
}

#[async_trait]
impl FsEventSubscriber for PathSubscriber {
    async fn on_fs_event(&self, _path: &str, _event: FsEvent) {
        if let Some(inner) = self.inner.upgrade() {
            let _ = inner.event_tx.send(self.ident.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_storage::test_util::{InMemoryFsPlatform, InMemoryFsWatcher, RecordingSender};

    fn storage_state() -> (StorageState, Arc<InMemoryFsWatcher>, Arc<RecordingSender>) {
        let watcher = Arc::new(InMemoryFsWatcher::new());
        let sender = Arc::new(RecordingSender::new());
        let ss = StorageState::new(
            Config {
                storage_dir: "/tmp/cm-test/storages".to_string(),
                state_dir: "/tmp/cm-test/states".to_string(),
            },
            Arc::new(InMemoryFsPlatform::new()),
            watcher.clone(),
            sender.clone(),
        );
        (ss, watcher, sender)
    }

    #[tokio::test]
    async fn setup_with_zero_state_quota_returns_no_state_path() {
        let (ss, _watcher, _sender) = storage_state();
        let ident = InstanceIdent::new("item", "subj", 7);
        let (storage_path, state_path) = ss
            .setup(
                &ident,
                SetupParams {
                    uid: 6000,
                    gid: 6000,
                    state_quota: 0,
                    storage_quota: 1024,
                },
            )
            .await
            .unwrap();
        assert!(state_path.is_none());
        assert!(storage_path.is_some());
    }

    #[tokio::test]
    async fn update_state_rejects_oversize_content() {
        let (ss, _watcher, _sender) = storage_state();
        let ident = InstanceIdent::new("item", "subj", 1);
        ss.setup(
            &ident,
            SetupParams {
                uid: 6001,
                gid: 6001,
                state_quota: 4,
                storage_quota: 0,
            },
        )
        .await
        .unwrap();

        let content = b"12345";
        let checksum = Checksum::from_digest(&sha3_224(content));
        let err = ss.update_state(&ident, content, &checksum).await.unwrap_err();
        assert!(matches!(err, CmError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn update_state_round_trip() {
        let (ss, _watcher, _sender) = storage_state();
        let ident = InstanceIdent::new("item", "subj", 2);
        ss.setup(
            &ident,
            SetupParams {
                uid: 6002,
                gid: 6002,
                state_quota: 1024,
                storage_quota: 0,
            },
        )
        .await
        .unwrap();

        let content = b"abc";
        let checksum = Checksum::from_digest(&sha3_224(content));
        ss.update_state(&ident, content, &checksum).await.unwrap();
        assert_eq!(ss.instance_checksum(&ident).await.unwrap(), checksum);
    }
}
