//! Strategy surface a concrete resource supplies, plus the engine handle
//! through which strategies reach the shared primitives.
//!
//! The engine owns the state machine and retry loops; a strategy owns the
//! meaning of its content: how to reconcile three ways, and how to commit a
//! reconciled preview to the local and remote stores.

use crate::backup::BackupStore;
use crate::cancel::CancelToken;
use crate::envelope::SyncData;
use crate::error::{SyncError, SyncResult};
use crate::fs::{FileContent, FileSystem, FsError};
use crate::last_sync::{LastSyncStore, LastSyncUserData};
use crate::remote::{Headers, RemoteStore, RemoteUserData};
use crate::resource::{Conflict, SyncResource};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// A strategy-produced reconciliation result, pending application.
///
/// The engine treats the preview by its flags; everything else is payload
/// the strategy reads back in `apply_preview`.
#[derive(Debug, Clone)]
pub struct SyncPreview {
    /// The remote state the preview was computed against.
    pub remote_user_data: RemoteUserData,
    /// The last-sync state the preview was computed against.
    pub last_sync_user_data: Option<LastSyncUserData>,
    /// Applying will change the local store.
    pub has_local_changed: bool,
    /// Applying will change the remote store.
    pub has_remote_changed: bool,
    /// The remote state was last written by this machine.
    pub is_last_sync_from_current_machine: bool,
    /// Pending conflicts; non-empty previews cannot be applied.
    pub conflicts: Vec<Conflict>,
    /// Local file snapshot at preview time, for conditional writes.
    pub local_content: Option<FileContent>,
    /// The reconciled content to commit.
    pub merged_content: Option<String>,
}

impl SyncPreview {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Engine handle exposing the utility primitives strategies build on.
///
/// One context per synchronizer instance; the per-invocation request headers
/// are routed through it so every remote call of one sync round carries them.
pub struct SyncContext {
    resource: SyncResource,
    machine_id: String,
    version: u32,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) backup: Arc<dyn BackupStore>,
    fs: Arc<dyn FileSystem>,
    pub(crate) last_sync: LastSyncStore,
    headers: Mutex<Headers>,
}

impl SyncContext {
    pub(crate) fn new(
        resource: SyncResource,
        machine_id: String,
        version: u32,
        remote: Arc<dyn RemoteStore>,
        backup: Arc<dyn BackupStore>,
        fs: Arc<dyn FileSystem>,
        last_sync: LastSyncStore,
    ) -> Self {
        Self {
            resource,
            machine_id,
            version,
            remote,
            backup,
            fs,
            last_sync,
            headers: Mutex::new(Headers::new()),
        }
    }

    pub fn resource(&self) -> SyncResource {
        self.resource
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    pub(crate) fn set_headers(&self, headers: Headers) {
        *self.headers.lock().unwrap() = headers;
    }

    pub(crate) fn clear_headers(&self) {
        self.headers.lock().unwrap().clear();
    }

    fn headers(&self) -> Headers {
        self.headers.lock().unwrap().clone()
    }

    /// Read and parse the latest remote state. Pass `last` for a cheap read
    /// when the local view may already be current; `None` forces a fresh
    /// fetch.
    pub async fn remote_user_data(
        &self,
        last: Option<&LastSyncUserData>,
    ) -> SyncResult<RemoteUserData> {
        let raw = self.remote.read(self.resource, last, &self.headers()).await?;
        let sync_data = match raw.content {
            None => None,
            Some(text) => Some(SyncData::from_json(&text).ok_or_else(|| {
                SyncError::Incompatible {
                    resource: self.resource,
                    detail: "unparseable remote envelope".to_string(),
                }
            })?),
        };
        Ok(RemoteUserData {
            ref_: raw.ref_,
            sync_data,
        })
    }

    /// Write new content to the remote store, wrapped in an envelope stamped
    /// with this machine. `if_match` of `None` forces the write.
    pub async fn update_remote_user_data(
        &self,
        content: String,
        if_match: Option<&str>,
    ) -> SyncResult<RemoteUserData> {
        let data = SyncData::new(self.version, Some(self.machine_id.clone()), content);
        let ref_ = self
            .remote
            .write(self.resource, &data.to_json(), if_match, &self.headers())
            .await?;
        Ok(RemoteUserData {
            ref_,
            sync_data: Some(data),
        })
    }

    /// Load the persisted last-sync record.
    pub async fn last_sync_user_data(&self) -> Option<LastSyncUserData> {
        self.last_sync.load().await
    }

    /// Persist the last-sync record.
    pub async fn update_last_sync_user_data(&self, data: &LastSyncUserData) -> SyncResult<()> {
        self.last_sync.save(data).await
    }

    /// Back up local content before it is overwritten. Backup failures are
    /// logged, not surfaced: losing a backup must not fail the sync.
    pub async fn backup_local(&self, content: &str) {
        let data = SyncData::new(self.version, Some(self.machine_id.clone()), content);
        if let Err(e) = self.backup.backup(self.resource, &data.to_json()).await {
            warn!(resource = %self.resource, "local backup failed: {e}");
        }
    }

    /// Read the local file, `None` when it does not exist.
    pub async fn local_file_content(&self, path: &str) -> SyncResult<Option<FileContent>> {
        match self.fs.read_file(path).await {
            Ok(content) => Ok(Some(content)),
            Err(FsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the local file conditionally. With a snapshot the write fails
    /// if the file changed since; without one it creates with no-overwrite.
    /// Intervening local writes surface as `LocalPreconditionFailed` to
    /// drive the engine's retry.
    pub async fn update_local_file_content(
        &self,
        path: &str,
        content: &str,
        old: Option<&FileContent>,
    ) -> SyncResult<FileContent> {
        let result = match old {
            Some(snapshot) => self.fs.write_file(path, content, Some(snapshot)).await,
            None => self.fs.create_file(path, content, false).await,
        };
        result.map_err(|e| match e {
            FsError::NotFound(path)
            | FsError::ModifiedSince(path)
            | FsError::AlreadyExists(path) => SyncError::LocalPreconditionFailed { path },
            other => other.into(),
        })
    }
}

/// The operations a concrete resource supplies.
#[async_trait]
pub trait SyncStrategy: Send + Sync {
    /// Content schema version. Remote envelopes with a greater version are
    /// incompatible with this strategy.
    fn version(&self) -> u32;

    /// Three-way reconciliation of local, remote, and last-synced state.
    async fn generate_preview(
        &self,
        ctx: &SyncContext,
        remote: RemoteUserData,
        last: Option<LastSyncUserData>,
        token: &CancelToken,
    ) -> SyncResult<SyncPreview>;

    /// Force-overwrite-local-from-remote preview.
    async fn generate_pull_preview(
        &self,
        ctx: &SyncContext,
        remote: RemoteUserData,
        last: Option<LastSyncUserData>,
        token: &CancelToken,
    ) -> SyncResult<SyncPreview>;

    /// Force-overwrite-remote-from-local preview.
    async fn generate_push_preview(
        &self,
        ctx: &SyncContext,
        remote: RemoteUserData,
        last: Option<LastSyncUserData>,
        token: &CancelToken,
    ) -> SyncResult<SyncPreview>;

    /// Preview replacing both sides with externally supplied content.
    async fn generate_replace_preview(
        &self,
        ctx: &SyncContext,
        data: SyncData,
        remote: RemoteUserData,
        last: Option<LastSyncUserData>,
    ) -> SyncResult<SyncPreview>;

    /// Incorporate the user's resolution of one conflict into the preview.
    async fn update_preview_with_conflict(
        &self,
        ctx: &SyncContext,
        preview: SyncPreview,
        conflict_uri: &str,
        content: &str,
        token: &CancelToken,
    ) -> SyncResult<SyncPreview>;

    /// Commit a conflict-free preview to the local and remote stores. This
    /// is the only place that writes through the context primitives.
    async fn apply_preview(
        &self,
        ctx: &SyncContext,
        preview: SyncPreview,
        force_push: bool,
    ) -> SyncResult<()>;

    /// Drop any scratch state (e.g. on-disk conflict previews). Called from
    /// `stop()`; missing scratch is not an error.
    async fn cleanup(&self, _ctx: &SyncContext) -> SyncResult<()> {
        Ok(())
    }
}
