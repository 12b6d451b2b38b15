//! A ready-made strategy for resources stored as one opaque text file
//! (settings, keybindings, and similar single-document state).
//!
//! Reconciliation is three-way over whole contents: the last-synced content
//! is the common ancestor; a side that still matches the ancestor accepts
//! the other side; two diverged sides conflict and the competing versions
//! are materialized as preview scratch files for an external viewer.

use crate::cancel::CancelToken;
use crate::envelope::SyncData;
use crate::error::{SyncError, SyncResult};
use crate::fs::FsError;
use crate::last_sync::LastSyncUserData;
use crate::remote::RemoteUserData;
use crate::resource::{Conflict, SyncResource};
use crate::strategy::{SyncContext, SyncPreview, SyncStrategy};
use async_trait::async_trait;
use tracing::debug;

/// Outcome of the three-way content merge.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MergeResult {
    /// Reconciled content to commit, when a write is needed.
    content: Option<String>,
    /// The local file must be updated.
    local_change: bool,
    /// The remote store must be updated.
    remote_change: bool,
    conflict: bool,
}

impl MergeResult {
    fn unchanged() -> Self {
        Self {
            content: None,
            local_change: false,
            remote_change: false,
            conflict: false,
        }
    }

    fn accept_remote(content: &str) -> Self {
        Self {
            content: Some(content.to_string()),
            local_change: true,
            remote_change: false,
            conflict: false,
        }
    }

    fn push_local(content: &str) -> Self {
        Self {
            content: Some(content.to_string()),
            local_change: false,
            remote_change: true,
            conflict: false,
        }
    }

    fn conflict() -> Self {
        Self {
            content: None,
            local_change: false,
            remote_change: false,
            conflict: true,
        }
    }
}

/// Three-way merge over whole contents. `base` is the last-synced content,
/// `None` when there is no usable ancestor.
fn merge(local: Option<&str>, remote: Option<&str>, base: Option<&str>) -> MergeResult {
    match (local, remote) {
        (None, None) => MergeResult::unchanged(),
        (Some(local), None) => MergeResult::push_local(local),
        (None, Some(remote)) => MergeResult::accept_remote(remote),
        (Some(local), Some(remote)) if local == remote => MergeResult::unchanged(),
        (Some(local), Some(remote)) => match base {
            Some(base) if base == local => MergeResult::accept_remote(remote),
            Some(base) if base == remote => MergeResult::push_local(local),
            _ => MergeResult::conflict(),
        },
    }
}

/// Strategy for a single text-file resource.
pub struct SingleFileStrategy {
    version: u32,
    file_path: String,
    local_preview_path: String,
    remote_preview_path: String,
}

impl SingleFileStrategy {
    pub fn new(resource: SyncResource, sync_home: &str, file_path: &str, version: u32) -> Self {
        let file_name = file_path.rsplit('/').next().unwrap_or(file_path);
        let preview_dir = format!("{sync_home}/{}/preview", resource.key());
        Self {
            version,
            file_path: file_path.to_string(),
            local_preview_path: format!("{preview_dir}/{file_name}.local"),
            remote_preview_path: format!("{preview_dir}/{file_name}.remote"),
        }
    }

    /// Scratch URI showing the local version of a conflict.
    pub fn local_preview_path(&self) -> &str {
        &self.local_preview_path
    }

    /// Scratch URI showing the incoming remote version of a conflict.
    pub fn remote_preview_path(&self) -> &str {
        &self.remote_preview_path
    }

    async fn write_conflict_previews(
        &self,
        ctx: &SyncContext,
        local: Option<&str>,
        remote: Option<&str>,
    ) -> SyncResult<Vec<Conflict>> {
        ctx.fs()
            .create_file(&self.local_preview_path, local.unwrap_or(""), true)
            .await?;
        ctx.fs()
            .create_file(&self.remote_preview_path, remote.unwrap_or(""), true)
            .await?;
        Ok(vec![Conflict {
            local: self.local_preview_path.clone(),
            remote: self.remote_preview_path.clone(),
        }])
    }

    async fn delete_scratch(&self, ctx: &SyncContext) -> SyncResult<()> {
        for path in [&self.local_preview_path, &self.remote_preview_path] {
            match ctx.fs().delete(path).await {
                Ok(()) | Err(FsError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SyncStrategy for SingleFileStrategy {
    fn version(&self) -> u32 {
        self.version
    }

    async fn generate_preview(
        &self,
        ctx: &SyncContext,
        remote: RemoteUserData,
        last: Option<LastSyncUserData>,
        token: &CancelToken,
    ) -> SyncResult<SyncPreview> {
        let local = ctx.local_file_content(&self.file_path).await?;
        token.check()?;

        let local_str = local.as_ref().map(|c| c.content.as_str());
        let remote_str = remote.sync_data.as_ref().map(|d| d.content.as_str());

        // With no last-sync record, a remote envelope written by this very
        // machine is our own previous state and can serve as the ancestor.
        let is_last_sync_from_current_machine = last.is_none()
            && remote
                .sync_data
                .as_ref()
                .and_then(|d| d.machine_id.as_deref())
                == Some(ctx.machine_id());
        let base_str = match &last {
            Some(last) => last.sync_data.as_ref().map(|d| d.content.as_str()),
            None if is_last_sync_from_current_machine => remote_str,
            None => None,
        };

        let merged = merge(local_str, remote_str, base_str);
        debug!(
            resource = %ctx.resource(),
            local_change = merged.local_change,
            remote_change = merged.remote_change,
            conflict = merged.conflict,
            "generated preview"
        );

        let conflicts = if merged.conflict {
            token.check()?;
            self.write_conflict_previews(ctx, local_str, remote_str).await?
        } else {
            Vec::new()
        };

        Ok(SyncPreview {
            remote_user_data: remote,
            last_sync_user_data: last,
            has_local_changed: merged.local_change,
            has_remote_changed: merged.remote_change,
            is_last_sync_from_current_machine,
            conflicts,
            local_content: local,
            merged_content: merged.content,
        })
    }

    async fn generate_pull_preview(
        &self,
        ctx: &SyncContext,
        remote: RemoteUserData,
        last: Option<LastSyncUserData>,
        token: &CancelToken,
    ) -> SyncResult<SyncPreview> {
        let local = ctx.local_file_content(&self.file_path).await?;
        token.check()?;
        let merged_content = remote.sync_data.as_ref().map(|d| d.content.clone());
        Ok(SyncPreview {
            has_local_changed: merged_content.is_some(),
            has_remote_changed: false,
            is_last_sync_from_current_machine: false,
            conflicts: Vec::new(),
            local_content: local,
            merged_content,
            remote_user_data: remote,
            last_sync_user_data: last,
        })
    }

    async fn generate_push_preview(
        &self,
        ctx: &SyncContext,
        remote: RemoteUserData,
        last: Option<LastSyncUserData>,
        token: &CancelToken,
    ) -> SyncResult<SyncPreview> {
        let local = ctx.local_file_content(&self.file_path).await?;
        token.check()?;
        let merged_content = local.as_ref().map(|c| c.content.clone());
        Ok(SyncPreview {
            has_local_changed: false,
            has_remote_changed: merged_content.is_some(),
            is_last_sync_from_current_machine: false,
            conflicts: Vec::new(),
            local_content: local,
            merged_content,
            remote_user_data: remote,
            last_sync_user_data: last,
        })
    }

    async fn generate_replace_preview(
        &self,
        ctx: &SyncContext,
        data: SyncData,
        remote: RemoteUserData,
        last: Option<LastSyncUserData>,
    ) -> SyncResult<SyncPreview> {
        let local = ctx.local_file_content(&self.file_path).await?;
        Ok(SyncPreview {
            has_local_changed: true,
            has_remote_changed: true,
            is_last_sync_from_current_machine: false,
            conflicts: Vec::new(),
            local_content: local,
            merged_content: Some(data.content),
            remote_user_data: remote,
            last_sync_user_data: last,
        })
    }

    async fn update_preview_with_conflict(
        &self,
        _ctx: &SyncContext,
        mut preview: SyncPreview,
        conflict_uri: &str,
        content: &str,
        token: &CancelToken,
    ) -> SyncResult<SyncPreview> {
        let known = preview
            .conflicts
            .iter()
            .any(|c| c.local == conflict_uri || c.remote == conflict_uri);
        if !known {
            return Ok(preview);
        }
        token.check()?;
        preview.conflicts.clear();
        preview.merged_content = Some(content.to_string());
        preview.has_local_changed = true;
        preview.has_remote_changed = true;
        Ok(preview)
    }

    async fn apply_preview(
        &self,
        ctx: &SyncContext,
        preview: SyncPreview,
        force_push: bool,
    ) -> SyncResult<()> {
        if !preview.has_local_changed && !preview.has_remote_changed {
            debug!(resource = %ctx.resource(), "no content changes; updating last sync only");
        }

        if preview.has_local_changed {
            let Some(content) = preview.merged_content.as_deref() else {
                return Err(SyncError::InvalidPreview(
                    "local update without merged content".to_string(),
                ));
            };
            if let Some(current) = &preview.local_content {
                ctx.backup_local(&current.content).await;
            }
            ctx.update_local_file_content(&self.file_path, content, preview.local_content.as_ref())
                .await?;
        }

        let mut remote = preview.remote_user_data;
        if preview.has_remote_changed {
            let Some(content) = preview.merged_content.as_deref() else {
                return Err(SyncError::InvalidPreview(
                    "remote update without merged content".to_string(),
                ));
            };
            let if_match = if force_push {
                None
            } else {
                Some(remote.ref_.clone())
            };
            remote = ctx
                .update_remote_user_data(content.to_string(), if_match.as_deref())
                .await?;
        }

        // Advance the last-sync record to the state both sides converged on,
        // retaining any strategy extras from the previous record.
        let mut last = LastSyncUserData::new(remote.ref_.clone(), remote.sync_data);
        if let Some(previous) = preview.last_sync_user_data {
            last.extras = previous.extras;
        }
        ctx.update_last_sync_user_data(&last).await?;

        self.delete_scratch(ctx).await
    }

    async fn cleanup(&self, ctx: &SyncContext) -> SyncResult<()> {
        self.delete_scratch(ctx).await
    }
}
