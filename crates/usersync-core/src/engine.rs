//! The reconciliation driver: status machine, preview lifecycle, and the
//! optimistic-concurrency sync loop.
//!
//! One `Synchronizer` per resource. The public entries enforce single-flight
//! semantics through the status gate: `sync` refuses re-entry while a cycle
//! is in flight or conflicts are pending, and `pull`/`push`/`replace` stop
//! any in-flight work before forcing their direction.

use crate::backup::BackupStore;
use crate::cancel::CancelToken;
use crate::enablement::SyncEnablement;
use crate::envelope::SyncData;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::fs::FileSystem;
use crate::handle::{BackupAuthority, SyncHandleUri, SyncResourceHandle};
use crate::last_sync::{LastSyncStore, LastSyncUserData};
use crate::remote::{Headers, RemoteStore, RemoteUserData, SyncManifest};
use crate::resource::{Conflict, SyncResource, SyncStatus};
use crate::scheduler::Delayer;
use crate::strategy::{SyncContext, SyncPreview, SyncStrategy};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Safety cap on the precondition retry loop. Each retry consumes a newer
/// remote ref or local revision, so hitting the cap means something is
/// rewriting state faster than the sync can progress.
const MAX_PRECONDITION_RETRIES: u32 = 8;

/// Debounce window for coalescing local file events.
const LOCAL_CHANGE_DELAY: Duration = Duration::from_millis(50);

/// The single in-flight preview. `produced` is `None` while the strategy is
/// still generating; the token cancels the generation.
struct PreviewSlot {
    token: CancelToken,
    produced: Option<SyncPreview>,
}

/// Per-resource synchronization engine.
pub struct Synchronizer<S: SyncStrategy> {
    strategy: S,
    ctx: SyncContext,
    enablement: Arc<dyn SyncEnablement>,
    status: Mutex<SyncStatus>,
    conflicts: Mutex<Vec<Conflict>>,
    preview: Mutex<Option<PreviewSlot>>,
    events: EventBus,
    local_change_delayer: Delayer,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: SyncStrategy + 'static> Synchronizer<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resource: SyncResource,
        strategy: S,
        remote: Arc<dyn RemoteStore>,
        backup: Arc<dyn BackupStore>,
        fs: Arc<dyn FileSystem>,
        enablement: Arc<dyn SyncEnablement>,
        sync_home: &str,
        machine_id: &str,
    ) -> Self {
        let last_sync = LastSyncStore::new(Arc::clone(&fs), sync_home, resource, strategy.version());
        let ctx = SyncContext::new(
            resource,
            machine_id.to_string(),
            strategy.version(),
            remote,
            backup,
            fs,
            last_sync,
        );
        Self {
            strategy,
            ctx,
            enablement,
            status: Mutex::new(SyncStatus::Idle),
            conflicts: Mutex::new(Vec::new()),
            preview: Mutex::new(None),
            events: EventBus::new(),
            local_change_delayer: Delayer::new(LOCAL_CHANGE_DELAY),
            watch_task: Mutex::new(None),
        }
    }

    pub fn resource(&self) -> SyncResource {
        self.ctx.resource()
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.lock().unwrap()
    }

    pub fn conflicts(&self) -> Vec<Conflict> {
        self.conflicts.lock().unwrap().clone()
    }

    /// Subscribe to status, conflict, and local-change events. Drop the
    /// receiver to unsubscribe.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
        self.events.subscribe()
    }

    fn is_enabled(&self) -> bool {
        self.enablement.is_enabled(self.resource())
    }

    // ------------------------------------------------------------------
    // Status machine
    // ------------------------------------------------------------------

    /// Transition to `new`, firing exactly one event. Setting the current
    /// status again is silent. Leaving `HasConflicts` clears the conflict
    /// list before the status event is observable.
    fn set_status(&self, new: SyncStatus) {
        let old = {
            let mut status = self.status.lock().unwrap();
            if *status == new {
                return;
            }
            let old = *status;
            *status = new;
            old
        };

        if old == SyncStatus::HasConflicts {
            self.update_conflicts(Vec::new());
            if new == SyncStatus::Idle {
                info!(resource = %self.resource(), "sync/conflictsResolved");
            }
        }
        if new == SyncStatus::HasConflicts {
            info!(resource = %self.resource(), "sync/conflictsDetected");
        }

        self.events.emit(SyncEvent::StatusChanged {
            resource: self.resource(),
            status: new,
        });
    }

    /// Replace the conflict list atomically; no event when unchanged.
    fn update_conflicts(&self, new: Vec<Conflict>) {
        {
            let mut conflicts = self.conflicts.lock().unwrap();
            if *conflicts == new {
                return;
            }
            *conflicts = new.clone();
        }
        self.events.emit(SyncEvent::ConflictsChanged {
            resource: self.resource(),
            conflicts: new,
        });
    }

    // ------------------------------------------------------------------
    // Preview lifecycle
    // ------------------------------------------------------------------

    /// Install an empty preview slot, returning its cancel token. The prior
    /// slot must have been cleared (applied, errored, or stopped).
    fn begin_preview(&self) -> CancelToken {
        let token = CancelToken::new();
        let mut slot = self.preview.lock().unwrap();
        *slot = Some(PreviewSlot {
            token: token.clone(),
            produced: None,
        });
        token
    }

    /// Park a produced preview in the slot, unless `stop()` raced us and
    /// cleared it.
    fn store_produced(&self, preview: SyncPreview) {
        let mut slot = self.preview.lock().unwrap();
        if let Some(slot) = slot.as_mut() {
            slot.produced = Some(preview);
        }
    }

    /// Take the produced preview out of the slot, keeping the slot itself.
    fn take_produced(&self) -> Option<SyncPreview> {
        let mut slot = self.preview.lock().unwrap();
        slot.as_mut().and_then(|slot| slot.produced.take())
    }

    fn clear_preview(&self) {
        *self.preview.lock().unwrap() = None;
    }

    /// Run the strategy's preview generation inside the slot. A `stop()`
    /// during generation cancels the token; the result is then discarded so
    /// a cancelled preview is never applied.
    async fn generate_preview_guarded(
        &self,
        remote: &RemoteUserData,
        last: &Option<LastSyncUserData>,
    ) -> SyncResult<SyncPreview> {
        let token = self.begin_preview();
        let result = self
            .strategy
            .generate_preview(&self.ctx, remote.clone(), last.clone(), &token)
            .await;
        if token.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        result
    }

    // ------------------------------------------------------------------
    // Driver
    // ------------------------------------------------------------------

    /// Normal periodic entry. Refuses re-entry while syncing or while
    /// conflicts are pending; disabled resources are stopped back to idle
    /// without any remote request. `headers` apply to every remote call of
    /// this invocation and are cleared afterward.
    pub async fn sync(&self, manifest: Option<&SyncManifest>, headers: Headers) -> SyncResult<()> {
        if !self.is_enabled() {
            debug!(resource = %self.resource(), "skipping sync: disabled");
            if self.status() != SyncStatus::Idle {
                self.stop().await?;
            }
            return Ok(());
        }
        match self.status() {
            SyncStatus::HasConflicts => {
                debug!(resource = %self.resource(), "skipping sync: has conflicts");
                return Ok(());
            }
            SyncStatus::Syncing => {
                debug!(resource = %self.resource(), "skipping sync: already syncing");
                return Ok(());
            }
            SyncStatus::Idle => {}
        }

        self.set_status(SyncStatus::Syncing);
        self.ctx.set_headers(headers);
        let result = async {
            let last = self.ctx.last_sync_user_data().await;
            let remote = self.latest_remote_user_data(manifest, last.as_ref()).await?;
            self.perform_sync(remote, last).await
        }
        .await;
        self.ctx.clear_headers();

        match result {
            Ok(status) => {
                self.set_status(status);
                Ok(())
            }
            // stop() already restored idle; cancellation is silent
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => {
                self.set_status(SyncStatus::Idle);
                Err(e)
            }
        }
    }

    /// Manifest short-circuit: when the server's current ref for this
    /// resource equals the last-sync ref (or the resource is absent on both
    /// sides), the last-sync record already is the remote view and the fetch
    /// is skipped. Pure bandwidth optimization; refs are monotonic.
    async fn latest_remote_user_data(
        &self,
        manifest: Option<&SyncManifest>,
        last: Option<&LastSyncUserData>,
    ) -> SyncResult<RemoteUserData> {
        if let (Some(manifest), Some(last)) = (manifest, last) {
            match manifest.latest_ref(self.resource()) {
                Some(latest) if latest == last.ref_ => return Ok(RemoteUserData::from(last)),
                None if last.sync_data.is_none() => return Ok(RemoteUserData::from(last)),
                _ => {}
            }
        }
        self.ctx.remote_user_data(last).await
    }

    /// The optimistic-concurrency loop around `do_sync`. Local precondition
    /// failures retry against the same remote state; remote precondition
    /// failures refetch both the remote state (bypassing any cache) and the
    /// last-sync record, since a concurrent syncer may have advanced either.
    async fn perform_sync(
        &self,
        mut remote: RemoteUserData,
        mut last: Option<LastSyncUserData>,
    ) -> SyncResult<SyncStatus> {
        let mut attempts = 0;
        loop {
            if let Some(data) = &remote.sync_data {
                if data.version > self.strategy.version() {
                    warn!(
                        resource = %self.resource(),
                        remote_version = data.version,
                        local_version = self.strategy.version(),
                        "sync/incompatible"
                    );
                    return Err(SyncError::Incompatible {
                        resource: self.resource(),
                        detail: format!(
                            "remote version {} is newer than supported version {}",
                            data.version,
                            self.strategy.version()
                        ),
                    });
                }
            }

            match self.do_sync(&remote, &last).await {
                Ok(status) => return Ok(status),
                Err(SyncError::LocalPreconditionFailed { path }) => {
                    debug!(resource = %self.resource(), %path, "local changed mid-apply, retrying");
                }
                Err(SyncError::PreconditionFailed { .. }) => {
                    debug!(resource = %self.resource(), "remote ref moved mid-apply, refetching");
                    remote = self.ctx.remote_user_data(None).await?;
                    last = self.ctx.last_sync_user_data().await;
                }
                Err(e) => return Err(e),
            }

            attempts += 1;
            if attempts >= MAX_PRECONDITION_RETRIES {
                return Err(SyncError::TooManyRetries {
                    resource: self.resource(),
                    attempts,
                });
            }
        }
    }

    /// One reconciliation step: produce a preview (unless one is already
    /// parked), then either surface its conflicts or apply it. The preview
    /// slot survives only the conflict path; apply and error both clear it.
    async fn do_sync(
        &self,
        remote: &RemoteUserData,
        last: &Option<LastSyncUserData>,
    ) -> SyncResult<SyncStatus> {
        let result = async {
            let preview = match self.take_produced() {
                Some(preview) => preview,
                None => self.generate_preview_guarded(remote, last).await?,
            };
            if preview.has_conflicts() {
                self.update_conflicts(preview.conflicts.clone());
                self.store_produced(preview);
                return Ok(SyncStatus::HasConflicts);
            }
            self.strategy.apply_preview(&self.ctx, preview, false).await?;
            self.clear_preview();
            Ok(SyncStatus::Idle)
        }
        .await;

        if result.is_err() {
            self.clear_preview();
        }
        result
    }

    /// Force-overwrite-local-from-remote.
    pub async fn pull(&self) -> SyncResult<()> {
        self.force_apply(ForceDirection::Pull).await
    }

    /// Force-overwrite-remote-from-local.
    pub async fn push(&self) -> SyncResult<()> {
        self.force_apply(ForceDirection::Push).await
    }

    async fn force_apply(&self, direction: ForceDirection) -> SyncResult<()> {
        if !self.is_enabled() {
            debug!(resource = %self.resource(), "skipping {}: disabled", direction.verb());
            return Ok(());
        }
        info!(resource = %self.resource(), "started {}", direction.verb());
        self.stop().await?;
        self.set_status(SyncStatus::Syncing);

        let result: SyncResult<()> = async {
            let last = self.ctx.last_sync_user_data().await;
            let remote = self.ctx.remote_user_data(last.as_ref()).await?;
            let token = self.begin_preview();
            let preview = match direction {
                ForceDirection::Pull => {
                    self.strategy
                        .generate_pull_preview(&self.ctx, remote, last, &token)
                        .await?
                }
                ForceDirection::Push => {
                    self.strategy
                        .generate_push_preview(&self.ctx, remote, last, &token)
                        .await?
                }
            };
            token.check()?;
            self.strategy
                .apply_preview(&self.ctx, preview, direction.force_push())
                .await?;
            self.clear_preview();
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                info!(resource = %self.resource(), "finished {}", direction.verb());
                self.set_status(SyncStatus::Idle);
                Ok(())
            }
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => {
                self.clear_preview();
                self.set_status(SyncStatus::Idle);
                Err(e)
            }
        }
    }

    /// Replace local and remote state from a backup handle. Returns `false`
    /// when the handle's content is missing or not a compatible envelope.
    pub async fn replace(&self, uri: &SyncHandleUri) -> SyncResult<bool> {
        if !self.is_enabled() {
            debug!(resource = %self.resource(), "skipping replace: disabled");
            return Ok(false);
        }
        if uri.resource() != self.resource() {
            return Ok(false);
        }
        let Some(content) = self.resolve_content(uri).await? else {
            return Ok(false);
        };
        let Some(data) = SyncData::from_json(&content) else {
            info!(resource = %self.resource(), "cannot replace: unparseable envelope");
            return Ok(false);
        };
        if data.version > self.strategy.version() {
            info!(resource = %self.resource(), "cannot replace: newer envelope version");
            return Ok(false);
        }

        self.stop().await?;
        self.set_status(SyncStatus::Syncing);

        let result: SyncResult<()> = async {
            let last = self.ctx.last_sync_user_data().await;
            let remote = self.ctx.remote_user_data(last.as_ref()).await?;
            let token = self.begin_preview();
            let preview = self
                .strategy
                .generate_replace_preview(&self.ctx, data, remote, last)
                .await?;
            token.check()?;
            self.strategy.apply_preview(&self.ctx, preview, false).await?;
            self.clear_preview();
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.set_status(SyncStatus::Idle);
                Ok(true)
            }
            Err(e) if e.is_cancelled() => Ok(false),
            Err(e) => {
                self.clear_preview();
                self.set_status(SyncStatus::Idle);
                Err(e)
            }
        }
    }

    /// Merge a user-provided resolution into the pending preview. Only acts
    /// while the current preview still has conflicts; once the strategy
    /// reports them resolved the preview is applied and status returns to
    /// idle.
    pub async fn accept_conflict(&self, conflict_uri: &str, content: &str) -> SyncResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let (preview, token) = {
            let slot = self.preview.lock().unwrap();
            match slot.as_ref() {
                Some(s) => match &s.produced {
                    Some(p) if p.has_conflicts() => (p.clone(), s.token.clone()),
                    _ => return Ok(()),
                },
                None => return Ok(()),
            }
        };

        let updated = self
            .strategy
            .update_preview_with_conflict(&self.ctx, preview, conflict_uri, content, &token)
            .await?;

        if updated.has_conflicts() {
            self.update_conflicts(updated.conflicts.clone());
            self.store_produced(updated);
            return Ok(());
        }

        let result = self.strategy.apply_preview(&self.ctx, updated, false).await;
        self.clear_preview();
        match result {
            Ok(()) => {
                self.set_status(SyncStatus::Idle);
                Ok(())
            }
            Err(e) => {
                self.set_status(SyncStatus::Idle);
                Err(e)
            }
        }
    }

    /// Cancel any in-flight preview, drop strategy scratch state, and return
    /// to idle.
    pub async fn stop(&self) -> SyncResult<()> {
        let cancelled = {
            let mut slot = self.preview.lock().unwrap();
            match slot.take() {
                Some(s) => {
                    s.token.cancel();
                    true
                }
                None => false,
            }
        };
        if cancelled {
            debug!(resource = %self.resource(), "cancelled in-flight preview");
        }
        self.local_change_delayer.cancel();
        self.strategy.cleanup(&self.ctx).await?;
        self.set_status(SyncStatus::Idle);
        Ok(())
    }

    /// Read-only peek: a fresh preview that is neither stored nor applied.
    pub async fn generate_sync_preview(&self) -> SyncResult<Option<SyncPreview>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let last = self.ctx.last_sync_user_data().await;
        let remote = self.ctx.remote_user_data(last.as_ref()).await?;
        let token = CancelToken::new();
        let preview = self
            .strategy
            .generate_preview(&self.ctx, remote, last, &token)
            .await?;
        Ok(Some(preview))
    }

    /// Whether a usable last-sync record exists.
    pub async fn has_previously_synced(&self) -> bool {
        self.ctx.last_sync_user_data().await.is_some()
    }

    /// Delete the last-sync record, ignoring not-found.
    pub async fn reset_local(&self) -> SyncResult<()> {
        self.ctx.last_sync.reset().await?;
        info!(resource = %self.resource(), "reset last sync record");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Backup handles
    // ------------------------------------------------------------------

    /// All versions stored remotely, as backup handles.
    pub async fn remote_sync_resource_handles(&self) -> SyncResult<Vec<SyncResourceHandle>> {
        let refs = self.ctx.remote.all_refs(self.resource()).await?;
        Ok(refs
            .into_iter()
            .map(|entry| SyncResourceHandle {
                created: entry.created,
                uri: SyncHandleUri::remote_backup(self.resource(), entry.ref_),
            })
            .collect())
    }

    /// All versions in the local backup store, as backup handles.
    pub async fn local_sync_resource_handles(&self) -> SyncResult<Vec<SyncResourceHandle>> {
        let refs = self.ctx.backup.all_refs(self.resource()).await?;
        Ok(refs
            .into_iter()
            .map(|entry| SyncResourceHandle {
                created: entry.created,
                uri: SyncHandleUri::local_backup(self.resource(), entry.ref_),
            })
            .collect())
    }

    /// The machine that wrote the version behind a remote-backup handle.
    /// Local-backup handles have no machine attribution.
    pub async fn machine_id(&self, handle: &SyncHandleUri) -> SyncResult<Option<String>> {
        if handle.authority() != BackupAuthority::Remote || handle.resource() != self.resource() {
            return Ok(None);
        }
        let Some(content) = self
            .ctx
            .remote
            .resolve_content(self.resource(), handle.ref_())
            .await?
        else {
            return Ok(None);
        };
        Ok(SyncData::from_json(&content).and_then(|data| data.machine_id))
    }

    /// The stored envelope text behind a handle.
    pub async fn resolve_content(&self, handle: &SyncHandleUri) -> SyncResult<Option<String>> {
        if handle.resource() != self.resource() {
            return Ok(None);
        }
        match handle.authority() {
            BackupAuthority::Remote => {
                self.ctx
                    .remote
                    .resolve_content(self.resource(), handle.ref_())
                    .await
            }
            BackupAuthority::Local => {
                self.ctx
                    .backup
                    .resolve_content(self.resource(), handle.ref_())
                    .await
            }
        }
    }

    // ------------------------------------------------------------------
    // Local-change coalescing (file-backed resources)
    // ------------------------------------------------------------------

    /// Watch the directory containing `file_path` and coalesce change events
    /// covering that file into local-change triggers.
    pub async fn watch_local_file(self: &Arc<Self>, file_path: &str) -> SyncResult<()> {
        let dir = file_path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
        let mut rx = self.ctx.fs().watch(dir).await?;
        let this = Arc::clone(self);
        let file = file_path.to_string();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event.path == file {
                    this.trigger_local_change();
                }
            }
        });
        if let Some(previous) = self.watch_task.lock().unwrap().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Schedule one coalesced local-change handling run. Bursts within the
    /// debounce window collapse into a single run.
    pub fn trigger_local_change(self: &Arc<Self>) {
        if !self.is_enabled() {
            return;
        }
        let this = Arc::clone(self);
        self.local_change_delayer.schedule(async move {
            if let Err(e) = this.do_trigger_local_change().await {
                warn!(resource = %this.resource(), "local change handling failed: {e}");
            }
        });
    }

    /// The coalesced task. While conflicted, the user's local edit may be
    /// the resolution, so the pending preview is discarded and the cycle is
    /// re-run against its recorded inputs. Otherwise a speculative preview
    /// against the last-sync state (no remote request) decides whether the
    /// local change is worth a real sync round.
    async fn do_trigger_local_change(&self) -> SyncResult<()> {
        if self.status() == SyncStatus::HasConflicts {
            debug!(resource = %self.resource(), "local change while conflicted, resyncing");
            let parked = {
                let mut slot = self.preview.lock().unwrap();
                slot.take().and_then(|s| {
                    s.token.cancel();
                    s.produced
                })
            };
            let (remote, last) = match parked {
                Some(preview) => (preview.remote_user_data, preview.last_sync_user_data),
                None => {
                    let last = self.ctx.last_sync_user_data().await;
                    let remote = self.ctx.remote_user_data(last.as_ref()).await?;
                    (remote, last)
                }
            };
            self.set_status(SyncStatus::Syncing);
            match self.perform_sync(remote, last).await {
                Ok(status) => {
                    self.set_status(status);
                    Ok(())
                }
                Err(e) if e.is_cancelled() => Ok(()),
                Err(e) => {
                    self.set_status(SyncStatus::Idle);
                    Err(e)
                }
            }
        } else {
            let Some(last) = self.ctx.last_sync_user_data().await else {
                // Never synced: any local content is remote-relevant
                self.events.emit(SyncEvent::LocalChange {
                    resource: self.resource(),
                });
                return Ok(());
            };
            // Speculate against the last-sync state as the remote view; this
            // must not touch the remote store.
            let remote = RemoteUserData::from(&last);
            let token = CancelToken::new();
            let preview = self
                .strategy
                .generate_preview(&self.ctx, remote, Some(last), &token)
                .await?;
            if preview.has_remote_changed {
                debug!(resource = %self.resource(), "local change affects remote state");
                self.events.emit(SyncEvent::LocalChange {
                    resource: self.resource(),
                });
            }
            Ok(())
        }
    }
}

impl<S: SyncStrategy> Drop for Synchronizer<S> {
    fn drop(&mut self) {
        if let Some(task) = self.watch_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForceDirection {
    Pull,
    Push,
}

impl ForceDirection {
    fn verb(&self) -> &'static str {
        match self {
            ForceDirection::Pull => "pulling",
            ForceDirection::Push => "pushing",
        }
    }

    fn force_push(&self) -> bool {
        matches!(self, ForceDirection::Push)
    }
}
