//! usersync-core: per-resource synchronization engine for user data shared
//! across machines.
//!
//! This crate provides the core for syncing one kind of user state
//! (settings, keybindings, snippets, ...) between a local store and a
//! remote store:
//! - A three-way reconciliation driver with optimistic-concurrency retry
//! - A status state machine with cancellable in-flight previews
//! - A conflict-resolution sub-protocol for an external UI
//! - Last-sync persistence, backup handle naming, and a coalescing
//!   local-change scheduler for file-backed resources
//!
//! Concrete resources plug in through the [`SyncStrategy`] trait; the
//! remote store, backup store, file service, and enablement flags are
//! trait seams with in-memory implementations for testing.

pub mod backup;
pub mod cancel;
pub mod enablement;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod events;
pub mod file_resource;
pub mod fs;
pub mod handle;
pub mod last_sync;
pub mod native_fs;
pub mod remote;
pub mod resource;
pub mod scheduler;
pub mod strategy;

pub use backup::{BackupStore, InMemoryBackupStore};
pub use cancel::CancelToken;
pub use enablement::{SwitchEnablement, SyncEnablement};
pub use engine::Synchronizer;
pub use envelope::SyncData;
pub use error::{SyncError, SyncResult};
pub use events::{EventBus, SyncEvent};
pub use file_resource::SingleFileStrategy;
pub use fs::{FileChangeEvent, FileContent, FileSystem, FsError, InMemoryFs};
pub use handle::{BackupAuthority, SyncHandleUri, SyncResourceHandle};
pub use last_sync::{LastSyncStore, LastSyncUserData};
pub use native_fs::NativeFs;
pub use remote::{
    Headers, InMemoryRemoteStore, RefEntry, RemoteContent, RemoteRequest, RemoteStore,
    RemoteUserData, SyncManifest,
};
pub use resource::{Conflict, SyncResource, SyncStatus};
pub use scheduler::Delayer;
pub use strategy::{SyncContext, SyncPreview, SyncStrategy};
