//! Error types for the synchronization engine.

use crate::resource::SyncResource;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the engine and its strategy callbacks.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote envelope is newer than this engine understands, or its
    /// shape could not be parsed. Never retried.
    #[error("incompatible remote data for {resource}: {detail}")]
    Incompatible {
        resource: SyncResource,
        detail: String,
    },

    /// The server rejected a conditional write because the ref moved.
    /// Recovered inside the sync loop by refetching and retrying.
    #[error("remote precondition failed for {resource}")]
    PreconditionFailed { resource: SyncResource },

    /// The local file changed between snapshot and write. Recovered inside
    /// the sync loop by retrying against the same remote state.
    #[error("local precondition failed for {path}")]
    LocalPreconditionFailed { path: String },

    /// The precondition retry loop hit its safety cap.
    #[error("too many precondition retries for {resource} ({attempts} attempts)")]
    TooManyRetries {
        resource: SyncResource,
        attempts: u32,
    },

    /// Transient transport failure talking to the remote store. The caller
    /// decides whether to retry.
    #[error("network error: {0}")]
    Network(String),

    /// The in-flight preview was cancelled via `stop()`. Not surfaced to
    /// callers of the public operations.
    #[error("sync cancelled")]
    Cancelled,

    /// A preview reached `apply` without the data its flags promised.
    #[error("invalid preview: {0}")]
    InvalidPreview(String),

    /// File service failure.
    #[error("file error: {0}")]
    Fs(#[from] crate::fs::FsError),

    /// JSON (de)serialization failure outside the envelope codec.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// True for the two precondition kinds the sync loop recovers locally.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SyncError::PreconditionFailed { .. } | SyncError::LocalPreconditionFailed { .. }
        )
    }

    /// True when the error is a cancellation, which is silent by contract.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_classification() {
        assert!(SyncError::PreconditionFailed {
            resource: SyncResource::Settings
        }
        .is_precondition());
        assert!(SyncError::LocalPreconditionFailed {
            path: "settings.json".into()
        }
        .is_precondition());
        assert!(!SyncError::Cancelled.is_precondition());
        assert!(!SyncError::Network("timeout".into()).is_precondition());
    }

    #[test]
    fn test_display() {
        let err = SyncError::TooManyRetries {
            resource: SyncResource::Keybindings,
            attempts: 8,
        };
        assert!(err.to_string().contains("keybindings"));
        assert!(err.to_string().contains('8'));
    }
}
