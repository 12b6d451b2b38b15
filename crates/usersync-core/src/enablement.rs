//! Resource enablement flags.
//!
//! The flag service itself lives outside the engine; this seam lets the
//! engine consult it before touching the remote store.

use crate::resource::SyncResource;
use std::sync::atomic::{AtomicBool, Ordering};

/// Per-resource sync enablement.
pub trait SyncEnablement: Send + Sync {
    fn is_enabled(&self, resource: SyncResource) -> bool;
}

/// Enablement backed by a single switch, shared across resources.
pub struct SwitchEnablement(AtomicBool);

impl SwitchEnablement {
    pub fn new(enabled: bool) -> Self {
        Self(AtomicBool::new(enabled))
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }
}

impl Default for SwitchEnablement {
    fn default() -> Self {
        Self::new(true)
    }
}

impl SyncEnablement for SwitchEnablement {
    fn is_enabled(&self, _resource: SyncResource) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch() {
        let switch = SwitchEnablement::default();
        assert!(switch.is_enabled(SyncResource::Settings));
        switch.set_enabled(false);
        assert!(!switch.is_enabled(SyncResource::Settings));
        assert!(!switch.is_enabled(SyncResource::Snippets));
    }
}
