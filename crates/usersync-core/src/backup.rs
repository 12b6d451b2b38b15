//! Local backup store seam and an in-memory double.
//!
//! Before a sync overwrites local content, the previous version is backed up
//! here so the user can restore it through the handle listing.

use crate::error::SyncResult;
use crate::remote::RefEntry;
use crate::resource::SyncResource;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Store of local backups, one history per resource.
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Append a backup of the given envelope text.
    async fn backup(&self, resource: SyncResource, content: &str) -> SyncResult<()>;

    /// Fetch a backed-up version by ref.
    async fn resolve_content(
        &self,
        resource: SyncResource,
        ref_: &str,
    ) -> SyncResult<Option<String>>;

    /// List all backups, oldest first.
    async fn all_refs(&self, resource: SyncResource) -> SyncResult<Vec<RefEntry>>;
}

/// In-memory backup store for tests.
pub struct InMemoryBackupStore {
    entries: Mutex<HashMap<SyncResource, Vec<(String, String, u64)>>>,
}

impl InMemoryBackupStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryBackupStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackupStore for InMemoryBackupStore {
    async fn backup(&self, resource: SyncResource, content: &str) -> SyncResult<()> {
        let mut entries = self.entries.lock().unwrap();
        let history = entries.entry(resource).or_default();
        let ref_ = (history.len() + 1).to_string();
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        history.push((ref_, content.to_string(), created));
        Ok(())
    }

    async fn resolve_content(
        &self,
        resource: SyncResource,
        ref_: &str,
    ) -> SyncResult<Option<String>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(&resource).and_then(|history| {
            history
                .iter()
                .find(|(r, _, _)| r == ref_)
                .map(|(_, content, _)| content.clone())
        }))
    }

    async fn all_refs(&self, resource: SyncResource) -> SyncResult<Vec<RefEntry>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .get(&resource)
            .map(|history| {
                history
                    .iter()
                    .map(|(ref_, _, created)| RefEntry {
                        ref_: ref_.clone(),
                        created: *created,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backup_history() {
        let store = InMemoryBackupStore::new();
        store.backup(SyncResource::Settings, "v1").await.unwrap();
        store.backup(SyncResource::Settings, "v2").await.unwrap();
        store.backup(SyncResource::Snippets, "s1").await.unwrap();

        let refs = store.all_refs(SyncResource::Settings).await.unwrap();
        assert_eq!(refs.len(), 2);

        assert_eq!(
            store
                .resolve_content(SyncResource::Settings, "1")
                .await
                .unwrap()
                .as_deref(),
            Some("v1")
        );
        assert_eq!(
            store
                .resolve_content(SyncResource::Settings, "3")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_empty_history() {
        let store = InMemoryBackupStore::new();
        assert!(store
            .all_refs(SyncResource::Extensions)
            .await
            .unwrap()
            .is_empty());
    }
}
