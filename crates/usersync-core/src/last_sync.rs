//! Persistence of the most recent successfully synchronized state.
//!
//! One record per resource, stored at
//! `<sync_home>/<resource>/lastSync<Resource>.json` as
//! `{ "ref": ..., "content": <envelope-json-string | null>, ...extras }`.
//! The `content: null` sentinel means the resource did not exist remotely at
//! the last sync. Strategy-specific extra keys round-trip verbatim even when
//! this engine does not recognize them.

use crate::envelope::SyncData;
use crate::error::SyncResult;
use crate::fs::{FileSystem, FsError};
use crate::resource::SyncResource;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// The last successfully synchronized remote state, used as the common
/// ancestor for three-way reconciliation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LastSyncUserData {
    /// Server ref the record corresponds to.
    pub ref_: String,
    /// Envelope at that ref; `None` when the resource was absent remotely.
    pub sync_data: Option<SyncData>,
    /// Strategy-specific auxiliary fields, passed through verbatim.
    pub extras: Map<String, Value>,
}

impl LastSyncUserData {
    pub fn new(ref_: impl Into<String>, sync_data: Option<SyncData>) -> Self {
        Self {
            ref_: ref_.into(),
            sync_data,
            extras: Map::new(),
        }
    }
}

/// On-disk shape of the record.
#[derive(Serialize, Deserialize)]
struct LastSyncRecord {
    #[serde(rename = "ref")]
    ref_: String,
    content: Option<String>,
    #[serde(flatten)]
    extras: Map<String, Value>,
}

/// Store for one resource's last-sync record.
///
/// The file is owned exclusively by its engine instance.
pub struct LastSyncStore {
    fs: Arc<dyn FileSystem>,
    resource: SyncResource,
    path: String,
    /// The strategy's declared content schema version. Records carrying a
    /// newer envelope are ignored: the engine does not downgrade.
    version: u32,
}

impl LastSyncStore {
    pub fn new(fs: Arc<dyn FileSystem>, sync_home: &str, resource: SyncResource, version: u32) -> Self {
        let path = format!(
            "{sync_home}/{}/lastSync{}.json",
            resource.key(),
            resource.pascal_key()
        );
        Self {
            fs,
            resource,
            path,
            version,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Load the record. Missing files, unparseable records, and records
    /// written by a newer client all read as "no prior sync".
    pub async fn load(&self) -> Option<LastSyncUserData> {
        let raw = match self.fs.read_file(&self.path).await {
            Ok(file) => file.content,
            Err(FsError::NotFound(_)) => return None,
            Err(e) => {
                warn!(resource = %self.resource, "failed to read last sync record: {e}");
                return None;
            }
        };

        let record: LastSyncRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(resource = %self.resource, "unparseable last sync record, ignoring: {e}");
                return None;
            }
        };

        let sync_data = match record.content {
            None => None,
            Some(envelope_json) => match SyncData::from_json(&envelope_json) {
                Some(data) if data.version > self.version => {
                    warn!(
                        resource = %self.resource,
                        persisted = data.version,
                        supported = self.version,
                        "last sync record is from a newer client, ignoring"
                    );
                    return None;
                }
                Some(data) => Some(data),
                None => {
                    warn!(resource = %self.resource, "unparseable last sync envelope, ignoring");
                    return None;
                }
            },
        };

        Some(LastSyncUserData {
            ref_: record.ref_,
            sync_data,
            extras: record.extras,
        })
    }

    /// Persist the record, retaining the extras bag verbatim.
    pub async fn save(&self, data: &LastSyncUserData) -> SyncResult<()> {
        let record = LastSyncRecord {
            ref_: data.ref_.clone(),
            content: data.sync_data.as_ref().map(|d| d.to_json()),
            extras: data.extras.clone(),
        };
        let json = serde_json::to_string(&record)?;
        self.fs.write_file(&self.path, &json, None).await?;
        debug!(resource = %self.resource, ref_ = %data.ref_, "updated last sync record");
        Ok(())
    }

    /// Delete the record, ignoring not-found.
    pub async fn reset(&self) -> SyncResult<()> {
        match self.fs.delete(&self.path).await {
            Ok(()) | Err(FsError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;

    fn store(fs: &Arc<InMemoryFs>) -> LastSyncStore {
        LastSyncStore::new(
            Arc::clone(fs) as Arc<dyn FileSystem>,
            "home/sync",
            SyncResource::Settings,
            1,
        )
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let fs = Arc::new(InMemoryFs::new());
        assert_eq!(store(&fs).load().await, None);
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let fs = Arc::new(InMemoryFs::new());
        let store = store(&fs);

        let data = LastSyncUserData::new("7", Some(SyncData::new(1, Some("m1".into()), "body")));
        store.save(&data).await.unwrap();

        assert_eq!(store.load().await, Some(data));
        assert_eq!(store.path(), "home/sync/settings/lastSyncSettings.json");
    }

    #[tokio::test]
    async fn test_null_content_sentinel() {
        let fs = Arc::new(InMemoryFs::new());
        let store = store(&fs);

        // Remote was absent at last sync
        let data = LastSyncUserData::new("0", None);
        store.save(&data).await.unwrap();

        let raw = fs
            .read_file("home/sync/settings/lastSyncSettings.json")
            .await
            .unwrap();
        assert!(raw.content.contains("\"content\":null"));
        assert_eq!(store.load().await, Some(data));
    }

    #[tokio::test]
    async fn test_extras_roundtrip_verbatim() {
        let fs = Arc::new(InMemoryFs::new());
        let store = store(&fs);

        let mut data = LastSyncUserData::new("3", Some(SyncData::new(1, None, "c")));
        data.extras
            .insert("platformSpecific".into(), Value::Bool(true));
        data.extras.insert(
            "builtinExtensions".into(),
            serde_json::json!(["a.ext", "b.ext"]),
        );
        store.save(&data).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.extras, data.extras);
    }

    #[tokio::test]
    async fn test_unparseable_record_reads_as_no_prior_sync() {
        let fs = Arc::new(InMemoryFs::new());
        fs.write_file("home/sync/settings/lastSyncSettings.json", "garbage", None)
            .await
            .unwrap();
        assert_eq!(store(&fs).load().await, None);
    }

    #[tokio::test]
    async fn test_unparseable_envelope_reads_as_no_prior_sync() {
        let fs = Arc::new(InMemoryFs::new());
        fs.write_file(
            "home/sync/settings/lastSyncSettings.json",
            r#"{"ref":"1","content":"{\"not\":\"an envelope\"}"}"#,
            None,
        )
        .await
        .unwrap();
        assert_eq!(store(&fs).load().await, None);
    }

    #[tokio::test]
    async fn test_newer_version_reads_as_no_prior_sync() {
        let fs = Arc::new(InMemoryFs::new());
        let store = store(&fs);

        let data = LastSyncUserData::new("9", Some(SyncData::new(2, None, "future")));
        store.save(&data).await.unwrap();

        // Store declares version 1; the persisted version 2 envelope is ignored
        assert_eq!(store.load().await, None);
        // But the record itself is not deleted
        assert!(fs
            .exists("home/sync/settings/lastSyncSettings.json")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_reset_ignores_missing() {
        let fs = Arc::new(InMemoryFs::new());
        let store = store(&fs);
        store.reset().await.unwrap();

        store
            .save(&LastSyncUserData::new("1", None))
            .await
            .unwrap();
        store.reset().await.unwrap();
        assert_eq!(store.load().await, None);
    }
}
