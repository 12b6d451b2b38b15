//! Remote user-data store seam and an in-memory double for tests.

use crate::envelope::SyncData;
use crate::error::{SyncError, SyncResult};
use crate::last_sync::LastSyncUserData;
use crate::resource::SyncResource;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Request headers injected per sync invocation.
pub type Headers = HashMap<String, String>;

/// The remote view of one resource: server ref plus parsed envelope.
/// `sync_data` is `None` when the resource does not exist remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUserData {
    pub ref_: String,
    pub sync_data: Option<SyncData>,
}

impl From<&LastSyncUserData> for RemoteUserData {
    fn from(last: &LastSyncUserData) -> Self {
        Self {
            ref_: last.ref_.clone(),
            sync_data: last.sync_data.clone(),
        }
    }
}

/// Raw read result: server ref plus raw envelope JSON, unparsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteContent {
    pub ref_: String,
    pub content: Option<String>,
}

/// Server manifest: the current ref of every resource, fetched once per
/// sync round. Refs are monotonic per resource.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SyncManifest {
    pub latest: HashMap<String, String>,
}

impl SyncManifest {
    pub fn latest_ref(&self, resource: SyncResource) -> Option<&str> {
        self.latest.get(resource.key()).map(String::as_str)
    }
}

/// One stored version of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefEntry {
    pub ref_: String,
    /// Creation time in milliseconds since Unix epoch.
    pub created: u64,
}

/// Client for the remote store shared across machines.
///
/// Writes are optimistically concurrent: `if_match` must equal the current
/// server ref or the write fails with `PreconditionFailed`; `None` forces
/// the write.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read the latest state. `last` allows a cheap read when the caller's
    /// view is already current; passing `None` forces a fresh fetch.
    async fn read(
        &self,
        resource: SyncResource,
        last: Option<&LastSyncUserData>,
        headers: &Headers,
    ) -> SyncResult<RemoteContent>;

    /// Conditionally write a new envelope; returns the new ref.
    async fn write(
        &self,
        resource: SyncResource,
        content: &str,
        if_match: Option<&str>,
        headers: &Headers,
    ) -> SyncResult<String>;

    /// Fetch the stored envelope text at a historical ref.
    async fn resolve_content(
        &self,
        resource: SyncResource,
        ref_: &str,
    ) -> SyncResult<Option<String>>;

    /// List all stored versions, oldest first.
    async fn all_refs(&self, resource: SyncResource) -> SyncResult<Vec<RefEntry>>;
}

/// Requests observed by [`InMemoryRemoteStore`], for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRequest {
    Read {
        resource: SyncResource,
    },
    Write {
        resource: SyncResource,
        if_match: Option<String>,
    },
    Resolve {
        resource: SyncResource,
        ref_: String,
    },
}

#[derive(Default)]
struct ResourceState {
    counter: u64,
    current: Option<String>,
    history: Vec<(String, String, u64)>,
}

/// In-memory remote store with controllable refs and If-Match enforcement.
pub struct InMemoryRemoteStore {
    state: Mutex<HashMap<SyncResource, ResourceState>>,
    log: Mutex<Vec<RemoteRequest>>,
    last_headers: Mutex<Headers>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            last_headers: Mutex::new(Headers::new()),
        }
    }

    /// The requests made so far, in order.
    pub fn requests(&self) -> Vec<RemoteRequest> {
        self.log.lock().unwrap().clone()
    }

    /// The headers carried by the most recent read or write.
    pub fn last_headers(&self) -> Headers {
        self.last_headers.lock().unwrap().clone()
    }

    pub fn clear_requests(&self) {
        self.log.lock().unwrap().clear();
    }

    /// The current ref of a resource, `"0"` when never written.
    pub fn current_ref(&self, resource: SyncResource) -> String {
        let state = self.state.lock().unwrap();
        state
            .get(&resource)
            .map(|s| s.counter.to_string())
            .unwrap_or_else(|| "0".to_string())
    }

    /// Build a manifest from the current refs, omitting absent resources.
    pub fn manifest(&self) -> SyncManifest {
        let state = self.state.lock().unwrap();
        let latest = state
            .iter()
            .filter(|(_, s)| s.current.is_some())
            .map(|(r, s)| (r.key().to_string(), s.counter.to_string()))
            .collect();
        SyncManifest { latest }
    }

    fn log(&self, request: RemoteRequest) {
        self.log.lock().unwrap().push(request);
    }
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn read(
        &self,
        resource: SyncResource,
        _last: Option<&LastSyncUserData>,
        headers: &Headers,
    ) -> SyncResult<RemoteContent> {
        self.log(RemoteRequest::Read { resource });
        *self.last_headers.lock().unwrap() = headers.clone();
        let state = self.state.lock().unwrap();
        Ok(match state.get(&resource) {
            Some(s) => RemoteContent {
                ref_: s.counter.to_string(),
                content: s.current.clone(),
            },
            None => RemoteContent {
                ref_: "0".to_string(),
                content: None,
            },
        })
    }

    async fn write(
        &self,
        resource: SyncResource,
        content: &str,
        if_match: Option<&str>,
        headers: &Headers,
    ) -> SyncResult<String> {
        self.log(RemoteRequest::Write {
            resource,
            if_match: if_match.map(str::to_string),
        });
        *self.last_headers.lock().unwrap() = headers.clone();
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(resource).or_default();
        if let Some(expected) = if_match {
            if expected != entry.counter.to_string() {
                return Err(SyncError::PreconditionFailed { resource });
            }
        }
        entry.counter += 1;
        let ref_ = entry.counter.to_string();
        entry.current = Some(content.to_string());
        entry
            .history
            .push((ref_.clone(), content.to_string(), now_millis()));
        Ok(ref_)
    }

    async fn resolve_content(
        &self,
        resource: SyncResource,
        ref_: &str,
    ) -> SyncResult<Option<String>> {
        self.log(RemoteRequest::Resolve {
            resource,
            ref_: ref_.to_string(),
        });
        let state = self.state.lock().unwrap();
        Ok(state.get(&resource).and_then(|s| {
            s.history
                .iter()
                .find(|(r, _, _)| r == ref_)
                .map(|(_, content, _)| content.clone())
        }))
    }

    async fn all_refs(&self, resource: SyncResource) -> SyncResult<Vec<RefEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .get(&resource)
            .map(|s| {
                s.history
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

    fn headers() -> Headers {
        Headers::new()
    }

    #[tokio::test]
    async fn test_read_absent_resource() {
        let store = InMemoryRemoteStore::new();
        let read = store
            .read(SyncResource::Settings, None, &headers())
            .await
            .unwrap();
        assert_eq!(read.ref_, "0");
        assert_eq!(read.content, None);
    }

    #[tokio::test]
    async fn test_write_advances_ref() {
        let store = InMemoryRemoteStore::new();
        let r1 = store
            .write(SyncResource::Settings, "a", None, &headers())
            .await
            .unwrap();
        let r2 = store
            .write(SyncResource::Settings, "b", Some(&r1), &headers())
            .await
            .unwrap();
        assert_eq!(r1, "1");
        assert_eq!(r2, "2");

        let read = store
            .read(SyncResource::Settings, None, &headers())
            .await
            .unwrap();
        assert_eq!(read.ref_, "2");
        assert_eq!(read.content.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_if_match_mismatch_fails() {
        let store = InMemoryRemoteStore::new();
        store
            .write(SyncResource::Settings, "a", None, &headers())
            .await
            .unwrap();

        let err = store
            .write(SyncResource::Settings, "b", Some("0"), &headers())
            .await;
        assert!(matches!(err, Err(SyncError::PreconditionFailed { .. })));

        // State unchanged after a failed write
        assert_eq!(store.current_ref(SyncResource::Settings), "1");
    }

    #[tokio::test]
    async fn test_resolve_historical_content() {
        let store = InMemoryRemoteStore::new();
        store
            .write(SyncResource::Settings, "a", None, &headers())
            .await
            .unwrap();
        store
            .write(SyncResource::Settings, "b", None, &headers())
            .await
            .unwrap();

        assert_eq!(
            store
                .resolve_content(SyncResource::Settings, "1")
                .await
                .unwrap()
                .as_deref(),
            Some("a")
        );
        assert_eq!(
            store
                .resolve_content(SyncResource::Settings, "9")
                .await
                .unwrap(),
            None
        );

        let refs = store.all_refs(SyncResource::Settings).await.unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].ref_, "1");
        assert_eq!(refs[1].ref_, "2");
    }

    #[tokio::test]
    async fn test_manifest_omits_absent_resources() {
        let store = InMemoryRemoteStore::new();
        store
            .write(SyncResource::Keybindings, "kb", None, &headers())
            .await
            .unwrap();

        let manifest = store.manifest();
        assert_eq!(manifest.latest_ref(SyncResource::Keybindings), Some("1"));
        assert_eq!(manifest.latest_ref(SyncResource::Settings), None);
    }

    #[tokio::test]
    async fn test_request_log() {
        let store = InMemoryRemoteStore::new();
        store
            .read(SyncResource::Settings, None, &headers())
            .await
            .unwrap();
        store
            .write(SyncResource::Settings, "a", None, &headers())
            .await
            .unwrap();

        assert_eq!(
            store.requests(),
            vec![
                RemoteRequest::Read {
                    resource: SyncResource::Settings
                },
                RemoteRequest::Write {
                    resource: SyncResource::Settings,
                    if_match: None
                },
            ]
        );

        store.clear_requests();
        assert!(store.requests().is_empty());
    }
}
