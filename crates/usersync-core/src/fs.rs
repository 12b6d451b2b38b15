//! File service abstraction with conditional writes and change watching.
//!
//! Implementations:
//! - `InMemoryFs` - for tests and embedded use
//! - `NativeFs` (in `native_fs`) - tokio::fs plus a notify watcher
//!
//! The write surface is conditional: callers pass back the `FileContent`
//! snapshot they read, and the implementation fails with `ModifiedSince`
//! when the file changed in between. The engine translates those failures
//! into its local precondition retry.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("file modified since snapshot: {0}")]
    ModifiedSince(String),

    #[error("watch error: {0}")]
    Watch(String),

    #[error("io error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// A file snapshot: UTF-8 content plus the version token observed at read
/// time. The token is compared on conditional writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub content: String,
    /// Modification time in milliseconds since epoch, used as version token.
    pub mtime_millis: u64,
}

/// A change under a watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChangeEvent {
    /// Path of the affected file, in the same namespace as read/write paths.
    pub path: String,
}

/// Platform-independent file service.
///
/// Implementations must be `Send + Sync` for use across tasks.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents with its version token.
    async fn read_file(&self, path: &str) -> Result<FileContent>;

    /// Write file contents. When `expected` is given the write is
    /// conditional: fails with `ModifiedSince` if the file changed after the
    /// snapshot was taken, `NotFound` if it was deleted meanwhile. Creates
    /// parent directories as needed.
    async fn write_file(
        &self,
        path: &str,
        content: &str,
        expected: Option<&FileContent>,
    ) -> Result<FileContent>;

    /// Create a file. Fails with `AlreadyExists` when the file is present
    /// and `overwrite` is false.
    async fn create_file(&self, path: &str, content: &str, overwrite: bool) -> Result<FileContent>;

    /// Delete a file.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a path exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Watch a directory. Events for any file beneath it are delivered on
    /// the returned receiver until the filesystem is dropped.
    async fn watch(&self, dir: &str) -> Result<mpsc::UnboundedReceiver<FileChangeEvent>>;
}

/// In-memory filesystem for testing.
///
/// Version tokens are a monotonic counter rather than wall-clock time so
/// that back-to-back writes always produce distinct tokens.
pub struct InMemoryFs {
    files: Mutex<HashMap<String, FileContent>>,
    clock: AtomicU64,
    watchers: Mutex<Vec<(String, mpsc::UnboundedSender<FileChangeEvent>)>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(1),
            watchers: Mutex::new(Vec::new()),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    fn normalize(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn notify(&self, path: &str) {
        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|(dir, tx)| {
            if path == dir.as_str() || path.starts_with(&format!("{dir}/")) || dir.is_empty() {
                tx.send(FileChangeEvent {
                    path: path.to_string(),
                })
                .is_ok()
            } else {
                // Keep watchers whose directory doesn't cover this path
                !tx.is_closed()
            }
        });
    }

    fn insert(&self, path: String, content: &str) -> FileContent {
        let file = FileContent {
            content: content.to_string(),
            mtime_millis: self.tick(),
        };
        self.files.lock().unwrap().insert(path.clone(), file.clone());
        self.notify(&path);
        file
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read_file(&self, path: &str) -> Result<FileContent> {
        let path = Self::normalize(path);
        self.files
            .lock()
            .unwrap()
            .get(&path)
            .cloned()
            .ok_or(FsError::NotFound(path))
    }

    async fn write_file(
        &self,
        path: &str,
        content: &str,
        expected: Option<&FileContent>,
    ) -> Result<FileContent> {
        let path = Self::normalize(path);
        if let Some(expected) = expected {
            let files = self.files.lock().unwrap();
            match files.get(&path) {
                None => return Err(FsError::NotFound(path)),
                Some(current) if current.mtime_millis != expected.mtime_millis => {
                    return Err(FsError::ModifiedSince(path));
                }
                Some(_) => {}
            }
        }
        Ok(self.insert(path, content))
    }

    async fn create_file(&self, path: &str, content: &str, overwrite: bool) -> Result<FileContent> {
        let path = Self::normalize(path);
        if !overwrite && self.files.lock().unwrap().contains_key(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        Ok(self.insert(path, content))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize(path);
        if self.files.lock().unwrap().remove(&path).is_none() {
            return Err(FsError::NotFound(path));
        }
        self.notify(&path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize(path);
        Ok(self.files.lock().unwrap().contains_key(&path))
    }

    async fn watch(&self, dir: &str) -> Result<mpsc::UnboundedReceiver<FileChangeEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers
            .lock()
            .unwrap()
            .push((Self::normalize(dir), tx));
        Ok(rx)
    }
}

// Allow sharing one filesystem between engines and tests.
#[async_trait]
impl<T: FileSystem + Send + Sync> FileSystem for std::sync::Arc<T> {
    async fn read_file(&self, path: &str) -> Result<FileContent> {
        (**self).read_file(path).await
    }

    async fn write_file(
        &self,
        path: &str,
        content: &str,
        expected: Option<&FileContent>,
    ) -> Result<FileContent> {
        (**self).write_file(path, content, expected).await
    }

    async fn create_file(&self, path: &str, content: &str, overwrite: bool) -> Result<FileContent> {
        (**self).create_file(path, content, overwrite).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn watch(&self, dir: &str) -> Result<mpsc::UnboundedReceiver<FileChangeEvent>> {
        (**self).watch(dir).await
    }
}
