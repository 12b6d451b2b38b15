//! Native filesystem implementation using tokio::fs and notify.

use crate::fs::{FileChangeEvent, FileContent, FileSystem, FsError, Result};
use async_trait::async_trait;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::fs;
use tokio::sync::mpsc;
use tracing::error;

/// Debounce period for the OS-level watcher. The engine applies its own
/// coalescing on top, so this only smooths editor save storms.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(200);

/// Native filesystem rooted at a base directory.
///
/// Paths are relative to the base and use `/` separators, matching the
/// namespace used by the in-memory implementation.
pub struct NativeFs {
    base_path: PathBuf,
    /// Live debouncers, kept so the watchers stay registered.
    debouncers: Mutex<Vec<notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>>>,
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            debouncers: Mutex::new(Vec::new()),
        }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }

    fn map_io(path: &str, e: std::io::Error) -> FsError {
        if e.kind() == std::io::ErrorKind::NotFound {
            FsError::NotFound(path.to_string())
        } else {
            FsError::Io(e.to_string())
        }
    }

    async fn mtime_millis(&self, full: &Path) -> Result<u64> {
        let metadata = fs::metadata(full)
            .await
            .map_err(|e| Self::map_io(&full.to_string_lossy(), e))?;
        Ok(metadata
            .modified()
            .map(|t| {
                t.duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0)
            })
            .unwrap_or(0))
    }

    async fn write_unconditional(&self, path: &str, content: &str) -> Result<FileContent> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| FsError::Io(e.to_string()))?;
        }
        fs::write(&full, content)
            .await
            .map_err(|e| Self::map_io(path, e))?;
        Ok(FileContent {
            content: content.to_string(),
            mtime_millis: self.mtime_millis(&full).await?,
        })
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read_file(&self, path: &str) -> Result<FileContent> {
        let full = self.full_path(path);
        let content = fs::read_to_string(&full)
            .await
            .map_err(|e| Self::map_io(path, e))?;
        Ok(FileContent {
            content,
            mtime_millis: self.mtime_millis(&full).await?,
        })
    }

    async fn write_file(
        &self,
        path: &str,
        content: &str,
        expected: Option<&FileContent>,
    ) -> Result<FileContent> {
        if let Some(expected) = expected {
            let full = self.full_path(path);
            if !full.exists() {
                return Err(FsError::NotFound(path.to_string()));
            }
            let current = self.mtime_millis(&full).await?;
            if current != expected.mtime_millis {
                return Err(FsError::ModifiedSince(path.to_string()));
            }
        }
        self.write_unconditional(path, content).await
    }

    async fn create_file(&self, path: &str, content: &str, overwrite: bool) -> Result<FileContent> {
        if !overwrite && self.full_path(path).exists() {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        self.write_unconditional(path, content).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        fs::remove_file(self.full_path(path))
            .await
            .map_err(|e| Self::map_io(path, e))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.full_path(path).exists())
    }

    async fn watch(&self, dir: &str) -> Result<mpsc::UnboundedReceiver<FileChangeEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let base = self.base_path.clone();
        let full_dir = self.full_path(dir);

        fs::create_dir_all(&full_dir)
            .await
            .map_err(|e| FsError::Io(e.to_string()))?;

        let mut debouncer = new_debouncer(
            WATCH_DEBOUNCE,
            move |result: std::result::Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        let Ok(relative) = event.path.strip_prefix(&base) else {
                            continue;
                        };
                        let Some(relative) = relative.to_str() else {
                            continue;
                        };
                        let event = FileChangeEvent {
                            path: relative.replace(std::path::MAIN_SEPARATOR, "/"),
                        };
                        if tx.send(event).is_err() {
                            // Receiver dropped
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("file watcher error: {e}");
                }
            },
        )
        .map_err(|e| FsError::Watch(e.to_string()))?;

        debouncer
            .watcher()
            .watch(&full_dir, RecursiveMode::Recursive)
            .map_err(|e| FsError::Watch(e.to_string()))?;

        self.debouncers.lock().unwrap().push(debouncer);
        Ok(rx)
    }
}
