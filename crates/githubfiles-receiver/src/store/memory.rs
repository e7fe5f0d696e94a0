//! In-process store with revision-counter version tokens.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Mutex;

use super::{CommitMetadata, RemoteFile, RemoteStore};
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct StoredFile {
    content: Vec<u8>,
    version: String,
    metadata: CommitMetadata,
}

/// Store kept in memory, enforcing the same optimistic-concurrency rules
/// as a hosted repository.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    files: Mutex<HashMap<String, StoredFile>>,
    revision: AtomicU64,
    writes: AtomicUsize,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        format!("rev-{}", self.revision.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Seed or replace a file outside the write protocol, returning its
    /// new version. Not counted as a write.
    pub async fn insert(&self, path: &str, content: impl Into<Vec<u8>>) -> String {
        let version = self.next_version();
        self.files.lock().await.insert(
            path.to_string(),
            StoredFile {
                content: content.into(),
                version: version.clone(),
                metadata: CommitMetadata::default(),
            },
        );
        version
    }

    /// Current content of `path` as text.
    pub async fn content(&self, path: &str) -> Option<String> {
        self.files
            .lock()
            .await
            .get(path)
            .map(|f| String::from_utf8_lossy(&f.content).into_owned())
    }

    /// Commit metadata of the last write to `path`.
    pub async fn last_commit(&self, path: &str) -> Option<CommitMetadata> {
        self.files
            .lock()
            .await
            .get(path)
            .map(|f| f.metadata.clone())
    }

    /// Number of successful `create_or_update` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn get(&self, path: &str) -> Result<RemoteFile, StoreError> {
        let files = self.files.lock().await;
        let file = files
            .get(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        Ok(RemoteFile {
            path: path.to_string(),
            content: file.content.clone(),
            version: Some(file.version.clone()),
        })
    }

    async fn create_or_update(
        &self,
        path: &str,
        content: &[u8],
        expected_version: Option<&str>,
        metadata: &CommitMetadata,
    ) -> Result<(), StoreError> {
        let mut files = self.files.lock().await;
        let current = files.get(path).map(|f| f.version.as_str());

        match (expected_version, current) {
            (None, None) => {}
            (Some(expected), Some(current)) if expected == current => {}
            (None, Some(_)) => {
                return Err(StoreError::Conflict {
                    path: path.to_string(),
                    reason: "file already exists".to_string(),
                });
            }
            (Some(expected), Some(current)) => {
                return Err(StoreError::Conflict {
                    path: path.to_string(),
                    reason: format!("expected version {expected}, found {current}"),
                });
            }
            (Some(expected), None) => {
                return Err(StoreError::Conflict {
                    path: path.to_string(),
                    reason: format!("expected version {expected}, file was deleted"),
                });
            }
        }

        let version = self.next_version();
        files.insert(
            path.to_string(),
            StoredFile {
                content: content.to_vec(),
                version,
                metadata: metadata.clone(),
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
