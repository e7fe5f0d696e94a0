//! Remote file stores.
//!
//! A store holds text files addressed by path, each with an opaque version
//! token. Writes are optimistic: a create fails when the file already exists
//! and an update fails when the supplied version is no longer current.

pub mod github;
pub mod memory;

use async_trait::async_trait;

use crate::error::StoreError;

pub use github::GitHubStore;
pub use memory::InMemoryStore;

/// A file as read from a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub path: String,
    pub content: Vec<u8>,
    /// `None` when the file does not exist yet
    pub version: Option<String>,
}

impl RemoteFile {
    /// Placeholder for a path that has no file yet.
    #[must_use]
    pub fn absent(path: &str) -> Self {
        Self {
            path: path.to_string(),
            content: Vec::new(),
            version: None,
        }
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.version.is_some()
    }
}

/// Commit details forwarded with every write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitMetadata {
    pub message: String,
    /// Target branch; empty means the repository default
    pub branch: String,
    pub author_name: String,
    pub author_email: String,
}

/// Read/create/update access to a version-controlled file store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch a file. A missing file is `Err(StoreError::NotFound)`.
    async fn get(&self, path: &str) -> Result<RemoteFile, StoreError>;

    /// Create (`expected_version == None`) or update a file.
    ///
    /// Implementations must return [`StoreError::Conflict`] instead of
    /// overwriting when the file exists on create or the version is stale.
    async fn create_or_update(
        &self,
        path: &str,
        content: &[u8],
        expected_version: Option<&str>,
        metadata: &CommitMetadata,
    ) -> Result<(), StoreError>;
}
