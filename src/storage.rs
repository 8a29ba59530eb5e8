//! Durable key/value persistence used to hydrate the credential store.
//!
//! The [`Storage`] trait is the seam to whatever the host platform offers
//! (secure storage, a preferences file, a keychain). Two implementations ship
//! with the crate:
//!
//! - [`MemoryStorage`] keeps everything in a shared map; handy for tests and
//!   for hosts that hydrate from elsewhere.
//! - [`FileStorage`] writes one file per key below a root directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{Result, SessionError};

/// Asynchronous key/value storage.
///
/// Keys are short ASCII identifiers; values are opaque strings (the credential
/// store writes JSON).
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Read the value stored under `key`, or `None` if nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Storage`] or [`SessionError::Io`] if the backend
    /// is unavailable.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value could not be written durably.
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Remove the value stored under `key`. Removing a missing key succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend could not be updated.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory [`Storage`] backed by a shared map.
///
/// Clones share the same map, so a test can keep one clone to inspect what
/// the credential store persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    /// Create an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a storage pre-populated with a single entry.
    pub fn with_entry(key: impl Into<String>, value: impl Into<String>) -> Self {
        let storage = Self::new();
        if let Ok(mut entries) = storage.entries.lock() {
            entries.insert(key.into(), value.into());
        }
        storage
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| SessionError::Storage("memory storage lock poisoned".into()))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.lock()?.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

/// File-backed [`Storage`]: each key becomes `<root>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Create a storage rooted at `root`. The directory is created lazily on
    /// the first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory holding the stored files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SessionError::Storage(format!("invalid storage key: {key:?}")));
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SessionError::Io(e)),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.root).await?;
        // Write-then-rename: readers never observe a partial record.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionError::Io(e)),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_clones_share_entries() {
        let storage = MemoryStorage::new();
        let observer = storage.clone();

        storage.set("auth-storage", "{}".into()).await.unwrap();
        assert_eq!(observer.get("auth-storage").await.unwrap().as_deref(), Some("{}"));

        storage.remove("auth-storage").await.unwrap();
        assert!(observer.get("auth-storage").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_storage_remove_missing_key_succeeds() {
        let storage = MemoryStorage::new();
        storage.remove("nothing-here").await.unwrap();
    }

    #[tokio::test]
    async fn file_storage_missing_key_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("state"));
        assert!(storage.get("auth-storage").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_storage_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("state");

        FileStorage::new(&root)
            .set("auth-storage", r#"{"token":"t"}"#.into())
            .await
            .unwrap();

        let reopened = FileStorage::new(&root);
        assert_eq!(
            reopened.get("auth-storage").await.unwrap().as_deref(),
            Some(r#"{"token":"t"}"#)
        );

        reopened.remove("auth-storage").await.unwrap();
        assert!(reopened.get("auth-storage").await.unwrap().is_none());
        // Removing twice is fine.
        reopened.remove("auth-storage").await.unwrap();
    }

    #[tokio::test]
    async fn file_storage_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let err = storage.get("../escape").await.unwrap_err();
        assert!(matches!(err, SessionError::Storage(_)));
    }
}
