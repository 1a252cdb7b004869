//! Object stores holding templates and attachments

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use hermes_common::internal;
use parking_lot::RwLock;

use crate::StoreError;

/// Read access to a bucket of named blobs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human readable name of the bucket, used in errors and logs.
    fn location(&self) -> &str;

    /// Fetch the whole object stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if there is no such object, or another
    /// [`StoreError`] if it could not be read.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
}

/// Reject keys that could escape the bucket.
fn validate_key(key: &str) -> Result<&Path, StoreError> {
    let path = Path::new(key);

    let valid = !key.is_empty()
        && !key.contains('\\')
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));

    if valid {
        Ok(path)
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// In-memory bucket
///
/// Used by tests and dry runs. Clones share the same objects.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    name: Arc<str>,
    objects: Arc<RwLock<HashMap<String, Arc<[u8]>>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            objects: Arc::default(),
        }
    }

    pub fn insert(&self, key: impl Into<String>, data: impl Into<Arc<[u8]>>) {
        self.objects.write().insert(key.into(), data.into());
    }

    #[must_use]
    pub fn with_object(self, key: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        self.insert(key, data);
        self
    }

    pub fn remove(&self, key: &str) -> bool {
        self.objects.write().remove(key).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn location(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        validate_key(key)?;

        self.objects
            .read()
            .get(key)
            .map(|data| data.to_vec())
            .ok_or_else(|| StoreError::NotFound {
                location: self.name.to_string(),
                key: key.to_string(),
            })
    }
}

/// A bucket backed by a directory: objects live at `<root>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    path: PathBuf,
    location: String,
    read_timeout: Duration,
}

impl DirectoryStore {
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

    /// # Errors
    ///
    /// Returns [`StoreError::InvalidKey`] if `bucket` is not a single path
    /// segment.
    pub fn new(root: impl Into<PathBuf>, bucket: &str) -> Result<Self, StoreError> {
        if validate_key(bucket)?.components().count() != 1 {
            return Err(StoreError::InvalidKey(bucket.to_string()));
        }

        let path = root.into().join(bucket);
        let location = path.display().to_string();

        Ok(Self {
            path,
            location,
            read_timeout: Self::DEFAULT_READ_TIMEOUT,
        })
    }

    #[must_use]
    pub const fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ObjectStore for DirectoryStore {
    fn location(&self) -> &str {
        &self.location
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path.join(validate_key(key)?);

        internal!(level = DEBUG, location = %self.location, key, "Reading object");

        match tokio::time::timeout(self.read_timeout, tokio::fs::read(&path)).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(e)) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound {
                location: self.location.clone(),
                key: key.to_string(),
            }),
            Ok(Err(source)) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
            Err(_) => Err(StoreError::Timeout {
                key: key.to_string(),
                timeout: self.read_timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(validate_key("welcome.html").is_ok());
        assert!(validate_key("invoices/2024/01.pdf").is_ok());

        for key in ["", "/etc/passwd", "../secret", "a/../../b", "./a", "a\\b"] {
            assert!(
                matches!(validate_key(key), Err(StoreError::InvalidKey(_))),
                "{key} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new("templates").with_object("a.txt", b"hello".as_slice());
        assert_eq!(store.location(), "templates");
        assert_eq!(store.get("a.txt").await.unwrap(), b"hello");
        assert_eq!(store.len(), 1);

        let err = store.get("b.txt").await.unwrap_err();
        assert_eq!(err.to_string(), "Object b.txt not found in templates");

        assert!(store.remove("a.txt"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_directory_store_reads_nested_keys() {
        let root = tempfile::tempdir().unwrap();
        let bucket = root.path().join("attachments");
        std::fs::create_dir_all(bucket.join("invoices")).unwrap();
        std::fs::write(bucket.join("invoices/jan.pdf"), b"%PDF-1.4").unwrap();

        let store = DirectoryStore::new(root.path(), "attachments").unwrap();
        assert_eq!(store.get("invoices/jan.pdf").await.unwrap(), b"%PDF-1.4");

        assert!(matches!(
            store.get("missing.pdf").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.get("../attachments/invoices/jan.pdf").await,
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_directory_store_rejects_nested_bucket() {
        assert!(DirectoryStore::new("/srv", "a/b").is_err());
        assert!(DirectoryStore::new("/srv", "..").is_err());
        assert!(DirectoryStore::new("/srv", "templates").is_ok());
    }
}
