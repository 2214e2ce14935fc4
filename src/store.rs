//! Object storage seams
//!
//! The pipeline only ever needs to open an object as a byte stream and to
//! write a complete object back. [`ObjectStore`] is that surface, and
//! [`StoreFactory`] hands out a store scoped to one region.

use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio::io::AsyncRead;

/// A readable object body
pub type ObjectBody = Pin<Box<dyn AsyncRead + Send>>;

/// Errors from object storage backends
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Throttled: {0}")]
    Throttled(String),
    #[error("S3 error: {0}")]
    S3(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StoreError {
    pub fn not_found(bucket: &str, key: &str) -> Self {
        Self::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }
}

/// Where CARs are read from and indexes are written to
pub trait ObjectStore {
    /// Open `bucket`/`key` for streaming
    fn get(
        &self,
        bucket: &str,
        key: &str,
    ) -> impl Future<Output = Result<ObjectBody, StoreError>> + Send;

    /// Write a complete object
    fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Builds the store for an event's region
pub trait StoreFactory {
    type Store: ObjectStore + Send + Sync;

    fn for_region(
        &self,
        region: &str,
    ) -> impl Future<Output = Result<Self::Store, StoreError>> + Send;
}

/// Shared in-memory buckets
///
/// Clones share the same contents. Region is ignored: every region sees the
/// same buckets.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<RwLock<HashMap<(String, String), Bytes>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        self.objects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((bucket.to_string(), key.to_string()), body.into());
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// All keys currently in `bucket`, sorted
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let objects = self
            .objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut keys: Vec<_> = objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl ObjectStore for MemoryStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectBody, StoreError> {
        let body = self
            .object(bucket, key)
            .ok_or_else(|| StoreError::not_found(bucket, key))?;
        Ok(Box::pin(io::Cursor::new(body)))
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.insert(bucket, key, body);
        Ok(())
    }
}

impl StoreFactory for MemoryStore {
    type Store = MemoryStore;

    async fn for_region(&self, _region: &str) -> Result<Self::Store, StoreError> {
        Ok(self.clone())
    }
}

/// Buckets as directories under a root, keys as relative paths
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, bucket: &str, key: &str) -> Result<PathBuf, StoreError> {
        let escapes = |s: &str| {
            Path::new(s).components().any(|c| {
                !matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir)
            })
        };
        if bucket.is_empty() || key.is_empty() || escapes(bucket) || escapes(key) {
            return Err(StoreError::InvalidConfig(format!(
                "refusing to map {bucket}/{key} outside of {}",
                self.root.display()
            )));
        }
        Ok(self.root.join(bucket).join(key))
    }
}

impl ObjectStore for FsStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectBody, StoreError> {
        let path = self.path(bucket, key)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::not_found(bucket, key)),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes next to the destination and renames into place, so readers
    /// never see a partial object
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
        let path = self.path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(".partial");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

impl StoreFactory for FsStore {
    type Store = FsStore;

    async fn for_region(&self, _region: &str) -> Result<Self::Store, StoreError> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_all(mut body: ObjectBody) -> Vec<u8> {
        let mut buf = Vec::new();
        body.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get("b", "k").await,
            Err(StoreError::NotFound { .. })
        ));

        store.put("b", "k", Bytes::from_static(b"hello")).await.unwrap();
        let shared = store.for_region("eu-west-2").await.unwrap();
        assert_eq!(read_all(shared.get("b", "k").await.unwrap()).await, b"hello");
        assert_eq!(store.keys("b"), vec!["k"]);
        assert!(store.keys("other").is_empty());
    }

    #[tokio::test]
    async fn test_fs_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());

        store
            .put("bucket", "nested/dir/x.car.idx", Bytes::from_static(b"idx"))
            .await
            .unwrap();
        let body = store.get("bucket", "nested/dir/x.car.idx").await.unwrap();
        assert_eq!(read_all(body).await, b"idx");
        assert!(!dir.path().join("bucket/nested/dir/x.car.idx.partial").exists());

        assert!(matches!(
            store.get("bucket", "missing.car").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_fs_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        for (bucket, key) in [("b", "../x"), ("..", "x"), ("b", "/etc/passwd"), ("", "x")] {
            assert!(
                matches!(store.get(bucket, key).await, Err(StoreError::InvalidConfig(_))),
                "{bucket}/{key}"
            );
        }
    }
}
