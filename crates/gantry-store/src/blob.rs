//! Blob store backends.
//!
//! Two implementations of the `BlobStore` port: an in-memory map for tests
//! and single-process deployments, and a filesystem store that keeps each
//! blob next to a JSON metadata sidecar.

use chrono::{DateTime, Utc};
use gantry_core::ports::{BlobMeta, BlobStore};
use gantry_core::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::trace;

fn make_meta(key: &str, bytes: &[u8], expires_at: Option<DateTime<Utc>>) -> BlobMeta {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    BlobMeta {
        key: key.to_string(),
        size_bytes: bytes.len() as u64,
        checksum_sha256: hex::encode(hasher.finalize()),
        created_at: Utc::now(),
        expires_at,
    }
}

/// In-memory blob store.
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, (Vec<u8>, BlobMeta)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<BlobMeta> {
        let meta = make_meta(key, &bytes, expires_at);
        trace!(key, size = meta.size_bytes, "storing blob");
        self.blobs
            .write()
            .await
            .insert(key.to_string(), (bytes, meta.clone()));
        Ok(meta)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, BlobMeta)>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>> {
        let mut metas: Vec<BlobMeta> = self
            .blobs
            .read()
            .await
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(_, (_, meta))| meta.clone())
            .collect();
        metas.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(metas)
    }
}

/// Filesystem blob store. Keys are flattened into filenames; each blob file
/// is paired with a `.meta.json` sidecar carrying its `BlobMeta`.
pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        // Keys use '/' as a namespace separator; flatten for storage.
        self.root.join(key.replace('/', "__"))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        let mut path = self.blob_path(key).into_os_string();
        path.push(".meta.json");
        PathBuf::from(path)
    }
}

#[async_trait::async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<BlobMeta> {
        let meta = make_meta(key, &bytes, expires_at);
        tokio::fs::write(self.blob_path(key), &bytes).await?;
        tokio::fs::write(self.meta_path(key), serde_json::to_vec(&meta)?).await?;
        Ok(meta)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, BlobMeta)>> {
        let meta_bytes = match tokio::fs::read(self.meta_path(key)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let meta: BlobMeta = serde_json::from_slice(&meta_bytes)?;
        let bytes = tokio::fs::read(self.blob_path(key)).await?;
        Ok(Some((bytes, meta)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        for path in [self.blob_path(key), self.meta_path(key)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>> {
        let mut metas = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(".meta.json") {
                continue;
            }
            let bytes = tokio::fs::read(entry.path()).await?;
            let meta: BlobMeta = serde_json::from_slice(&bytes).map_err(|err| {
                Error::Storage(format!("corrupt metadata for {}: {}", name, err))
            })?;
            if meta.key.starts_with(prefix) {
                metas.push(meta);
            }
        }
        metas.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(metas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_put_get_roundtrip() {
        let store = MemoryBlobStore::new();
        let meta = store.put("a/b", b"hello".to_vec(), None).await.unwrap();
        assert_eq!(meta.size_bytes, 5);

        let (bytes, fetched) = store.get("a/b").await.unwrap().unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(fetched.checksum_sha256, meta.checksum_sha256);
        assert!(store.get("a/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_put_overwrites() {
        let store = MemoryBlobStore::new();
        store.put("k", b"one".to_vec(), None).await.unwrap();
        store.put("k", b"two".to_vec(), None).await.unwrap();
        let (bytes, _) = store.get("k").await.unwrap().unwrap();
        assert_eq!(bytes, b"two");
    }

    #[tokio::test]
    async fn test_memory_list_by_prefix() {
        let store = MemoryBlobStore::new();
        store.put("cache/a", b"1".to_vec(), None).await.unwrap();
        store.put("cache/b", b"2".to_vec(), None).await.unwrap();
        store.put("artifacts/x", b"3".to_vec(), None).await.unwrap();

        let metas = store.list("cache/").await.unwrap();
        let keys: Vec<&str> = metas.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["cache/a", "cache/b"]);
    }

    #[tokio::test]
    async fn test_filesystem_roundtrip() {
        let dir = std::env::temp_dir().join(format!("gantry-blob-{}", uuid::Uuid::new_v4()));
        let store = FilesystemBlobStore::open(&dir).await.unwrap();

        store
            .put("artifacts/p1/compile", b"archive".to_vec(), None)
            .await
            .unwrap();
        let (bytes, meta) = store.get("artifacts/p1/compile").await.unwrap().unwrap();
        assert_eq!(bytes, b"archive");
        assert_eq!(meta.key, "artifacts/p1/compile");

        store.delete("artifacts/p1/compile").await.unwrap();
        assert!(store.get("artifacts/p1/compile").await.unwrap().is_none());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
