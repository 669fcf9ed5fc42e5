//! Cross-pipeline build cache.
//!
//! Caches are best-effort by contract: a miss or a stale restore must never
//! fail a job. Lookup walks the exact key and then each fallback key in
//! declared order; pushes are last-writer-wins.

use chrono::{DateTime, Duration, Utc};
use gantry_core::ports::{BlobMeta, BlobStore};
use gantry_core::Result;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

/// A successful cache restore, carrying the key that actually matched.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub key: String,
    pub archive: Vec<u8>,
}

pub struct CacheStore {
    blobs: Arc<dyn BlobStore>,
}

impl CacheStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    fn blob_key(key: &str) -> String {
        format!("cache/{}", key)
    }

    /// Restore the freshest archive reachable from the key chain: the
    /// exact key first, then each fallback in order. Expired entries are
    /// deleted on access and do not match.
    pub async fn pull(&self, key: &str, fallbacks: &[String]) -> Result<Option<CacheHit>> {
        for candidate in std::iter::once(key).chain(fallbacks.iter().map(String::as_str)) {
            let blob_key = Self::blob_key(candidate);
            let Some((bytes, meta)) = self.blobs.get(&blob_key).await? else {
                continue;
            };
            if meta.is_expired(Utc::now()) {
                debug!(key = candidate, "cache entry expired, deleting on access");
                self.blobs.delete(&blob_key).await?;
                continue;
            }
            debug!(key = candidate, size = meta.size_bytes, "cache hit");
            return Ok(Some(CacheHit {
                key: candidate.to_string(),
                archive: bytes,
            }));
        }
        debug!(key, "cache miss");
        Ok(None)
    }

    /// Store an archive under a key, replacing whatever was there. Two
    /// concurrent pushes race benignly; the later write wins whole.
    pub async fn push(
        &self,
        key: &str,
        archive: Vec<u8>,
        expire_in_seconds: Option<u64>,
    ) -> Result<BlobMeta> {
        let expires_at = expire_in_seconds.map(|s| Utc::now() + Duration::seconds(s as i64));
        let meta = self
            .blobs
            .put(&Self::blob_key(key), archive, expires_at)
            .await?;
        debug!(key, size = meta.size_bytes, "cache pushed");
        Ok(meta)
    }

    /// Delete every expired cache entry. Returns the number evicted.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut evicted = 0;
        for meta in self.blobs.list("cache/").await? {
            if meta.is_expired(now) {
                self.blobs.delete(&meta.key).await?;
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!(evicted, "cache sweep complete");
        }
        Ok(evicted)
    }
}

/// Derive a cache key from a prefix and the contents of pinned files,
/// typically lockfiles. The same file contents always produce the same key,
/// so dependency changes roll the cache over naturally.
pub fn hashed_key(prefix: &str, file_contents: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for contents in file_contents {
        hasher.update((contents.len() as u64).to_le_bytes());
        hasher.update(contents);
    }
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", prefix, &digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    fn store() -> CacheStore {
        CacheStore::new(Arc::new(MemoryBlobStore::new()))
    }

    #[tokio::test]
    async fn test_exact_key_preferred_over_fallback() {
        let cache = store();
        cache.push("deps-main", b"main".to_vec(), None).await.unwrap();
        cache
            .push("deps-default", b"default".to_vec(), None)
            .await
            .unwrap();

        let hit = cache
            .pull("deps-main", &["deps-default".to_string()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.key, "deps-main");
        assert_eq!(hit.archive, b"main");
    }

    #[tokio::test]
    async fn test_fallback_chain_in_order() {
        let cache = store();
        cache
            .push("deps-default", b"default".to_vec(), None)
            .await
            .unwrap();

        let hit = cache
            .pull(
                "deps-feature",
                &["deps-develop".to_string(), "deps-default".to_string()],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.key, "deps-default");
    }

    #[tokio::test]
    async fn test_miss_when_nothing_matches() {
        let cache = store();
        assert!(cache.pull("deps-x", &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_push_overwrites() {
        let cache = store();
        cache.push("k", b"one".to_vec(), None).await.unwrap();
        cache.push("k", b"two".to_vec(), None).await.unwrap();

        let hit = cache.pull("k", &[]).await.unwrap().unwrap();
        assert_eq!(hit.archive, b"two");
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = store();
        cache.push("k", b"stale".to_vec(), Some(0)).await.unwrap();
        assert!(cache.pull("k", &[]).await.unwrap().is_none());
    }

    #[test]
    fn test_hashed_key_stable_and_content_sensitive() {
        let a = hashed_key("deps", &[b"lock v1"]);
        let b = hashed_key("deps", &[b"lock v1"]);
        let c = hashed_key("deps", &[b"lock v2"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("deps-"));
    }
}
