//! Artifact persistence keyed by pipeline and job.
//!
//! Artifacts are opaque archives collected from a finished job's workspace.
//! They are visible to other jobs only through declared needs with
//! `artifacts: true`; there is no ambient artifact inheritance.

use chrono::{DateTime, Duration, Utc};
use gantry_core::ids::{JobName, PipelineId};
use gantry_core::job::Need;
use gantry_core::ports::{BlobMeta, BlobStore};
use gantry_core::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ArtifactStore {
    blobs: Arc<dyn BlobStore>,
}

impl ArtifactStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    fn key(pipeline: PipelineId, job: &JobName) -> String {
        format!("artifacts/{}/{}", pipeline, job)
    }

    /// Store a job's artifact archive. A repeated store for the same job
    /// (a retried attempt) overwrites the previous archive.
    pub async fn store(
        &self,
        pipeline: PipelineId,
        job: &JobName,
        archive: Vec<u8>,
        expire_in_seconds: Option<u64>,
    ) -> Result<BlobMeta> {
        let expires_at = expire_in_seconds.map(|s| Utc::now() + Duration::seconds(s as i64));
        let meta = self
            .blobs
            .put(&Self::key(pipeline, job), archive, expires_at)
            .await?;
        debug!(pipeline = %pipeline, job = %job, size = meta.size_bytes, "artifact stored");
        Ok(meta)
    }

    /// Fetch one job's artifact archive. An expired archive is deleted on
    /// access and reported as absent.
    pub async fn fetch(&self, pipeline: PipelineId, job: &JobName) -> Result<Option<Vec<u8>>> {
        let key = Self::key(pipeline, job);
        let Some((bytes, meta)) = self.blobs.get(&key).await? else {
            return Ok(None);
        };
        if meta.is_expired(Utc::now()) {
            debug!(key, "artifact expired, deleting on access");
            self.blobs.delete(&key).await?;
            return Ok(None);
        }
        Ok(Some(bytes))
    }

    /// Resolve the artifact archives a job is entitled to: one per declared
    /// need carrying `artifacts: true`. Needs without the flag, and needs
    /// whose producer stored nothing (skipped, or no artifact spec), yield
    /// no entry.
    pub async fn fetch_for(
        &self,
        pipeline: PipelineId,
        needs: &[Need],
    ) -> Result<HashMap<JobName, Vec<u8>>> {
        let mut archives = HashMap::new();
        for need in needs.iter().filter(|n| n.artifacts) {
            if let Some(bytes) = self.fetch(pipeline, &need.job).await? {
                archives.insert(need.job.clone(), bytes);
            }
        }
        Ok(archives)
    }

    /// Delete every expired artifact. Returns the number evicted.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut evicted = 0;
        for meta in self.blobs.list("artifacts/").await? {
            if meta.is_expired(now) {
                self.blobs.delete(&meta.key).await?;
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!(evicted, "artifact sweep complete");
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    fn store() -> ArtifactStore {
        ArtifactStore::new(Arc::new(MemoryBlobStore::new()))
    }

    fn need(job: &str, artifacts: bool) -> Need {
        Need {
            job: JobName::new(job),
            artifacts,
        }
    }

    #[tokio::test]
    async fn test_store_and_fetch() {
        let artifacts = store();
        let pipeline = PipelineId::new();
        let job = JobName::new("compile");

        artifacts
            .store(pipeline, &job, b"bin".to_vec(), None)
            .await
            .unwrap();
        let bytes = artifacts.fetch(pipeline, &job).await.unwrap().unwrap();
        assert_eq!(bytes, b"bin");
    }

    #[tokio::test]
    async fn test_fetch_for_honors_artifact_flag() {
        let artifacts = store();
        let pipeline = PipelineId::new();

        artifacts
            .store(pipeline, &JobName::new("compile"), b"bin".to_vec(), None)
            .await
            .unwrap();
        artifacts
            .store(pipeline, &JobName::new("lint"), b"report".to_vec(), None)
            .await
            .unwrap();

        let fetched = artifacts
            .fetch_for(pipeline, &[need("compile", true), need("lint", false)])
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert!(fetched.contains_key(&JobName::new("compile")));
    }

    #[tokio::test]
    async fn test_missing_producer_yields_no_entry() {
        let artifacts = store();
        let fetched = artifacts
            .fetch_for(PipelineId::new(), &[need("skipped", true)])
            .await
            .unwrap();
        assert!(fetched.is_empty());
    }

    #[tokio::test]
    async fn test_expired_artifact_deleted_on_access() {
        let artifacts = store();
        let pipeline = PipelineId::new();
        let job = JobName::new("compile");

        artifacts
            .store(pipeline, &job, b"bin".to_vec(), Some(0))
            .await
            .unwrap();
        assert!(artifacts.fetch(pipeline, &job).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_expired() {
        let artifacts = store();
        let pipeline = PipelineId::new();

        artifacts
            .store(pipeline, &JobName::new("old"), b"1".to_vec(), Some(0))
            .await
            .unwrap();
        artifacts
            .store(pipeline, &JobName::new("fresh"), b"2".to_vec(), Some(86_400))
            .await
            .unwrap();

        let evicted = artifacts.sweep(Utc::now()).await.unwrap();
        assert_eq!(evicted, 1);
        assert!(artifacts
            .fetch(pipeline, &JobName::new("fresh"))
            .await
            .unwrap()
            .is_some());
    }
}
