//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the orchestration core and its
//! external collaborators: runner agents, the VCS, secret providers, blob
//! persistence, and event transport. The core only ever programs against
//! these traits.

use crate::error::Result;
use crate::events::Event;
use crate::ids::{DispatchId, JobName, PipelineId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Executor kind a runner provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    Shell,
    Container,
    Cluster,
}

/// A request to execute one job attempt on a runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub pipeline_id: PipelineId,
    pub job: JobName,
    pub script: Vec<String>,
    pub variables: HashMap<String, String>,
    pub executor: ExecutorKind,
    pub attempt: u32,
    /// Restored cache archive to seed the workspace with, if any.
    pub cache_archive: Option<Vec<u8>>,
    /// Artifact archives from needed jobs, one per need declared with
    /// `artifacts: true` whose producer stored anything.
    pub artifacts: HashMap<JobName, Vec<u8>>,
}

/// Status of a dispatched job attempt, as reported by the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DispatchStatus {
    Running,
    Succeeded,
    Failed { exit_code: i32 },
    /// Infrastructure fault on the runner side, not a script failure.
    SystemFailure { message: String },
    Canceled,
}

impl DispatchStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DispatchStatus::Running)
    }
}

/// Protocol spoken to runner agents. Execution is opaque to the core: the
/// coordinator dispatches, polls, and cancels; it never observes the script
/// itself.
#[async_trait]
pub trait RunnerAgent: Send + Sync {
    /// Start executing a job attempt, returning a handle for later calls.
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchId>;

    /// Request cancellation. The job reaches a canceled status only once
    /// the runner acknowledges the stop; this call returns immediately.
    async fn cancel(&self, dispatch: DispatchId) -> Result<()>;

    /// Current status of a dispatch.
    async fn status(&self, dispatch: DispatchId) -> Result<DispatchStatus>;

    /// Collect the named workspace paths of a finished dispatch as one
    /// opaque archive blob.
    async fn collect(&self, dispatch: DispatchId, paths: &[String]) -> Result<Vec<u8>>;
}

/// Ref metadata from the VCS collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefMeta {
    pub sha: String,
    pub is_tag: bool,
    pub protected: bool,
}

/// VCS collaborator supplying ref metadata and change sets.
#[async_trait]
pub trait VcsProvider: Send + Sync {
    async fn ref_meta(&self, ref_name: &str) -> Result<RefMeta>;

    /// Changed paths for the given commit relative to its merge base.
    /// `None` when the diff cannot be computed; `changes:` rules then fail
    /// safe.
    async fn changed_paths(&self, ref_name: &str, sha: &str) -> Result<Option<Vec<String>>>;
}

/// Secret/variable provider, gated on ref protection.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Variables admitted for this ref. Values for protected-only secrets
    /// must be withheld when `protected` is false.
    async fn variables_for(&self, ref_name: &str, protected: bool)
    -> Result<HashMap<String, String>>;
}

/// A provider with no secrets; the default wiring.
pub struct NoSecrets;

#[async_trait]
impl SecretProvider for NoSecrets {
    async fn variables_for(
        &self,
        _ref_name: &str,
        _protected: bool,
    ) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}

/// Metadata stored alongside every blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobMeta {
    pub key: String,
    pub size_bytes: u64,
    pub checksum_sha256: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl BlobMeta {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Byte-blob persistence underlying the artifact and cache stores. Writes
/// are append/overwrite at key granularity; readers never block writers.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a blob, overwriting any existing value under the key.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<BlobMeta>;

    /// Fetch a blob. Returns `None` on a missing key; expiry is the
    /// caller's concern.
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, BlobMeta)>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Metadata for every key under a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>>;
}

/// Event bus for publishing and subscribing to engine events.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<Event>;
}
