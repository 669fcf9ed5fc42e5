//! Lifecycle events emitted by the engine, coordinator, and stores.

use crate::error::FailureReason;
use crate::ids::{ArtifactId, JobName, PipelineId, RunnerId};
use crate::job::JobStatus;
use crate::pipeline::PipelineStatus;
use crate::ports::EventBus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// All events in the Gantry engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Pipeline lifecycle
    PipelineCreated(PipelineCreatedPayload),
    PipelineCompleted(PipelineCompletedPayload),

    // Job lifecycle
    JobStarted(JobStartedPayload),
    JobCompleted(JobCompletedPayload),

    // Storage
    ArtifactStored(ArtifactStoredPayload),
    CacheHit(CacheHitPayload),
    CacheMiss(CacheMissPayload),
    CachePushed(CachePushedPayload),
    CacheEvicted(CacheEvictedPayload),
}

impl Event {
    /// Dotted subject for subscription filtering.
    pub fn subject(&self) -> String {
        match self {
            Event::PipelineCreated(p) => format!("pipeline.created.{}", p.pipeline_id),
            Event::PipelineCompleted(p) => format!("pipeline.completed.{}", p.pipeline_id),
            Event::JobStarted(p) => format!("pipeline.{}.job.{}.started", p.pipeline_id, p.job),
            Event::JobCompleted(p) => {
                format!("pipeline.{}.job.{}.completed", p.pipeline_id, p.job)
            }
            Event::ArtifactStored(p) => {
                format!("pipeline.{}.artifact.{}", p.pipeline_id, p.job)
            }
            Event::CacheHit(p) => format!("cache.hit.{}", p.key),
            Event::CacheMiss(p) => format!("cache.miss.{}", p.key),
            Event::CachePushed(p) => format!("cache.pushed.{}", p.key),
            Event::CacheEvicted(p) => format!("cache.evicted.{}", p.key),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineCreatedPayload {
    pub pipeline_id: PipelineId,
    pub ref_name: String,
    pub sha: String,
    pub job_count: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineCompletedPayload {
    pub pipeline_id: PipelineId,
    pub status: PipelineStatus,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStartedPayload {
    pub pipeline_id: PipelineId,
    pub job: JobName,
    pub runner_id: RunnerId,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCompletedPayload {
    pub pipeline_id: PipelineId,
    pub job: JobName,
    pub status: JobStatus,
    pub failure_reason: Option<FailureReason>,
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactStoredPayload {
    pub pipeline_id: PipelineId,
    pub job: JobName,
    pub artifact_id: ArtifactId,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheHitPayload {
    pub key: String,
    /// The key that actually matched; differs from `key` on fallback hits.
    pub matched_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMissPayload {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePushedPayload {
    pub key: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEvictedPayload {
    pub key: String,
}

/// In-process event bus backed by a broadcast channel. Slow subscribers drop
/// events rather than block publishers.
pub struct BroadcastBus {
    tx: broadcast::Sender<Event>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventBus for BroadcastBus {
    async fn publish(&self, event: Event) -> crate::Result<()> {
        // A send error just means nobody is subscribed.
        let _ = self.tx.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subjects() {
        let event = Event::CacheHit(CacheHitPayload {
            key: "deps-v1".to_string(),
            matched_key: "deps-v1".to_string(),
        });
        assert_eq!(event.subject(), "cache.hit.deps-v1");
    }

    #[tokio::test]
    async fn test_broadcast_bus_delivers() {
        let bus = BroadcastBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(Event::CacheMiss(CacheMissPayload {
            key: "deps-v1".to_string(),
        }))
        .await
        .unwrap();

        match rx.recv().await.unwrap() {
            Event::CacheMiss(p) => assert_eq!(p.key, "deps-v1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
