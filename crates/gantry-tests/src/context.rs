//! In-process engine wiring for integration tests.

use crate::fixtures::StaticVcs;
use crate::runner::FakeRunner;
use gantry_core::events::BroadcastBus;
use gantry_core::ids::RunnerId;
use gantry_core::ports::{ExecutorKind, NoSecrets};
use gantry_scheduler::{Engine, EngineConfig, Runner, RunnerPool};
use gantry_store::{ArtifactStore, CacheStore, MemoryBlobStore};
use std::sync::Arc;
use std::time::Duration;

/// A fully wired engine over in-memory collaborators and a scripted
/// runner. Intervals are shortened so tests settle in milliseconds.
pub struct TestContext {
    pub engine: Arc<Engine>,
    pub runner: Arc<FakeRunner>,
    pub events: Arc<BroadcastBus>,
    pub artifacts: Arc<ArtifactStore>,
    pub cache: Arc<CacheStore>,
    pub pool: Arc<RunnerPool>,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_vcs(StaticVcs::default()).await
    }

    pub async fn with_vcs(vcs: StaticVcs) -> Self {
        let blobs = Arc::new(MemoryBlobStore::new());
        let artifacts = Arc::new(ArtifactStore::new(blobs.clone()));
        let cache = Arc::new(CacheStore::new(blobs));
        let events = Arc::new(BroadcastBus::new(256));
        let pool = Arc::new(RunnerPool::new());
        let runner = Arc::new(FakeRunner::new());

        pool.register(Runner {
            id: RunnerId::new(),
            name: "test-runner".to_string(),
            tags: vec!["linux".to_string()],
            capacity: 4,
            executor: ExecutorKind::Shell,
            agent: runner.clone(),
        })
        .await;

        let engine = Arc::new(Engine::new(
            pool.clone(),
            Arc::new(vcs),
            Arc::new(NoSecrets),
            events.clone(),
            artifacts.clone(),
            cache.clone(),
            EngineConfig {
                poll_interval: Duration::from_millis(10),
                scheduling_timeout: Duration::from_millis(300),
                cancel_grace: Duration::from_secs(1),
            },
        ));

        Self {
            engine,
            runner,
            events,
            artifacts,
            cache,
            pool,
        }
    }
}
