//! Runner registry and claim accounting.

use gantry_core::ids::RunnerId;
use gantry_core::ports::{ExecutorKind, RunnerAgent};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// An execution agent registered with the engine.
#[derive(Clone)]
pub struct Runner {
    pub id: RunnerId,
    pub name: String,
    pub tags: Vec<String>,
    /// How many jobs this runner executes concurrently.
    pub capacity: usize,
    pub executor: ExecutorKind,
    pub agent: Arc<dyn RunnerAgent>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("tags", &self.tags)
            .field("capacity", &self.capacity)
            .field("executor", &self.executor)
            .finish()
    }
}

struct Slot {
    runner: Runner,
    active: usize,
}

/// A successfully claimed execution slot.
#[derive(Clone)]
pub struct Claim {
    pub runner_id: RunnerId,
    pub executor: ExecutorKind,
    pub agent: Arc<dyn RunnerAgent>,
}

/// Shared runner registry. The scheduler claims a slot per dispatch and
/// releases it on job completion.
pub struct RunnerPool {
    slots: RwLock<Vec<Slot>>,
}

impl RunnerPool {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
        }
    }

    pub async fn register(&self, runner: Runner) {
        debug!(runner = %runner.name, tags = ?runner.tags, capacity = runner.capacity, "registering runner");
        self.slots.write().await.push(Slot { runner, active: 0 });
    }

    /// Claim the first compatible runner with free capacity. A runner is
    /// compatible when it carries every required tag.
    pub async fn claim(&self, tags: &[String]) -> Option<Claim> {
        let mut slots = self.slots.write().await;
        for slot in slots.iter_mut() {
            if slot.active < slot.runner.capacity && has_tags(&slot.runner, tags) {
                slot.active += 1;
                return Some(Claim {
                    runner_id: slot.runner.id,
                    executor: slot.runner.executor,
                    agent: Arc::clone(&slot.runner.agent),
                });
            }
        }
        None
    }

    pub async fn release(&self, id: RunnerId) {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.iter_mut().find(|s| s.runner.id == id) {
            slot.active = slot.active.saturating_sub(1);
        }
    }

    /// Whether any registered runner could ever serve these tags,
    /// regardless of current load.
    pub async fn has_compatible(&self, tags: &[String]) -> bool {
        self.slots
            .read()
            .await
            .iter()
            .any(|s| has_tags(&s.runner, tags))
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }
}

impl Default for RunnerPool {
    fn default() -> Self {
        Self::new()
    }
}

fn has_tags(runner: &Runner, required: &[String]) -> bool {
    required.iter().all(|t| runner.tags.contains(t))
}
