//! Scheduling and execution for Gantry pipelines.
//!
//! The engine owns pipeline state; the DAG and settle logic decide what can
//! run; the runner pool decides where; the coordinator drives each job on
//! its runner to a terminal status.

pub mod coordinator;
pub mod dag;
pub mod engine;
pub mod runners;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testutil;

pub use coordinator::{CoordinatorConfig, ExecutionCoordinator, JobOutcome};
pub use dag::JobDag;
pub use engine::{Engine, EngineConfig, TriggerRequest};
pub use runners::{Claim, Runner, RunnerPool};
pub use scheduler::{ready_jobs, settle, ReadyJob};
