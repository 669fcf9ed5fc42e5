//! Runtime pipeline state and status aggregation.

use crate::config::EnvironmentAction;
use crate::ids::{JobName, PipelineId};
use crate::job::{Job, JobStatus};
use crate::rules::TriggerSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Overall pipeline status, derived from the statuses of its jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Created,
    Running,
    Success,
    Failed,
    Canceled,
    /// The only remaining work is awaiting manual triggers, with no
    /// failures so far.
    Manual,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Success | PipelineStatus::Failed | PipelineStatus::Canceled
        )
    }
}

/// State of a deployment environment touched by this pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    Available,
    Stopped,
}

/// One end-to-end run of all stages and jobs, triggered by an event. Owns
/// its jobs transitively; destroyed only by retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub ref_name: String,
    pub sha: String,
    pub source: TriggerSource,
    pub stages: Vec<String>,
    pub jobs: Vec<Job>,
    pub status: PipelineStatus,
    pub max_parallel: Option<usize>,
    /// Set by explicit external cancellation; pins the derived status.
    pub canceled: bool,
    pub environments: HashMap<String, EnvironmentState>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Pipeline {
    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name.as_str() == name)
    }

    pub fn job_mut(&mut self, name: &str) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.name.as_str() == name)
    }

    pub fn running_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .count()
    }

    /// Aggregate job states into the overall pipeline status.
    ///
    /// Success requires every non-allow-failure job to have succeeded (or
    /// been skipped); a terminal failure on any non-allow-failure job makes
    /// the pipeline failed once nothing actionable remains; manual gates
    /// with no failures leave the pipeline in `Manual`.
    pub fn derive_status(&self) -> PipelineStatus {
        if self.canceled {
            return PipelineStatus::Canceled;
        }

        let mut any_actionable = false;
        let mut any_gated = false;
        let mut any_failed = false;
        let mut any_canceled = false;

        for job in &self.jobs {
            match job.status {
                JobStatus::Running | JobStatus::Pending => any_actionable = true,
                // Blocked jobs only persist behind a manual gate; the
                // scheduler settles every other case.
                JobStatus::Manual | JobStatus::Blocked => any_gated = true,
                JobStatus::Failed if !job.allow_failure => any_failed = true,
                JobStatus::Canceled => any_canceled = true,
                _ => {}
            }
        }

        if any_actionable {
            return PipelineStatus::Running;
        }
        if any_gated {
            return if any_failed {
                PipelineStatus::Failed
            } else {
                PipelineStatus::Manual
            };
        }
        if any_failed {
            return PipelineStatus::Failed;
        }
        if any_canceled {
            return PipelineStatus::Canceled;
        }
        PipelineStatus::Success
    }

    /// Record the environment effect of a successfully completed job.
    pub fn record_environment(&mut self, job_name: &JobName) {
        let Some(job) = self.job(job_name.as_str()) else {
            return;
        };
        if job.status != JobStatus::Success {
            return;
        }
        if let Some(env) = job.environment.clone() {
            let state = match env.action {
                EnvironmentAction::Start => EnvironmentState::Available,
                EnvironmentAction::Stop => EnvironmentState::Stopped,
            };
            self.environments.insert(env.name, state);
        }
    }
}
