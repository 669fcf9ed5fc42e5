//! Runtime job state.

use crate::config::{ArtifactSpec, CacheSpec, EnvironmentSpec, RetryPolicy};
use crate::error::{Error, FailureReason, Result};
use crate::ids::JobName;
use crate::rules::RuleAction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A resolved dependency edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Need {
    pub job: JobName,
    pub artifacts: bool,
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for dependencies to reach a terminal, non-blocking state.
    Blocked,
    /// Dependencies satisfied, waiting for a compatible runner.
    Pending,
    /// Gated on an explicit external trigger.
    Manual,
    Running,
    Success,
    Failed,
    Canceled,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Canceled | JobStatus::Skipped
        )
    }
}

/// A single schedulable unit of work, created at pipeline-creation time from
/// configuration. Mutated only by the scheduler and the execution
/// coordinator; immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub name: JobName,
    pub stage: String,
    pub stage_index: usize,
    /// Declaration order within the pipeline; the scheduler's tie-break.
    pub index: usize,
    pub script: Vec<String>,
    pub variables: HashMap<String, String>,
    pub outcome: RuleAction,
    pub needs: Vec<Need>,
    /// True when explicit `needs` replaced the stage-order edges.
    pub dag_mode: bool,
    pub tags: Vec<String>,
    pub retry: RetryPolicy,
    pub timeout_seconds: u64,
    pub allow_failure: bool,
    pub artifacts: Option<ArtifactSpec>,
    pub cache: Option<CacheSpec>,
    pub environment: Option<EnvironmentSpec>,
    pub status: JobStatus,
    pub attempts: u32,
    pub failure_reason: Option<FailureReason>,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether this job, in its current state, lets dependents proceed.
    pub fn satisfies_dependents(&self) -> bool {
        match self.status {
            JobStatus::Success | JobStatus::Skipped => true,
            JobStatus::Failed => self.allow_failure,
            _ => false,
        }
    }

    /// Whether this job, in its current state, permanently blocks
    /// dependents.
    pub fn blocks_dependents(&self) -> bool {
        self.status.is_terminal() && !self.satisfies_dependents()
    }

    /// Guarded status transition. Terminal states are immutable.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::Internal(format!(
                "job {} is terminal ({:?}), cannot transition to {:?}",
                self.name, self.status, next
            )));
        }
        if next == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    /// Record a terminal failure with its attributed reason.
    pub fn fail(&mut self, reason: FailureReason, exit_code: Option<i32>) -> Result<()> {
        self.failure_reason = Some(reason);
        self.exit_code = exit_code;
        self.transition(JobStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_job(status: JobStatus, allow_failure: bool) -> Job {
        Job {
            name: JobName::new("unit"),
            stage: "test".to_string(),
            stage_index: 1,
            index: 0,
            script: vec!["echo ok".to_string()],
            variables: HashMap::new(),
            outcome: RuleAction::Run,
            needs: vec![],
            dag_mode: false,
            tags: vec![],
            retry: RetryPolicy::default(),
            timeout_seconds: 3600,
            allow_failure,
            artifacts: None,
            cache: None,
            environment: None,
            status,
            attempts: 0,
            failure_reason: None,
            exit_code: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        let mut job = make_job(JobStatus::Running, false);
        job.transition(JobStatus::Success).unwrap();
        assert!(job.transition(JobStatus::Running).is_err());
        assert_eq!(job.status, JobStatus::Success);
    }

    #[test]
    fn test_allow_failure_satisfies_dependents() {
        let mut failed = make_job(JobStatus::Running, true);
        failed.fail(FailureReason::ScriptFailure, Some(1)).unwrap();
        assert!(failed.satisfies_dependents());
        assert!(!failed.blocks_dependents());

        let mut hard_failed = make_job(JobStatus::Running, false);
        hard_failed
            .fail(FailureReason::ScriptFailure, Some(1))
            .unwrap();
        assert!(hard_failed.blocks_dependents());
    }

    #[test]
    fn test_skipped_satisfies_dependents() {
        let job = make_job(JobStatus::Skipped, false);
        assert!(job.satisfies_dependents());
    }

    #[test]
    fn test_failure_preserves_reason_and_exit_code() {
        let mut job = make_job(JobStatus::Running, false);
        job.fail(FailureReason::Timeout, None).unwrap();
        assert_eq!(job.failure_reason, Some(FailureReason::Timeout));
        assert_eq!(job.status, JobStatus::Failed);
    }
}
