//! Shared fixtures for scheduler tests.

use chrono::Utc;
use gantry_core::config::RetryPolicy;
use gantry_core::ids::{DispatchId, JobName, PipelineId};
use gantry_core::job::{Job, JobStatus, Need};
use gantry_core::pipeline::{Pipeline, PipelineStatus};
use gantry_core::ports::{DispatchRequest, DispatchStatus, RunnerAgent};
use gantry_core::rules::{RuleAction, TriggerSource};
use gantry_core::Result;
use std::collections::HashMap;

fn stage_index_of(stage: &str) -> usize {
    match stage {
        "build" => 0,
        "test" => 1,
        "deploy" => 2,
        other => panic!("unknown fixture stage {other}"),
    }
}

pub fn stage_job(name: &str, stage: &str) -> Job {
    Job {
        name: JobName::new(name),
        stage: stage.to_string(),
        stage_index: stage_index_of(stage),
        index: 0,
        script: vec!["echo ok".to_string()],
        variables: HashMap::new(),
        outcome: RuleAction::Run,
        needs: vec![],
        dag_mode: false,
        tags: vec![],
        retry: RetryPolicy::default(),
        timeout_seconds: 3600,
        allow_failure: false,
        artifacts: None,
        cache: None,
        environment: None,
        status: JobStatus::Blocked,
        attempts: 0,
        failure_reason: None,
        exit_code: None,
        created_at: Utc::now(),
        started_at: None,
        finished_at: None,
    }
}

pub fn needs_job(name: &str, stage: &str, needs: &[&str]) -> Job {
    let mut job = stage_job(name, stage);
    job.dag_mode = true;
    job.needs = needs
        .iter()
        .map(|n| Need {
            job: JobName::new(*n),
            artifacts: false,
        })
        .collect();
    job
}

pub fn make_pipeline(mut jobs: Vec<Job>) -> Pipeline {
    for (i, job) in jobs.iter_mut().enumerate() {
        job.index = i;
    }
    Pipeline {
        id: PipelineId::new(),
        ref_name: "main".to_string(),
        sha: "deadbeef".to_string(),
        source: TriggerSource::Push,
        stages: vec![
            "build".to_string(),
            "test".to_string(),
            "deploy".to_string(),
        ],
        jobs,
        status: PipelineStatus::Created,
        max_parallel: None,
        canceled: false,
        environments: HashMap::new(),
        created_at: Utc::now(),
        finished_at: None,
    }
}

/// Agent that accepts every dispatch and immediately reports success.
pub struct NullAgent;

#[async_trait::async_trait]
impl RunnerAgent for NullAgent {
    async fn dispatch(&self, _request: DispatchRequest) -> Result<DispatchId> {
        Ok(DispatchId::new())
    }

    async fn cancel(&self, _dispatch: DispatchId) -> Result<()> {
        Ok(())
    }

    async fn status(&self, _dispatch: DispatchId) -> Result<DispatchStatus> {
        Ok(DispatchStatus::Succeeded)
    }

    async fn collect(&self, _dispatch: DispatchId, _paths: &[String]) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}
