//! Execution coordination for a single job.
//!
//! The coordinator owns everything between "this job is pending on a
//! claimed runner" and "this job has a terminal status": cache restore,
//! artifact staging, dispatch, polling, timeout enforcement, cancellation,
//! retry, and post-run uploads. Cache and artifact traffic is best effort;
//! only the script and the runner decide whether the job fails.

use crate::runners::Claim;
use gantry_core::config::{ArtifactWhen, CacheSpec};
use gantry_core::error::FailureReason;
use gantry_core::events::{
    ArtifactStoredPayload, CacheHitPayload, CacheMissPayload, CachePushedPayload, Event,
};
use gantry_core::ids::{ArtifactId, DispatchId, PipelineId};
use gantry_core::job::{Job, JobStatus};
use gantry_core::ports::{DispatchRequest, DispatchStatus, EventBus, RunnerAgent};
use gantry_store::{ArtifactStore, CacheStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How often a dispatched job is polled for status.
    pub poll_interval: Duration,
    /// How long to wait for a runner to acknowledge a cancellation before
    /// giving up on the acknowledgement.
    pub cancel_grace: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            cancel_grace: Duration::from_secs(5),
        }
    }
}

/// Terminal result of executing a job, across all retry attempts.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub failure_reason: Option<FailureReason>,
    pub attempts: u32,
    pub exit_code: Option<i32>,
}

enum AttemptEnd {
    Succeeded,
    Failed {
        reason: FailureReason,
        exit_code: Option<i32>,
    },
    Canceled,
}

pub struct ExecutionCoordinator {
    artifacts: Arc<ArtifactStore>,
    cache: Arc<CacheStore>,
    events: Arc<dyn EventBus>,
    config: CoordinatorConfig,
}

impl ExecutionCoordinator {
    pub fn new(
        artifacts: Arc<ArtifactStore>,
        cache: Arc<CacheStore>,
        events: Arc<dyn EventBus>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            artifacts,
            cache,
            events,
            config,
        }
    }

    /// Drive a job to a terminal status on the claimed runner, retrying
    /// per its retry policy. Cancellation is observed between polls and
    /// wins over retry.
    pub async fn execute(
        &self,
        pipeline_id: PipelineId,
        job: &Job,
        claim: &Claim,
        cancel: watch::Receiver<bool>,
    ) -> JobOutcome {
        let mut attempts = job.attempts;
        loop {
            attempts += 1;
            debug!(pipeline = %pipeline_id, job = %job.name, attempt = attempts, "starting attempt");

            match self
                .run_attempt(pipeline_id, job, claim, &cancel, attempts)
                .await
            {
                AttemptEnd::Succeeded => {
                    return JobOutcome {
                        status: JobStatus::Success,
                        failure_reason: None,
                        attempts,
                        exit_code: None,
                    };
                }
                AttemptEnd::Canceled => {
                    return JobOutcome {
                        status: JobStatus::Canceled,
                        failure_reason: Some(FailureReason::Canceled),
                        attempts,
                        exit_code: None,
                    };
                }
                AttemptEnd::Failed { reason, exit_code } => {
                    if job.retry.should_retry(reason, attempts) {
                        info!(
                            job = %job.name,
                            ?reason,
                            attempt = attempts,
                            max = job.retry.max,
                            "attempt failed, retrying"
                        );
                        continue;
                    }
                    return JobOutcome {
                        status: JobStatus::Failed,
                        failure_reason: Some(reason),
                        attempts,
                        exit_code,
                    };
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        pipeline_id: PipelineId,
        job: &Job,
        claim: &Claim,
        cancel: &watch::Receiver<bool>,
        attempt: u32,
    ) -> AttemptEnd {
        let cache_archive = match &job.cache {
            Some(spec) if spec.policy.pulls() => self.pull_cache(spec).await,
            _ => None,
        };

        let artifacts = match self.artifacts.fetch_for(pipeline_id, &job.needs).await {
            Ok(archives) => archives,
            Err(err) => {
                warn!(job = %job.name, %err, "artifact staging failed, continuing without");
                HashMap::new()
            }
        };

        let request = DispatchRequest {
            pipeline_id,
            job: job.name.clone(),
            script: job.script.clone(),
            variables: job.variables.clone(),
            executor: claim.executor,
            attempt,
            cache_archive,
            artifacts,
        };

        let dispatch = match claim.agent.dispatch(request).await {
            Ok(dispatch) => dispatch,
            Err(err) => {
                warn!(job = %job.name, %err, "dispatch failed");
                return AttemptEnd::Failed {
                    reason: FailureReason::RunnerSystemFailure,
                    exit_code: None,
                };
            }
        };

        let deadline = Instant::now() + Duration::from_secs(job.timeout_seconds);
        let end = loop {
            if *cancel.borrow() {
                let _ = claim.agent.cancel(dispatch).await;
                self.await_cancel_ack(&claim.agent, dispatch).await;
                break AttemptEnd::Canceled;
            }

            match claim.agent.status(dispatch).await {
                Err(err) => {
                    warn!(job = %job.name, %err, "status poll failed");
                    break AttemptEnd::Failed {
                        reason: FailureReason::RunnerSystemFailure,
                        exit_code: None,
                    };
                }
                Ok(DispatchStatus::Running) => {
                    if Instant::now() >= deadline {
                        warn!(job = %job.name, timeout_seconds = job.timeout_seconds, "timeout exceeded");
                        let _ = claim.agent.cancel(dispatch).await;
                        break AttemptEnd::Failed {
                            reason: FailureReason::Timeout,
                            exit_code: None,
                        };
                    }
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Ok(DispatchStatus::Succeeded) => {
                    self.upload_artifacts(pipeline_id, job, &claim.agent, dispatch)
                        .await;
                    self.push_cache(job, &claim.agent, dispatch).await;
                    break AttemptEnd::Succeeded;
                }
                Ok(DispatchStatus::Failed { exit_code }) => {
                    break AttemptEnd::Failed {
                        reason: FailureReason::ScriptFailure,
                        exit_code: Some(exit_code),
                    };
                }
                Ok(DispatchStatus::SystemFailure { message }) => {
                    warn!(job = %job.name, message, "runner system failure");
                    break AttemptEnd::Failed {
                        reason: FailureReason::RunnerSystemFailure,
                        exit_code: None,
                    };
                }
                Ok(DispatchStatus::Canceled) => break AttemptEnd::Canceled,
            }
        };

        // `when: always` artifacts are uploaded even from failed attempts.
        if let AttemptEnd::Failed { .. } = end {
            if job
                .artifacts
                .as_ref()
                .is_some_and(|spec| spec.when == ArtifactWhen::Always)
            {
                self.upload_artifacts(pipeline_id, job, &claim.agent, dispatch)
                    .await;
            }
        }
        end
    }

    async fn await_cancel_ack(&self, agent: &Arc<dyn RunnerAgent>, dispatch: DispatchId) {
        let deadline = Instant::now() + self.config.cancel_grace;
        while Instant::now() < deadline {
            match agent.status(dispatch).await {
                Ok(status) if status.is_terminal() => return,
                Ok(_) => tokio::time::sleep(self.config.poll_interval).await,
                Err(_) => return,
            }
        }
        warn!("runner did not acknowledge cancellation within grace period");
    }

    async fn pull_cache(&self, spec: &CacheSpec) -> Option<Vec<u8>> {
        match self.cache.pull(&spec.key, &spec.fallback_keys).await {
            Ok(Some(hit)) => {
                let _ = self
                    .events
                    .publish(Event::CacheHit(CacheHitPayload {
                        key: spec.key.clone(),
                        matched_key: hit.key,
                    }))
                    .await;
                Some(hit.archive)
            }
            Ok(None) => {
                let _ = self
                    .events
                    .publish(Event::CacheMiss(CacheMissPayload {
                        key: spec.key.clone(),
                    }))
                    .await;
                None
            }
            Err(err) => {
                warn!(key = spec.key, %err, "cache pull failed, continuing without");
                None
            }
        }
    }

    async fn push_cache(&self, job: &Job, agent: &Arc<dyn RunnerAgent>, dispatch: DispatchId) {
        let Some(spec) = job.cache.as_ref().filter(|s| s.policy.pushes()) else {
            return;
        };
        let archive = match agent.collect(dispatch, &spec.paths).await {
            Ok(archive) => archive,
            Err(err) => {
                warn!(job = %job.name, %err, "cache collection failed");
                return;
            }
        };
        match self.cache.push(&spec.key, archive, None).await {
            Ok(meta) => {
                let _ = self
                    .events
                    .publish(Event::CachePushed(CachePushedPayload {
                        key: spec.key.clone(),
                        size_bytes: meta.size_bytes,
                    }))
                    .await;
            }
            Err(err) => warn!(key = spec.key, %err, "cache push failed"),
        }
    }

    async fn upload_artifacts(
        &self,
        pipeline_id: PipelineId,
        job: &Job,
        agent: &Arc<dyn RunnerAgent>,
        dispatch: DispatchId,
    ) {
        let Some(spec) = &job.artifacts else { return };
        let archive = match agent.collect(dispatch, &spec.paths).await {
            Ok(archive) => archive,
            Err(err) => {
                warn!(job = %job.name, %err, "artifact collection failed");
                return;
            }
        };
        match self
            .artifacts
            .store(pipeline_id, &job.name, archive, spec.expire_in_seconds)
            .await
        {
            Ok(meta) => {
                let _ = self
                    .events
                    .publish(Event::ArtifactStored(ArtifactStoredPayload {
                        pipeline_id,
                        job: job.name.clone(),
                        artifact_id: ArtifactId::new(),
                        size_bytes: meta.size_bytes,
                    }))
                    .await;
            }
            Err(err) => warn!(job = %job.name, %err, "artifact store failed"),
        }
    }
}
