//! Pipeline engine: creation, scheduling loop, manual gates, cancellation.
//!
//! `create_pipeline` turns a normalized configuration plus a trigger into a
//! registered pipeline with every job's variables resolved and rules
//! evaluated. `run` then drives the pipeline until nothing is actionable:
//! it dispatches ready jobs onto claimed runners, applies completions as
//! they arrive, and settles the DAG after every state change.

use crate::coordinator::{CoordinatorConfig, ExecutionCoordinator, JobOutcome};
use crate::dag::JobDag;
use crate::runners::RunnerPool;
use crate::scheduler::{ready_jobs, settle};
use chrono::Utc;
use gantry_core::config::{JobConfig, PipelineConfig};
use gantry_core::error::FailureReason;
use gantry_core::events::{
    Event, JobCompletedPayload, JobStartedPayload, PipelineCompletedPayload,
    PipelineCreatedPayload,
};
use gantry_core::ids::{JobName, PipelineId, RunnerId};
use gantry_core::job::{Job, JobStatus, Need};
use gantry_core::pipeline::{Pipeline, PipelineStatus};
use gantry_core::ports::{EventBus, SecretProvider, VcsProvider};
use gantry_core::rules::{self, PipelineContext, RuleAction, TriggerSource};
use gantry_core::variables::{interpolate, VariableScopes};
use gantry_core::{Error, Result};
use gantry_store::{ArtifactStore, CacheStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Poll interval for dispatched jobs.
    pub poll_interval: Duration,
    /// How long the scheduling loop waits for a completion before checking
    /// whether pending jobs are schedulable at all.
    pub scheduling_timeout: Duration,
    /// Grace period for runners to acknowledge cancellation.
    pub cancel_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            scheduling_timeout: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(5),
        }
    }
}

/// What kicked off the pipeline.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub ref_name: String,
    pub source: TriggerSource,
    /// Trigger-supplied variables; they override pipeline-level variables
    /// but not job- or rule-level ones.
    pub variables: HashMap<String, String>,
}

struct PipelineEntry {
    pipeline: Pipeline,
    /// `None` when DAG construction failed; the pipeline is terminal and
    /// nothing ever runs.
    dag: Option<JobDag>,
    cancel_txs: HashMap<JobName, watch::Sender<bool>>,
}

struct JobCompletion {
    job: JobName,
    runner_id: RunnerId,
    outcome: JobOutcome,
}

pub struct Engine {
    pipelines: RwLock<HashMap<PipelineId, PipelineEntry>>,
    pool: Arc<RunnerPool>,
    vcs: Arc<dyn VcsProvider>,
    secrets: Arc<dyn SecretProvider>,
    events: Arc<dyn EventBus>,
    coordinator: Arc<ExecutionCoordinator>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        pool: Arc<RunnerPool>,
        vcs: Arc<dyn VcsProvider>,
        secrets: Arc<dyn SecretProvider>,
        events: Arc<dyn EventBus>,
        artifacts: Arc<ArtifactStore>,
        cache: Arc<CacheStore>,
        config: EngineConfig,
    ) -> Self {
        let coordinator = Arc::new(ExecutionCoordinator::new(
            artifacts,
            cache,
            Arc::clone(&events),
            CoordinatorConfig {
                poll_interval: config.poll_interval,
                cancel_grace: config.cancel_grace,
            },
        ));
        Self {
            pipelines: RwLock::new(HashMap::new()),
            pool,
            vcs,
            secrets,
            events,
            coordinator,
            config,
        }
    }

    /// Create and register a pipeline from configuration and a trigger.
    ///
    /// Rules are evaluated here, once; a job's activation never changes
    /// after creation. A dependency cycle still registers the pipeline, as
    /// failed with no job ever run, and surfaces the graph error to the
    /// caller.
    pub async fn create_pipeline(
        &self,
        mut config: PipelineConfig,
        trigger: TriggerRequest,
    ) -> Result<PipelineId> {
        config.normalize()?;

        let meta = self.vcs.ref_meta(&trigger.ref_name).await?;
        let changed_paths = match self.vcs.changed_paths(&trigger.ref_name, &meta.sha).await {
            Ok(paths) => paths,
            Err(err) => {
                warn!(%err, "change detection unavailable, changes rules will match");
                None
            }
        };
        let ctx = PipelineContext {
            ref_name: trigger.ref_name.clone(),
            sha: meta.sha.clone(),
            is_tag: meta.is_tag,
            protected: meta.protected,
            source: trigger.source,
            changed_paths,
        };
        let secrets = self
            .secrets
            .variables_for(&trigger.ref_name, meta.protected)
            .await?;

        let pipeline_id = PipelineId::new();
        let mut jobs = Vec::with_capacity(config.jobs.len());
        for (index, job_config) in config.jobs.iter().enumerate() {
            jobs.push(build_job(
                pipeline_id,
                &config,
                job_config,
                index,
                &ctx,
                &secrets,
                &trigger.variables,
            )?);
        }

        let mut pipeline = Pipeline {
            id: pipeline_id,
            ref_name: trigger.ref_name,
            sha: meta.sha,
            source: trigger.source,
            stages: config.stages.clone(),
            jobs,
            status: PipelineStatus::Created,
            max_parallel: config.max_parallel,
            canceled: false,
            environments: HashMap::new(),
            created_at: Utc::now(),
            finished_at: None,
        };

        let created = Event::PipelineCreated(PipelineCreatedPayload {
            pipeline_id,
            ref_name: pipeline.ref_name.clone(),
            sha: pipeline.sha.clone(),
            job_count: pipeline.jobs.len(),
            created_at: pipeline.created_at,
        });

        let dag = match JobDag::build(&pipeline) {
            Ok(dag) => dag,
            Err(err) => {
                warn!(pipeline = %pipeline_id, %err, "dependency graph rejected");
                pipeline.status = PipelineStatus::Failed;
                pipeline.finished_at = Some(Utc::now());
                self.pipelines.write().await.insert(
                    pipeline_id,
                    PipelineEntry {
                        pipeline,
                        dag: None,
                        cancel_txs: HashMap::new(),
                    },
                );
                self.events.publish(created).await?;
                return Err(err);
            }
        };

        settle(&mut pipeline, &dag)?;
        info!(
            pipeline = %pipeline_id,
            ref_name = %pipeline.ref_name,
            jobs = pipeline.jobs.len(),
            "pipeline created"
        );
        self.pipelines.write().await.insert(
            pipeline_id,
            PipelineEntry {
                pipeline,
                dag: Some(dag),
                cancel_txs: HashMap::new(),
            },
        );
        self.events.publish(created).await?;
        Ok(pipeline_id)
    }

    /// Drive the pipeline until it reaches a terminal status or pauses on a
    /// manual gate. Returns the status at that point; after `play`, call
    /// `run` again to resume.
    pub async fn run(&self, id: PipelineId) -> Result<PipelineStatus> {
        {
            let guard = self.pipelines.read().await;
            let entry = guard.get(&id).ok_or_else(|| Error::PipelineNotFound(id.to_string()))?;
            // Terminal pipelines are immutable; completion was already
            // published.
            if entry.pipeline.status.is_terminal() {
                return Ok(entry.pipeline.status);
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<JobCompletion>();

        let status = loop {
            let (status, running) = {
                let mut guard = self.pipelines.write().await;
                let entry = guard.get_mut(&id).ok_or_else(|| Error::PipelineNotFound(id.to_string()))?;
                if entry.dag.is_none() {
                    return Ok(PipelineStatus::Failed);
                }
                self.dispatch_ready(id, entry, &tx).await?;
                let status = entry.pipeline.derive_status();
                entry.pipeline.status = status;
                (status, entry.pipeline.running_count())
            };

            if status != PipelineStatus::Running && running == 0 {
                break status;
            }

            match tokio::time::timeout(self.config.scheduling_timeout, rx.recv()).await {
                Ok(Some(completion)) => self.apply_completion(id, completion).await?,
                // The engine holds a sender for the loop's lifetime.
                Ok(None) => break PipelineStatus::Failed,
                Err(_) => self.fail_unschedulable(id).await?,
            }
        };

        let mut guard = self.pipelines.write().await;
        let entry = guard.get_mut(&id).ok_or_else(|| Error::PipelineNotFound(id.to_string()))?;
        entry.pipeline.status = status;
        if status.is_terminal() {
            let finished_at = Utc::now();
            entry.pipeline.finished_at = Some(finished_at);
            info!(pipeline = %id, ?status, "pipeline completed");
            self.events
                .publish(Event::PipelineCompleted(PipelineCompletedPayload {
                    pipeline_id: id,
                    status,
                    finished_at,
                }))
                .await?;
        }
        Ok(status)
    }

    /// Release a manual gate. The job becomes eligible for scheduling on
    /// the next `run`.
    pub async fn play(&self, id: PipelineId, job_name: &JobName) -> Result<()> {
        let mut guard = self.pipelines.write().await;
        let entry = guard.get_mut(&id).ok_or_else(|| Error::PipelineNotFound(id.to_string()))?;
        let job = entry
            .pipeline
            .job_mut(job_name.as_str())
            .ok_or_else(|| Error::JobNotFound(job_name.to_string()))?;
        if job.status != JobStatus::Manual {
            return Err(Error::Internal(format!(
                "job {} is not awaiting a manual trigger",
                job_name
            )));
        }
        info!(pipeline = %id, job = %job_name, "manual gate released");
        job.transition(JobStatus::Blocked)?;
        if let Some(dag) = entry.dag.as_ref() {
            settle(&mut entry.pipeline, dag)?;
        }
        Ok(())
    }

    /// Cancel the pipeline: every job not yet running becomes canceled
    /// immediately, running jobs are signaled and reach canceled once their
    /// runner acknowledges.
    pub async fn cancel(&self, id: PipelineId) -> Result<()> {
        let mut guard = self.pipelines.write().await;
        let entry = guard.get_mut(&id).ok_or_else(|| Error::PipelineNotFound(id.to_string()))?;
        entry.pipeline.canceled = true;

        for job in &mut entry.pipeline.jobs {
            match job.status {
                JobStatus::Running => {
                    if let Some(cancel) = entry.cancel_txs.get(&job.name) {
                        let _ = cancel.send(true);
                    }
                }
                status if !status.is_terminal() => {
                    job.failure_reason = Some(FailureReason::Canceled);
                    job.transition(JobStatus::Canceled)?;
                }
                _ => {}
            }
        }
        entry.pipeline.status = entry.pipeline.derive_status();
        info!(pipeline = %id, "pipeline cancellation requested");
        Ok(())
    }

    /// A snapshot of the pipeline's current state.
    pub async fn pipeline(&self, id: PipelineId) -> Result<Pipeline> {
        self.pipelines
            .read()
            .await
            .get(&id)
            .map(|entry| entry.pipeline.clone())
            .ok_or_else(|| Error::PipelineNotFound(id.to_string()))
    }

    pub async fn job_status(&self, id: PipelineId, job_name: &JobName) -> Result<JobStatus> {
        let guard = self.pipelines.read().await;
        let entry = guard
            .get(&id)
            .ok_or_else(|| Error::PipelineNotFound(id.to_string()))?;
        entry
            .pipeline
            .job(job_name.as_str())
            .map(|job| job.status)
            .ok_or_else(|| Error::JobNotFound(job_name.to_string()))
    }

    async fn dispatch_ready(
        &self,
        id: PipelineId,
        entry: &mut PipelineEntry,
        tx: &mpsc::UnboundedSender<JobCompletion>,
    ) -> Result<()> {
        for ready in ready_jobs(&entry.pipeline) {
            let Some(job) = entry.pipeline.job_mut(ready.name.as_str()) else {
                continue;
            };
            let Some(claim) = self.pool.claim(&job.tags).await else {
                debug!(job = %job.name, tags = ?job.tags, "no free compatible runner");
                continue;
            };

            job.transition(JobStatus::Running)?;
            let snapshot = job.clone();
            let (cancel_tx, cancel_rx) = watch::channel(false);
            entry.cancel_txs.insert(snapshot.name.clone(), cancel_tx);

            self.events
                .publish(Event::JobStarted(JobStartedPayload {
                    pipeline_id: id,
                    job: snapshot.name.clone(),
                    runner_id: claim.runner_id,
                    attempt: snapshot.attempts + 1,
                    started_at: Utc::now(),
                }))
                .await?;

            let coordinator = Arc::clone(&self.coordinator);
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = coordinator
                    .execute(id, &snapshot, &claim, cancel_rx)
                    .await;
                let _ = tx.send(JobCompletion {
                    job: snapshot.name,
                    runner_id: claim.runner_id,
                    outcome,
                });
            });
        }
        Ok(())
    }

    async fn apply_completion(&self, id: PipelineId, completion: JobCompletion) -> Result<()> {
        self.pool.release(completion.runner_id).await;

        let mut guard = self.pipelines.write().await;
        let entry = guard.get_mut(&id).ok_or_else(|| Error::PipelineNotFound(id.to_string()))?;
        entry.cancel_txs.remove(&completion.job);

        let job = entry
            .pipeline
            .job_mut(completion.job.as_str())
            .ok_or_else(|| Error::JobNotFound(completion.job.to_string()))?;
        job.attempts = completion.outcome.attempts;
        match completion.outcome.status {
            JobStatus::Success => job.transition(JobStatus::Success)?,
            JobStatus::Canceled => {
                job.failure_reason = Some(FailureReason::Canceled);
                job.transition(JobStatus::Canceled)?;
            }
            JobStatus::Failed => {
                let reason = completion
                    .outcome
                    .failure_reason
                    .unwrap_or(FailureReason::ScriptFailure);
                job.fail(reason, completion.outcome.exit_code)?;
            }
            other => {
                return Err(Error::Internal(format!(
                    "coordinator reported non-terminal status {:?} for job {}",
                    other, completion.job
                )));
            }
        }

        let status = job.status;
        let failure_reason = job.failure_reason;
        let attempts = job.attempts;
        entry.pipeline.record_environment(&completion.job);
        if let Some(dag) = entry.dag.as_ref() {
            settle(&mut entry.pipeline, dag)?;
        }

        self.events
            .publish(Event::JobCompleted(JobCompletedPayload {
                pipeline_id: id,
                job: completion.job,
                status,
                failure_reason,
                attempts,
                finished_at: Utc::now(),
            }))
            .await?;
        Ok(())
    }

    /// Nothing completed within the scheduling window: charge an attempt to
    /// every pending job that no registered runner could ever serve, and
    /// fail it once its retry policy stops granting further windows. Pending
    /// jobs whose runners are merely busy keep waiting.
    async fn fail_unschedulable(&self, id: PipelineId) -> Result<()> {
        let mut guard = self.pipelines.write().await;
        let entry = guard.get_mut(&id).ok_or_else(|| Error::PipelineNotFound(id.to_string()))?;

        let mut doomed = Vec::new();
        for job in &entry.pipeline.jobs {
            if job.status == JobStatus::Pending && !self.pool.has_compatible(&job.tags).await {
                doomed.push(job.name.clone());
            }
        }
        for name in doomed {
            if let Some(job) = entry.pipeline.job_mut(name.as_str()) {
                job.attempts += 1;
                if job
                    .retry
                    .should_retry(FailureReason::RunnerSystemFailure, job.attempts)
                {
                    debug!(
                        pipeline = %id,
                        job = %name,
                        attempt = job.attempts,
                        "no compatible runner, waiting for another scheduling window"
                    );
                    continue;
                }
                warn!(pipeline = %id, job = %name, "no compatible runner registered");
                job.fail(FailureReason::RunnerSystemFailure, None)?;
            }
        }
        if let Some(dag) = entry.dag.as_ref() {
            settle(&mut entry.pipeline, dag)?;
        }
        Ok(())
    }
}

/// Resolve one job's variables, evaluate its rules, and produce the runtime
/// job record.
fn build_job(
    pipeline_id: PipelineId,
    config: &PipelineConfig,
    job_config: &JobConfig,
    index: usize,
    ctx: &PipelineContext,
    secrets: &HashMap<String, String>,
    trigger_variables: &HashMap<String, String>,
) -> Result<Job> {
    let stage = job_config.stage();
    let stage_index = config
        .stage_index(stage)
        .ok_or_else(|| Error::Internal(format!("stage {} vanished after validation", stage)))?;

    let mut predefined = predefined_variables(pipeline_id, ctx, &job_config.name, stage);
    predefined.extend(secrets.clone());

    let mut global = config.variables.clone();
    global.extend(trigger_variables.clone());

    let mut scopes = VariableScopes {
        predefined,
        global,
        stage: config
            .stage_variables
            .get(stage)
            .cloned()
            .unwrap_or_default(),
        job: job_config.variables.clone(),
        rule: HashMap::new(),
    };
    let mut variables = scopes.resolve()?;

    let outcome = rules::evaluate(&job_config.rules, &variables, ctx)?;
    if !outcome.variables.is_empty() {
        scopes.rule = outcome.variables.clone();
        variables = scopes.resolve()?;
    }

    let status = match outcome.action {
        RuleAction::Run => JobStatus::Blocked,
        RuleAction::Manual => JobStatus::Manual,
        RuleAction::Skip => JobStatus::Skipped,
    };

    let cache = job_config.cache.clone().map(|mut spec| {
        spec.key = interpolate(&spec.key, &variables);
        for key in &mut spec.fallback_keys {
            *key = interpolate(key, &variables);
        }
        spec
    });

    Ok(Job {
        name: JobName::new(&job_config.name),
        stage: stage.to_string(),
        stage_index,
        index,
        script: job_config.script.clone(),
        variables,
        outcome: outcome.action,
        needs: job_config
            .needs
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|n| Need {
                job: JobName::new(&n.job),
                artifacts: n.artifacts,
            })
            .collect(),
        dag_mode: job_config.needs.is_some(),
        tags: job_config.tags.clone(),
        retry: job_config.retry(),
        timeout_seconds: job_config.timeout_seconds(),
        allow_failure: outcome.allow_failure.unwrap_or(job_config.allow_failure),
        artifacts: job_config.artifacts.clone(),
        cache,
        environment: job_config.environment.clone(),
        status,
        attempts: 0,
        failure_reason: None,
        exit_code: None,
        created_at: Utc::now(),
        started_at: None,
        finished_at: None,
    })
}

fn predefined_variables(
    pipeline_id: PipelineId,
    ctx: &PipelineContext,
    job_name: &str,
    stage: &str,
) -> HashMap<String, String> {
    let mut vars = HashMap::from([
        ("CI".to_string(), "true".to_string()),
        ("CI_PIPELINE_ID".to_string(), pipeline_id.to_string()),
        ("CI_COMMIT_REF_NAME".to_string(), ctx.ref_name.clone()),
        ("CI_COMMIT_SHA".to_string(), ctx.sha.clone()),
        (
            "CI_PIPELINE_SOURCE".to_string(),
            ctx.source.as_str().to_string(),
        ),
        ("CI_JOB_NAME".to_string(), job_name.to_string()),
        ("CI_JOB_STAGE".to_string(), stage.to_string()),
    ]);
    if ctx.is_tag {
        vars.insert("CI_COMMIT_TAG".to_string(), ctx.ref_name.clone());
    }
    vars
}
