//! Readiness propagation over the job DAG.
//!
//! `settle` is the single place job statuses advance without a runner:
//! it cascades skips away from permanently blocked jobs and promotes
//! blocked jobs whose dependencies have all completed. `ready_jobs` then
//! selects what to dispatch, in declaration order, under the parallelism
//! cap.

use crate::dag::JobDag;
use gantry_core::ids::JobName;
use gantry_core::job::JobStatus;
use gantry_core::pipeline::Pipeline;
use gantry_core::Result;
use std::collections::{HashSet, VecDeque};
use tracing::debug;

/// A job selected for dispatch.
#[derive(Debug, Clone)]
pub struct ReadyJob {
    pub name: JobName,
    pub index: usize,
}

/// Advance every job status that can be decided without running anything.
///
/// Two passes, repeated to a fixed point by construction of the BFS:
/// first, every non-terminal dependent reachable from a blocking job is
/// skipped, so a hard failure fails exactly its downstream cone. Then any
/// blocked job whose direct dependencies are all terminal and satisfying
/// becomes pending. Jobs skipped by rule evaluation never block, so their
/// dependents still run.
pub fn settle(pipeline: &mut Pipeline, dag: &JobDag) -> Result<()> {
    cascade_skips(pipeline, dag)?;

    let mut promote = Vec::new();
    for job in &pipeline.jobs {
        if job.status != JobStatus::Blocked {
            continue;
        }
        let deps = dag.dependencies(job.name.as_str());
        let satisfied = deps.iter().all(|dep| {
            pipeline
                .job(dep.as_str())
                .is_some_and(|d| d.satisfies_dependents())
        });
        if satisfied {
            promote.push(job.name.clone());
        }
    }

    for name in promote {
        debug!(job = %name, "dependencies satisfied, job pending");
        if let Some(job) = pipeline.job_mut(name.as_str()) {
            job.transition(JobStatus::Pending)?;
        }
    }
    Ok(())
}

/// Skip every non-terminal transitive dependent of a permanently blocking
/// job. Terminal jobs (including manual-gated ones already canceled) are
/// left alone; `Manual` and `Running` jobs are not skipped either, only
/// jobs still waiting on their dependencies.
fn cascade_skips(pipeline: &mut Pipeline, dag: &JobDag) -> Result<()> {
    let mut queue: VecDeque<JobName> = pipeline
        .jobs
        .iter()
        .filter(|j| j.blocks_dependents())
        .map(|j| j.name.clone())
        .collect();
    let mut seen: HashSet<JobName> = queue.iter().cloned().collect();

    while let Some(name) = queue.pop_front() {
        for dependent in dag.dependents(name.as_str()) {
            if !seen.insert(dependent.clone()) {
                continue;
            }
            if let Some(job) = pipeline.job_mut(dependent.as_str()) {
                if matches!(job.status, JobStatus::Blocked | JobStatus::Manual) {
                    debug!(job = %dependent, upstream = %name, "skipping dependent of blocked job");
                    job.transition(JobStatus::Skipped)?;
                }
            }
            queue.push_back(dependent);
        }
    }
    Ok(())
}

/// Pending jobs eligible for dispatch right now, oldest declaration first,
/// capped so running plus selected never exceeds `max_parallel`.
pub fn ready_jobs(pipeline: &Pipeline) -> Vec<ReadyJob> {
    let mut ready: Vec<ReadyJob> = pipeline
        .jobs
        .iter()
        .filter(|j| j.status == JobStatus::Pending)
        .map(|j| ReadyJob {
            name: j.name.clone(),
            index: j.index,
        })
        .collect();
    ready.sort_by_key(|r| r.index);

    if let Some(cap) = pipeline.max_parallel {
        let budget = cap.saturating_sub(pipeline.running_count());
        ready.truncate(budget);
    }
    ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_pipeline, needs_job, stage_job};
    use gantry_core::error::FailureReason;

    #[test]
    fn test_first_stage_becomes_pending() {
        let mut pipeline = make_pipeline(vec![
            stage_job("compile", "build"),
            stage_job("unit", "test"),
        ]);
        let dag = JobDag::build(&pipeline).unwrap();
        settle(&mut pipeline, &dag).unwrap();

        assert_eq!(pipeline.job("compile").unwrap().status, JobStatus::Pending);
        assert_eq!(pipeline.job("unit").unwrap().status, JobStatus::Blocked);
    }

    #[test]
    fn test_success_unblocks_dependents() {
        let mut pipeline = make_pipeline(vec![
            stage_job("compile", "build"),
            stage_job("unit", "test"),
        ]);
        let dag = JobDag::build(&pipeline).unwrap();
        settle(&mut pipeline, &dag).unwrap();

        let compile = pipeline.job_mut("compile").unwrap();
        compile.transition(JobStatus::Running).unwrap();
        compile.transition(JobStatus::Success).unwrap();
        settle(&mut pipeline, &dag).unwrap();

        assert_eq!(pipeline.job("unit").unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn test_failure_skips_downstream_cone() {
        let mut pipeline = make_pipeline(vec![
            stage_job("compile", "build"),
            stage_job("unit", "test"),
            stage_job("publish", "deploy"),
        ]);
        let dag = JobDag::build(&pipeline).unwrap();
        settle(&mut pipeline, &dag).unwrap();

        let compile = pipeline.job_mut("compile").unwrap();
        compile.transition(JobStatus::Running).unwrap();
        compile.fail(FailureReason::ScriptFailure, Some(1)).unwrap();
        settle(&mut pipeline, &dag).unwrap();

        assert_eq!(pipeline.job("unit").unwrap().status, JobStatus::Skipped);
        assert_eq!(pipeline.job("publish").unwrap().status, JobStatus::Skipped);
    }

    #[test]
    fn test_skip_does_not_leak_through_transitively() {
        // b is skipped because a failed; c must not run even though a
        // skipped dependency normally satisfies dependents.
        let mut pipeline = make_pipeline(vec![
            needs_job("a", "build", &[]),
            needs_job("b", "build", &["a"]),
            needs_job("c", "build", &["b"]),
        ]);
        let dag = JobDag::build(&pipeline).unwrap();
        settle(&mut pipeline, &dag).unwrap();

        let a = pipeline.job_mut("a").unwrap();
        a.transition(JobStatus::Running).unwrap();
        a.fail(FailureReason::ScriptFailure, Some(1)).unwrap();
        settle(&mut pipeline, &dag).unwrap();

        assert_eq!(pipeline.job("b").unwrap().status, JobStatus::Skipped);
        assert_eq!(pipeline.job("c").unwrap().status, JobStatus::Skipped);
    }

    #[test]
    fn test_rule_skipped_dependency_satisfies() {
        let mut pipeline = make_pipeline(vec![
            needs_job("lint", "build", &[]),
            needs_job("unit", "test", &["lint"]),
        ]);
        pipeline.job_mut("lint").unwrap().status = JobStatus::Skipped;
        let dag = JobDag::build(&pipeline).unwrap();
        settle(&mut pipeline, &dag).unwrap();

        assert_eq!(pipeline.job("unit").unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn test_allow_failure_satisfies_dependents() {
        let mut pipeline = make_pipeline(vec![
            stage_job("flaky", "build"),
            stage_job("unit", "test"),
        ]);
        pipeline.job_mut("flaky").unwrap().allow_failure = true;
        let dag = JobDag::build(&pipeline).unwrap();
        settle(&mut pipeline, &dag).unwrap();

        let flaky = pipeline.job_mut("flaky").unwrap();
        flaky.transition(JobStatus::Running).unwrap();
        flaky.fail(FailureReason::ScriptFailure, Some(1)).unwrap();
        settle(&mut pipeline, &dag).unwrap();

        assert_eq!(pipeline.job("unit").unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn test_manual_gate_holds_dependents() {
        let mut pipeline = make_pipeline(vec![
            stage_job("approve", "build"),
            stage_job("publish", "deploy"),
        ]);
        pipeline.job_mut("approve").unwrap().status = JobStatus::Manual;
        let dag = JobDag::build(&pipeline).unwrap();
        settle(&mut pipeline, &dag).unwrap();

        assert_eq!(pipeline.job("approve").unwrap().status, JobStatus::Manual);
        assert_eq!(pipeline.job("publish").unwrap().status, JobStatus::Blocked);
    }

    #[test]
    fn test_ready_jobs_declaration_order_and_cap() {
        let mut pipeline = make_pipeline(vec![
            stage_job("a", "build"),
            stage_job("b", "build"),
            stage_job("c", "build"),
        ]);
        pipeline.max_parallel = Some(2);
        let dag = JobDag::build(&pipeline).unwrap();
        settle(&mut pipeline, &dag).unwrap();

        let ready = ready_jobs(&pipeline);
        let names: Vec<&str> = ready.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_ready_cap_accounts_for_running() {
        let mut pipeline = make_pipeline(vec![
            stage_job("a", "build"),
            stage_job("b", "build"),
        ]);
        pipeline.max_parallel = Some(1);
        let dag = JobDag::build(&pipeline).unwrap();
        settle(&mut pipeline, &dag).unwrap();

        pipeline
            .job_mut("a")
            .unwrap()
            .transition(JobStatus::Running)
            .unwrap();
        assert!(ready_jobs(&pipeline).is_empty());
    }
}
