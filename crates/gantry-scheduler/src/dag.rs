//! DAG construction over a pipeline's jobs.
//!
//! By default every job depends on the completion of all jobs in earlier
//! stages (the stage barrier). A job that declares explicit `needs` replaces
//! its stage-order edges with the declared edge set, for that job only.

use gantry_core::ids::JobName;
use gantry_core::pipeline::Pipeline;
use gantry_core::{Error, Result};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// Directed acyclic graph of job dependencies. Edges point from a
/// prerequisite to its dependent.
#[derive(Debug)]
pub struct JobDag {
    graph: DiGraph<JobName, ()>,
    index: HashMap<JobName, NodeIndex>,
}

impl JobDag {
    /// Build the DAG from a pipeline's jobs, validating stage ordering for
    /// explicit `needs` and rejecting cycles with the full member list.
    pub fn build(pipeline: &Pipeline) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for job in &pipeline.jobs {
            let idx = graph.add_node(job.name.clone());
            index.insert(job.name.clone(), idx);
        }

        for job in &pipeline.jobs {
            let job_idx = index[&job.name];

            if job.dag_mode {
                for need in &job.needs {
                    let dep = pipeline.job(need.job.as_str()).ok_or_else(|| {
                        Error::Configuration(format!(
                            "job {} needs unknown job {}",
                            job.name, need.job
                        ))
                    })?;
                    if dep.stage_index > job.stage_index {
                        return Err(Error::Configuration(format!(
                            "job {} needs {} from a later stage",
                            job.name, need.job
                        )));
                    }
                    let dep_idx = index[&need.job];
                    graph.add_edge(dep_idx, job_idx, ());
                }
            } else {
                // Stage barrier: depend on every job of every earlier stage.
                for dep in &pipeline.jobs {
                    if dep.stage_index < job.stage_index {
                        graph.add_edge(index[&dep.name], job_idx, ());
                    }
                }
            }
        }

        let dag = Self { graph, index };
        dag.check_acyclic()?;
        Ok(dag)
    }

    fn check_acyclic(&self) -> Result<()> {
        // Self-loops first: tarjan reports them as singleton components.
        for idx in self.graph.node_indices() {
            if self.graph.contains_edge(idx, idx) {
                return Err(Error::Graph {
                    members: vec![self.graph[idx].to_string()],
                });
            }
        }

        for component in tarjan_scc(&self.graph) {
            if component.len() > 1 {
                let mut members: Vec<String> = component
                    .iter()
                    .map(|&idx| self.graph[idx].to_string())
                    .collect();
                members.sort();
                return Err(Error::Graph { members });
            }
        }
        Ok(())
    }

    /// Direct prerequisites of a job.
    pub fn dependencies(&self, job: &str) -> Vec<JobName> {
        self.index
            .get(job)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, petgraph::Direction::Incoming)
                    .map(|n| self.graph[n].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Jobs that directly depend on the given job.
    pub fn dependents(&self, job: &str) -> Vec<JobName> {
        self.index
            .get(job)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, petgraph::Direction::Outgoing)
                    .map(|n| self.graph[n].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A topological order over all jobs. The graph was validated acyclic
    /// at build time.
    pub fn topological_order(&self) -> Vec<JobName> {
        toposort(&self.graph, None)
            .map(|indices| indices.iter().map(|&idx| self.graph[idx].clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_pipeline, needs_job, stage_job};
    use gantry_core::Error;

    #[test]
    fn test_stage_barrier_edges() {
        let pipeline = make_pipeline(vec![
            stage_job("compile", "build"),
            stage_job("unit", "test"),
            stage_job("integration", "test"),
            stage_job("publish", "deploy"),
        ]);
        let dag = JobDag::build(&pipeline).unwrap();

        assert!(dag.dependencies("compile").is_empty());
        assert_eq!(dag.dependencies("unit"), vec![JobName::new("compile")]);
        // publish waits on every earlier job
        let mut deps: Vec<String> = dag
            .dependencies("publish")
            .iter()
            .map(|n| n.to_string())
            .collect();
        deps.sort();
        assert_eq!(deps, vec!["compile", "integration", "unit"]);
    }

    #[test]
    fn test_explicit_needs_replace_stage_edges() {
        let pipeline = make_pipeline(vec![
            stage_job("compile", "build"),
            stage_job("docs", "build"),
            needs_job("unit", "test", &["compile"]),
        ]);
        let dag = JobDag::build(&pipeline).unwrap();

        // DAG mode: unit depends on compile only, not docs
        assert_eq!(dag.dependencies("unit"), vec![JobName::new("compile")]);
    }

    #[test]
    fn test_empty_needs_detaches_job() {
        let pipeline = make_pipeline(vec![
            stage_job("compile", "build"),
            needs_job("smoke", "deploy", &[]),
        ]);
        let dag = JobDag::build(&pipeline).unwrap();
        assert!(dag.dependencies("smoke").is_empty());
    }

    #[test]
    fn test_needs_from_later_stage_rejected() {
        let pipeline = make_pipeline(vec![
            needs_job("compile", "build", &["publish"]),
            stage_job("publish", "deploy"),
        ]);
        let err = JobDag::build(&pipeline).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_cycle_reports_all_members() {
        let pipeline = make_pipeline(vec![
            needs_job("a", "build", &["c"]),
            needs_job("b", "build", &["a"]),
            needs_job("c", "build", &["b"]),
        ]);
        match JobDag::build(&pipeline).unwrap_err() {
            Error::Graph { members } => {
                assert_eq!(members, vec!["a", "b", "c"]);
            }
            other => panic!("expected Graph error, got {:?}", other),
        }
    }

    #[test]
    fn test_self_need_is_a_cycle() {
        let pipeline = make_pipeline(vec![needs_job("a", "build", &["a"])]);
        match JobDag::build(&pipeline).unwrap_err() {
            Error::Graph { members } => assert_eq!(members, vec!["a"]),
            other => panic!("expected Graph error, got {:?}", other),
        }
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let pipeline = make_pipeline(vec![
            stage_job("compile", "build"),
            stage_job("unit", "test"),
            stage_job("publish", "deploy"),
        ]);
        let dag = JobDag::build(&pipeline).unwrap();
        let order: Vec<String> = dag
            .topological_order()
            .iter()
            .map(|n| n.to_string())
            .collect();
        assert_eq!(order, vec!["compile", "unit", "publish"]);
    }
}
