//! Pipeline configuration model.
//!
//! These types are the contract with the external configuration loader:
//! parsing, `include` resolution, and merge-key expansion happen there, and
//! the loader hands the engine a tree of these structs. `normalize()` then
//! applies template inheritance, translates legacy `only`/`except` filters
//! into rules, and validates cross-references before a pipeline is created.

use crate::error::{Error, FailureReason, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_stages")]
    pub stages: Vec<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    /// Per-stage variable overrides, keyed by stage name.
    #[serde(default)]
    pub stage_variables: HashMap<String, HashMap<String, String>>,
    /// Template overlaid beneath every job at normalization time.
    #[serde(default)]
    pub default: Option<JobTemplate>,
    pub jobs: Vec<JobConfig>,
    /// Upper bound on concurrently running jobs in one pipeline.
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

fn default_stages() -> Vec<String> {
    vec!["build".to_string(), "test".to_string(), "deploy".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    /// Stage this job belongs to. `None` means the job declared nothing and
    /// takes the template's stage, or `test` when there is no template.
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub script: Vec<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    /// Legacy ref filter: job runs only on matching refs. Mutually exclusive
    /// with `rules`; translated into an implicit rule at normalization.
    #[serde(default)]
    pub only: Option<Vec<String>>,
    /// Legacy ref filter: job never runs on matching refs.
    #[serde(default)]
    pub except: Option<Vec<String>>,
    /// Explicit dependency edges. `None` means stage ordering applies;
    /// `Some` (even empty) switches this job to DAG mode.
    #[serde(default)]
    pub needs: Option<Vec<NeedConfig>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub allow_failure: bool,
    /// Job-level activation used when no rules are declared.
    #[serde(default)]
    pub when: Option<When>,
    #[serde(default)]
    pub artifacts: Option<ArtifactSpec>,
    #[serde(default)]
    pub cache: Option<CacheSpec>,
    #[serde(default)]
    pub environment: Option<EnvironmentSpec>,
}

const DEFAULT_STAGE: &str = "test";
const DEFAULT_TIMEOUT_SECONDS: u64 = 3600;

/// Partial job descriptor. Concrete jobs are produced by overlaying their
/// declared fields onto the template, once, at normalization time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobTemplate {
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub script: Vec<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub artifacts: Option<ArtifactSpec>,
    #[serde(default)]
    pub cache: Option<CacheSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Typed predicate expression, e.g. `$CI_COMMIT_REF_NAME == "main"`.
    #[serde(rename = "if", default)]
    pub if_expr: Option<String>,
    /// Glob patterns matched against the pipeline's changed-file set.
    #[serde(default)]
    pub changes: Vec<String>,
    #[serde(default)]
    pub when: Option<When>,
    /// Variables injected into the job when this rule matches.
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub allow_failure: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum When {
    OnSuccess,
    Manual,
    Always,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeedConfig {
    pub job: String,
    /// Whether the upstream job's artifacts are visible to this job.
    #[serde(default)]
    pub artifacts: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max: u32,
    /// Failure reasons that trigger a retry. Script failures are not
    /// retried unless listed explicitly.
    #[serde(default = "default_retry_when")]
    pub when: Vec<FailureReason>,
}

fn default_retry_when() -> Vec<FailureReason> {
    vec![FailureReason::RunnerSystemFailure]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max: 0,
            when: default_retry_when(),
        }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, reason: FailureReason, attempts_made: u32) -> bool {
        reason.is_retryable() && attempts_made <= self.max && self.when.contains(&reason)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub paths: Vec<String>,
    #[serde(default)]
    pub expire_in_seconds: Option<u64>,
    #[serde(default)]
    pub when: ArtifactWhen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactWhen {
    #[default]
    OnSuccess,
    Always,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSpec {
    /// Resolved cache key; may reference variables before resolution.
    pub key: String,
    /// Ordered fallback keys tried after an exact-key miss.
    #[serde(default)]
    pub fallback_keys: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub policy: CachePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CachePolicy {
    #[serde(rename = "pull")]
    Pull,
    #[serde(rename = "push")]
    Push,
    #[default]
    #[serde(rename = "pull-push")]
    PullPush,
}

impl CachePolicy {
    pub fn pulls(&self) -> bool {
        matches!(self, CachePolicy::Pull | CachePolicy::PullPush)
    }

    pub fn pushes(&self) -> bool {
        matches!(self, CachePolicy::Push | CachePolicy::PullPush)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    pub name: String,
    #[serde(default)]
    pub action: EnvironmentAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentAction {
    #[default]
    Start,
    Stop,
}

impl JobConfig {
    /// Stage after defaulting. Call after `normalize()` has applied the
    /// template overlay.
    pub fn stage(&self) -> &str {
        self.stage.as_deref().unwrap_or(DEFAULT_STAGE)
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS)
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_default()
    }

    /// Overlay template fields beneath this job's declared fields. A declared
    /// field always wins, even when it spells out the default value; template
    /// variables sit under job variables.
    pub fn apply_template(&mut self, template: &JobTemplate) {
        if self.stage.is_none() {
            self.stage = template.stage.clone();
        }
        if self.script.is_empty() {
            self.script = template.script.clone();
        }
        for (k, v) in &template.variables {
            self.variables.entry(k.clone()).or_insert_with(|| v.clone());
        }
        if self.tags.is_empty() {
            self.tags = template.tags.clone();
        }
        if self.retry.is_none() {
            self.retry = template.retry.clone();
        }
        if self.timeout_seconds.is_none() {
            self.timeout_seconds = template.timeout_seconds;
        }
        if self.artifacts.is_none() {
            self.artifacts = template.artifacts.clone();
        }
        if self.cache.is_none() {
            self.cache = template.cache.clone();
        }
    }
}

impl PipelineConfig {
    /// Ordinal position of a stage in the declared order.
    pub fn stage_index(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }

    /// Apply template inheritance, translate legacy filters into rules, and
    /// validate cross-references. Must run before pipeline creation; all
    /// problems surface as `Error::Configuration`.
    pub fn normalize(&mut self) -> Result<()> {
        if self.stages.is_empty() {
            self.stages = default_stages();
        }
        if self.jobs.is_empty() {
            return Err(Error::Configuration("pipeline has no jobs".to_string()));
        }

        let template = self.default.clone();
        let mut seen = HashSet::new();
        let names: HashSet<String> = self.jobs.iter().map(|j| j.name.clone()).collect();

        for job in &mut self.jobs {
            if !seen.insert(job.name.clone()) {
                return Err(Error::Configuration(format!(
                    "duplicate job name: {}",
                    job.name
                )));
            }

            if let Some(ref template) = template {
                job.apply_template(template);
            }

            if job.script.is_empty() {
                return Err(Error::Configuration(format!(
                    "job {} has no script",
                    job.name
                )));
            }

            if !self.stages.iter().any(|s| s.as_str() == job.stage()) {
                return Err(Error::Configuration(format!(
                    "job {} references unknown stage {}",
                    job.name,
                    job.stage()
                )));
            }

            if let Some(needs) = &job.needs {
                for need in needs {
                    if !names.contains(&need.job) {
                        return Err(Error::Configuration(format!(
                            "job {} needs unknown job {}",
                            job.name, need.job
                        )));
                    }
                }
            }

            translate_legacy_filters(job)?;
        }

        Ok(())
    }
}

/// Translate `only`/`except` into an implicit rule list. Mixing the legacy
/// filters with `rules` on one job is a configuration error.
fn translate_legacy_filters(job: &mut JobConfig) -> Result<()> {
    let has_legacy = job.only.is_some() || job.except.is_some();
    if has_legacy && !job.rules.is_empty() {
        return Err(Error::Configuration(format!(
            "job {} mixes rules with only/except",
            job.name
        )));
    }

    if has_legacy {
        if let Some(except) = job.except.take() {
            job.rules.push(RuleConfig {
                if_expr: Some(ref_membership_expr(&except)),
                changes: vec![],
                when: Some(When::Never),
                variables: HashMap::new(),
                allow_failure: None,
            });
        }
        if let Some(only) = job.only.take() {
            job.rules.push(RuleConfig {
                if_expr: Some(ref_membership_expr(&only)),
                changes: vec![],
                when: Some(When::OnSuccess),
                variables: HashMap::new(),
                allow_failure: None,
            });
        } else {
            // except-only jobs fall through to run on anything not excluded
            job.rules.push(RuleConfig {
                if_expr: None,
                changes: vec![],
                when: Some(When::OnSuccess),
                variables: HashMap::new(),
                allow_failure: None,
            });
        }
        return Ok(());
    }

    if job.rules.is_empty() {
        // No activation config at all: the job runs unconditionally, or per
        // its job-level `when`.
        job.rules.push(RuleConfig {
            if_expr: None,
            changes: vec![],
            when: job.when,
            variables: HashMap::new(),
            allow_failure: None,
        });
    }

    Ok(())
}

/// Build a set-membership predicate over the commit ref. Entries wrapped in
/// slashes pass through as regexes; everything else is quoted literally.
fn ref_membership_expr(refs: &[String]) -> String {
    let items: Vec<String> = refs
        .iter()
        .map(|r| {
            if r.starts_with('/') && r.ends_with('/') && r.len() > 1 {
                r.clone()
            } else {
                format!("\"{}\"", r)
            }
        })
        .collect();
    format!("$CI_COMMIT_REF_NAME in [{}]", items.join(", "))
}
