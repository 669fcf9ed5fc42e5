//! Test fixtures for pipeline configurations and VCS stubs.

use gantry_core::config::{JobConfig, PipelineConfig};
use gantry_core::ports::{RefMeta, VcsProvider};
use gantry_core::rules::TriggerSource;
use gantry_core::Result;
use gantry_scheduler::TriggerRequest;
use std::collections::HashMap;

/// A job with sensible defaults, ready to be customized field by field.
pub fn job(name: &str, stage: &str) -> JobConfig {
    JobConfig {
        name: name.to_string(),
        stage: Some(stage.to_string()),
        script: vec![format!("echo {name}")],
        variables: HashMap::new(),
        rules: vec![],
        only: None,
        except: None,
        needs: None,
        tags: vec![],
        retry: None,
        timeout_seconds: None,
        allow_failure: false,
        when: None,
        artifacts: None,
        cache: None,
        environment: None,
    }
}

/// A pipeline config over the default build/test/deploy stages.
pub fn config(jobs: Vec<JobConfig>) -> PipelineConfig {
    PipelineConfig {
        stages: vec![
            "build".to_string(),
            "test".to_string(),
            "deploy".to_string(),
        ],
        variables: HashMap::new(),
        stage_variables: HashMap::new(),
        default: None,
        jobs,
        max_parallel: None,
    }
}

pub fn push_to(ref_name: &str) -> TriggerRequest {
    TriggerRequest {
        ref_name: ref_name.to_string(),
        source: TriggerSource::Push,
        variables: HashMap::new(),
    }
}

/// VCS stub serving fixed metadata for every ref.
pub struct StaticVcs {
    pub sha: String,
    pub is_tag: bool,
    pub protected: bool,
    pub changed_paths: Option<Vec<String>>,
}

impl Default for StaticVcs {
    fn default() -> Self {
        Self {
            sha: "0f0f0f0f".to_string(),
            is_tag: false,
            protected: false,
            changed_paths: None,
        }
    }
}

#[async_trait::async_trait]
impl VcsProvider for StaticVcs {
    async fn ref_meta(&self, _ref_name: &str) -> Result<RefMeta> {
        Ok(RefMeta {
            sha: self.sha.clone(),
            is_tag: self.is_tag,
            protected: self.protected,
        })
    }

    async fn changed_paths(&self, _ref_name: &str, _sha: &str) -> Result<Option<Vec<String>>> {
        Ok(self.changed_paths.clone())
    }
}
