//! Scripted runner agent for integration tests.
//!
//! Each job name is given a plan describing how its dispatches behave;
//! the agent records every dispatch so tests can assert on ordering,
//! attempt counts, and the request contents.

use gantry_core::ids::DispatchId;
use gantry_core::ports::{DispatchRequest, DispatchStatus, RunnerAgent};
use gantry_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// How dispatches for one job behave.
#[derive(Debug, Clone)]
pub enum Plan {
    Succeed,
    /// Succeed and serve these files from `collect`.
    SucceedWithFiles(BTreeMap<String, Vec<u8>>),
    /// Fail the first `failures` dispatches with the exit code, then succeed.
    FailTimes { failures: u32, exit_code: i32 },
    AlwaysFail { exit_code: i32 },
    /// Report a system failure for the first `failures` dispatches.
    SystemFailTimes { failures: u32 },
    /// Stay running until canceled.
    HangUntilCancel,
}

struct DispatchState {
    status: DispatchStatus,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Default)]
pub struct FakeRunner {
    plans: Mutex<HashMap<String, Plan>>,
    counts: Mutex<HashMap<String, u32>>,
    dispatches: Mutex<HashMap<DispatchId, DispatchState>>,
    order: Mutex<Vec<String>>,
    requests: Mutex<Vec<DispatchRequest>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(&self, job: &str, plan: Plan) {
        self.plans.lock().unwrap().insert(job.to_string(), plan);
    }

    /// Job names in the order they were dispatched, repeats included.
    pub fn dispatch_order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    pub fn dispatch_count(&self, job: &str) -> u32 {
        self.counts.lock().unwrap().get(job).copied().unwrap_or(0)
    }

    /// Every request received, in dispatch order.
    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, job: &str) -> Vec<DispatchRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.job.as_str() == job)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl RunnerAgent for FakeRunner {
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchId> {
        let job = request.job.to_string();
        self.order.lock().unwrap().push(job.clone());
        self.requests.lock().unwrap().push(request);

        let count = {
            let mut counts = self.counts.lock().unwrap();
            let count = counts.entry(job.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let plan = self
            .plans
            .lock()
            .unwrap()
            .get(&job)
            .cloned()
            .unwrap_or(Plan::Succeed);
        let (status, files) = match plan {
            Plan::Succeed => (DispatchStatus::Succeeded, BTreeMap::new()),
            Plan::SucceedWithFiles(files) => (DispatchStatus::Succeeded, files),
            Plan::FailTimes {
                failures,
                exit_code,
            } => {
                if count <= failures {
                    (DispatchStatus::Failed { exit_code }, BTreeMap::new())
                } else {
                    (DispatchStatus::Succeeded, BTreeMap::new())
                }
            }
            Plan::AlwaysFail { exit_code } => {
                (DispatchStatus::Failed { exit_code }, BTreeMap::new())
            }
            Plan::SystemFailTimes { failures } => {
                if count <= failures {
                    (
                        DispatchStatus::SystemFailure {
                            message: "scripted fault".to_string(),
                        },
                        BTreeMap::new(),
                    )
                } else {
                    (DispatchStatus::Succeeded, BTreeMap::new())
                }
            }
            Plan::HangUntilCancel => (DispatchStatus::Running, BTreeMap::new()),
        };

        let id = DispatchId::new();
        self.dispatches
            .lock()
            .unwrap()
            .insert(id, DispatchState { status, files });
        Ok(id)
    }

    async fn cancel(&self, dispatch: DispatchId) -> Result<()> {
        let mut dispatches = self.dispatches.lock().unwrap();
        let state = dispatches
            .get_mut(&dispatch)
            .ok_or_else(|| Error::DispatchNotFound(dispatch.to_string()))?;
        if !state.status.is_terminal() {
            state.status = DispatchStatus::Canceled;
        }
        Ok(())
    }

    async fn status(&self, dispatch: DispatchId) -> Result<DispatchStatus> {
        self.dispatches
            .lock()
            .unwrap()
            .get(&dispatch)
            .map(|state| state.status.clone())
            .ok_or_else(|| Error::DispatchNotFound(dispatch.to_string()))
    }

    async fn collect(&self, dispatch: DispatchId, paths: &[String]) -> Result<Vec<u8>> {
        let dispatches = self.dispatches.lock().unwrap();
        let state = dispatches
            .get(&dispatch)
            .ok_or_else(|| Error::DispatchNotFound(dispatch.to_string()))?;
        let selected: BTreeMap<&String, &Vec<u8>> = state
            .files
            .iter()
            .filter(|(name, _)| paths.iter().any(|p| name.starts_with(p.as_str())))
            .collect();
        Ok(serde_json::to_vec(&selected)?)
    }
}
