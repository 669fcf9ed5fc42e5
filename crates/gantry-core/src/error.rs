//! Error types for Gantry.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors: the pipeline is never created.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    // Graph errors: the pipeline is created but marked failed with no jobs run.
    #[error("dependency cycle among jobs: {}", members.join(", "))]
    Graph { members: Vec<String> },

    // Scheduling errors
    #[error("no compatible runner for tags {tags:?}")]
    RunnerUnavailable { tags: Vec<String> },

    // Execution errors
    #[error("script failed with exit code {exit_code}")]
    ScriptFailure { exit_code: i32 },

    #[error("job exceeded timeout of {seconds}s")]
    TimeoutExceeded { seconds: u64 },

    #[error("cancellation requested")]
    CancellationRequested,

    #[error("runner system failure: {0}")]
    RunnerSystemFailure(String),

    // Lookup errors
    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("dispatch not found: {0}")]
    DispatchNotFound(String),

    // Infrastructure errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    /// Map an execution error to the failure reason recorded on the job.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Error::ScriptFailure { .. } => Some(FailureReason::ScriptFailure),
            Error::TimeoutExceeded { .. } => Some(FailureReason::Timeout),
            Error::CancellationRequested => Some(FailureReason::Canceled),
            Error::RunnerSystemFailure(_) | Error::RunnerUnavailable { .. } => {
                Some(FailureReason::RunnerSystemFailure)
            }
            _ => None,
        }
    }
}

/// Why a job ended in a failed (or canceled) state. Retry policies match
/// against these reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ScriptFailure,
    RunnerSystemFailure,
    Timeout,
    Canceled,
}

impl FailureReason {
    /// Cancellation is never retried regardless of policy.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureReason::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_error_names_members() {
        let err = Error::Graph {
            members: vec!["a".into(), "b".into(), "c".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("a, b, c"));
    }

    #[test]
    fn test_failure_reason_mapping() {
        assert_eq!(
            Error::ScriptFailure { exit_code: 2 }.failure_reason(),
            Some(FailureReason::ScriptFailure)
        );
        assert_eq!(
            Error::TimeoutExceeded { seconds: 60 }.failure_reason(),
            Some(FailureReason::Timeout)
        );
        assert_eq!(Error::Configuration("bad".into()).failure_reason(), None);
    }

    #[test]
    fn test_canceled_not_retryable() {
        assert!(!FailureReason::Canceled.is_retryable());
        assert!(FailureReason::Timeout.is_retryable());
    }
}
