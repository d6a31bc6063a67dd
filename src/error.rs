//! Error Types
//!
//! Error taxonomy for graph declaration, status transitions, step
//! execution, ledger persistence and pipeline parsing.
//!
//! Step failures ([`StepError`]) are never returned from a run; they are
//! recorded on the failing step and reported through the run result.
//! Only ledger and contract violations abort a run ([`EngineError`]).

use std::path::PathBuf;

use thiserror::Error;

use crate::workflow::model::{StepId, StepStatus};

/// Boxed error type returned by in-process step functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while declaring steps.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Adding the edge would close a dependency cycle.
    #[error("step {step} cannot depend on step {prerequisite}: dependency cycle")]
    Cycle { step: StepId, prerequisite: StepId },

    /// A referenced step id was never registered.
    #[error("unknown step {0}")]
    UnknownStep(StepId),
}

/// A status change the graph does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition for step {id}: {from} -> {to}")]
pub struct TransitionError {
    pub id: StepId,
    pub from: StepStatus,
    pub to: StepStatus,
}

/// Why a step ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// The action raised an error, panicked, or its process could not start.
    #[error("{0}")]
    Execution(String),

    /// The external command exited unsuccessfully.
    #[error("command exited with status {code:?}: {stderr}")]
    ExitStatus { code: Option<i32>, stderr: String },

    /// The step exceeded its time limit and was stopped.
    #[error("step timed out after {0:.1?}")]
    Timeout(std::time::Duration),

    /// The action succeeded but did not produce its declared outputs.
    #[error("missing expected artifacts: {}", display_paths(.0))]
    MissingArtifacts(Vec<PathBuf>),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors reading or writing the run ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode ledger entry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("corrupt ledger {path} at line {line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Durability was lost; the resume contract can no longer be honored.
    #[error("ledger failure: {0}")]
    Ledger(#[from] LedgerError),

    #[error("engine contract violation: {0}")]
    Transition(#[from] TransitionError),

    #[error("worker pool disconnected with {0} steps in flight")]
    WorkerDisconnected(usize),
}

/// Errors loading a pipeline definition.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read pipeline file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse pipeline YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("pipeline has no steps")]
    Empty,

    #[error("duplicate step name: '{0}'")]
    DuplicateName(String),

    #[error("step '{0}' has no program")]
    EmptyProgram(String),

    #[error("step '{step}' references unknown step '{reference}'")]
    UnknownReference { step: String, reference: String },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_missing_artifacts_display_lists_paths() {
        let err = StepError::MissingArtifacts(vec![
            PathBuf::from("a.mrc"),
            PathBuf::from("b.xmd"),
        ]);
        assert_eq!(err.to_string(), "missing expected artifacts: a.mrc, b.xmd");
    }

    #[test]
    fn test_transition_error_display() {
        let err = TransitionError {
            id: StepId(3),
            from: StepStatus::Done,
            to: StepStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            "invalid transition for step 3: Done -> Running"
        );
    }

    #[test]
    fn test_timeout_display() {
        let err = StepError::Timeout(Duration::from_secs(2));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_cycle_error_display() {
        let err = GraphError::Cycle {
            step: StepId(1),
            prerequisite: StepId(2),
        };
        assert!(err.to_string().contains("cycle"));
    }
}
