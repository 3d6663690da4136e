//! Typed error hierarchy for the mender orchestrator.
//!
//! The enums follow the failure taxonomy of the workflow:
//! - `StoreError`: Issue Store append/read/archive failures
//! - `WorkerError`: phase worker invocation failures (transient or fatal)
//! - `TransitionError`: verdicts or record chains the transition table rejects
//! - `RetryBudgetExhausted`: the implement/verify loop hit its maximum
//! - `FinalizeError`: the archival transaction could not complete
//! - `ControllerError`: everything the phase controller surfaces to callers

use std::path::PathBuf;

use thiserror::Error;

use crate::issue::{IssueId, Phase, Verdict};

/// Errors from the Issue Store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize document: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Issue {0} not found")]
    NotFound(IssueId),

    #[error("Issue {0} already exists")]
    AlreadyExists(IssueId),

    #[error("Issue {0} is archived and can no longer be modified")]
    NotActive(IssueId),

    #[error("Corrupt document at {path}: {message}")]
    Corrupt { path: PathBuf, message: String },
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Only unavailability is worth retrying; missing or archived issues never heal.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io { .. })
    }
}

/// Errors from a single phase worker invocation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WorkerError {
    #[error("Worker invocation failed: {0}")]
    Invocation(String),

    #[error("Worker timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Worker reported an unrecoverable failure: {0}")]
    Fatal(String),
}

impl WorkerError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, WorkerError::Fatal(_))
    }
}

/// A verdict or record chain that the transition table does not allow.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransitionError {
    #[error("Verdict {verdict} is not valid for phase {phase}")]
    InvalidVerdict { phase: Phase, verdict: Verdict },

    #[error("Record #{sequence} ({phase} attempt {attempt}) does not follow from the previous state; expected {expected}")]
    UnexpectedRecord {
        sequence: u32,
        phase: Phase,
        attempt: u32,
        expected: String,
    },

    #[error("Record #{sequence} was appended after the workflow reached a terminal state")]
    TerminalState { sequence: u32 },
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("Retry budget exhausted for issue {issue}: {max} implement/verify iterations used")]
pub struct RetryBudgetExhausted {
    pub issue: IssueId,
    pub max: u32,
}

/// Errors from the archival/finalization transaction.
#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("Version-control commit failed: {0}")]
    Commit(String),

    #[error("Failed to render summary: {0}")]
    Render(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by the phase controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Finalize(#[from] FinalizeError),

    #[error(transparent)]
    RetryBudget(#[from] RetryBudgetExhausted),

    #[error("No worker registered for phase {0}")]
    MissingWorker(Phase),

    #[error("Issue {0} is already being driven by another controller")]
    Busy(IssueId),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_io_is_transient() {
        let err = StoreError::io("/tmp/x", std::io::Error::other("disk gone"));
        assert!(err.is_transient());
        assert!(err.to_string().contains("/tmp/x"));
    }

    #[test]
    fn store_error_not_found_is_permanent() {
        let err = StoreError::NotFound(IssueId::parse("fix-timeout-bug").unwrap());
        assert!(!err.is_transient());
        assert!(err.to_string().contains("fix-timeout-bug"));
    }

    #[test]
    fn worker_error_fatal_is_not_transient() {
        assert!(WorkerError::Invocation("connection refused".into()).is_transient());
        assert!(WorkerError::Timeout { secs: 5 }.is_transient());
        assert!(!WorkerError::Fatal("bad input".into()).is_transient());
    }

    #[test]
    fn transition_error_names_phase_and_verdict() {
        let err = TransitionError::InvalidVerdict {
            phase: Phase::Research,
            verdict: Verdict::Reject,
        };
        let msg = err.to_string();
        assert!(msg.contains("RESEARCH"));
        assert!(msg.contains("REJECT"));
    }

    #[test]
    fn controller_error_converts_from_store_error() {
        let inner = StoreError::NotActive(IssueId::parse("done-issue").unwrap());
        let err: ControllerError = inner.into();
        assert!(matches!(err, ControllerError::Store(StoreError::NotActive(_))));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&WorkerError::Fatal("x".into()));
        assert_std_error(&FinalizeError::Commit("x".into()));
        assert_std_error(&RetryBudgetExhausted {
            issue: IssueId::parse("a").unwrap(),
            max: 3,
        });
    }
}
