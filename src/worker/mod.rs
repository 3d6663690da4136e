//! Phase worker contract.
//!
//! Workers are opaque: the controller hands them the current
//! [`WorkflowContext`] plus [`PhaseParameters`] and gets back a structured
//! [`WorkerOutput`] carrying the verdict out of band. Workers need not be
//! idempotent; the store's `(phase, attempt)` key makes duplicate invocations
//! harmless.

pub mod command;
pub mod scripted;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::MenderConfig;
use crate::errors::WorkerError;
use crate::issue::{Finding, IssueId, Phase, Verdict, WorkflowContext};

pub use command::CommandWorker;
pub use scripted::ScriptedWorker;

/// Per-invocation parameters sent alongside the context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseParameters {
    pub issue_id: IssueId,
    pub phase: Phase,
    /// Attempt number of the phase (idempotency key component).
    pub attempt: u32,
    /// Invocation number within this attempt, starting at 1.
    pub invocation: u32,
    pub timeout_secs: u64,
    /// Implement/verify iterations consumed and allowed.
    pub retry_count: u32,
    pub max_retries: u32,
    pub project_dir: PathBuf,
}

/// Structured result returned by a phase worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub verdict: Verdict,
    pub summary: String,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Non-blocking findings; recorded, never block advancement.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<Finding>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_files: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_type: Option<String>,
}

impl WorkerOutput {
    pub fn new(verdict: Verdict, summary: impl Into<String>) -> Self {
        Self {
            verdict,
            summary: summary.into(),
            body: serde_json::Value::Null,
            notes: None,
            findings: Vec::new(),
            changed_files: Vec::new(),
            commit_type: None,
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_finding(mut self, summary: impl Into<String>) -> Self {
        self.findings.push(Finding {
            summary: summary.into(),
            detail: None,
        });
        self
    }

    pub fn with_changed_files(mut self, files: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        self.changed_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_commit_type(mut self, commit_type: impl Into<String>) -> Self {
        self.commit_type = Some(commit_type.into());
        self
    }
}

/// Abstraction over phase execution.
/// Real implementation: `CommandWorker`. Test double: `ScriptedWorker`.
#[async_trait]
pub trait PhaseWorker: Send + Sync {
    async fn invoke(
        &self,
        ctx: &WorkflowContext,
        params: &PhaseParameters,
    ) -> Result<WorkerOutput, WorkerError>;

    /// Short label for logs.
    fn name(&self) -> String {
        "worker".to_string()
    }

    /// Per-worker invocation timeout, overriding the workflow default.
    fn timeout_secs(&self) -> Option<u64> {
        None
    }
}

/// Workers registered per phase, with an optional fallback.
#[derive(Clone, Default)]
pub struct WorkerSet {
    fallback: Option<Arc<dyn PhaseWorker>>,
    phases: HashMap<Phase, Arc<dyn PhaseWorker>>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// One worker serving every phase.
    pub fn uniform(worker: Arc<dyn PhaseWorker>) -> Self {
        Self {
            fallback: Some(worker),
            phases: HashMap::new(),
        }
    }

    pub fn with_phase(mut self, phase: Phase, worker: Arc<dyn PhaseWorker>) -> Self {
        self.phases.insert(phase, worker);
        self
    }

    pub fn get(&self, phase: Phase) -> Option<Arc<dyn PhaseWorker>> {
        self.phases
            .get(&phase)
            .cloned()
            .or_else(|| self.fallback.clone())
    }

    /// Command workers for every phase that has one configured.
    pub fn from_config(config: &MenderConfig) -> Self {
        let mut set = Self::new();
        for phase in Phase::ALL {
            if let Some(spec) = config.toml.worker_for(phase)
                && let Some(program) = spec.command
            {
                let worker = CommandWorker::new(program, spec.args, &config.project_dir)
                    .with_timeout(spec.timeout_secs);
                set.phases.insert(phase, Arc::new(worker));
            }
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed(Verdict);

    #[async_trait]
    impl PhaseWorker for Fixed {
        async fn invoke(
            &self,
            _ctx: &WorkflowContext,
            _params: &PhaseParameters,
        ) -> Result<WorkerOutput, WorkerError> {
            Ok(WorkerOutput::new(self.0, "fixed"))
        }
    }

    #[test]
    fn test_worker_output_parses_minimal_json() {
        let out: WorkerOutput =
            serde_json::from_value(json!({"verdict": "CONTINUE", "summary": "ok"})).unwrap();
        assert_eq!(out.verdict, Verdict::Continue);
        assert!(out.findings.is_empty());
        assert!(out.body.is_null());
    }

    #[test]
    fn test_worker_output_parses_full_json() {
        let out: WorkerOutput = serde_json::from_value(json!({
            "verdict": "TERMINAL_SUCCESS",
            "summary": "all green",
            "body": {"tests": 42},
            "notes": "one flaky test skipped",
            "findings": [{"summary": "follow-up: tighten timeout"}],
            "changed_files": ["src/client.rs"],
            "commit_type": "fix"
        }))
        .unwrap();
        assert_eq!(out.verdict, Verdict::TerminalSuccess);
        assert_eq!(out.findings[0].summary, "follow-up: tighten timeout");
        assert_eq!(out.changed_files, vec![PathBuf::from("src/client.rs")]);
        assert_eq!(out.commit_type.as_deref(), Some("fix"));
    }

    #[test]
    fn test_worker_set_prefers_phase_worker() {
        let set = WorkerSet::uniform(Arc::new(Fixed(Verdict::Continue)))
            .with_phase(Phase::Validate, Arc::new(Fixed(Verdict::Reject)));
        assert!(set.get(Phase::Research).is_some());
        assert!(set.get(Phase::Validate).is_some());
        assert!(WorkerSet::new().get(Phase::Research).is_none());
    }

    #[tokio::test]
    async fn test_worker_set_dispatches_by_phase() {
        let set = WorkerSet::uniform(Arc::new(Fixed(Verdict::Continue)))
            .with_phase(Phase::Validate, Arc::new(Fixed(Verdict::Reject)));
        let issue = IssueId::parse("x").unwrap();
        let ctx = WorkflowContext {
            issue: crate::issue::Issue::new(issue.clone(), "t"),
            records: Vec::new(),
        };
        let params = PhaseParameters {
            issue_id: issue,
            phase: Phase::Validate,
            attempt: 1,
            invocation: 1,
            timeout_secs: 5,
            retry_count: 0,
            max_retries: 3,
            project_dir: PathBuf::from("."),
        };
        let worker = set.get(Phase::Validate).unwrap();
        let out = worker.invoke(&ctx, &params).await.unwrap();
        assert_eq!(out.verdict, Verdict::Reject);
    }
}
