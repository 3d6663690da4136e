//! Deterministic worker driven by a script of canned responses.
//!
//! Script format, keyed by lowercase phase name:
//!
//! ```json
//! {
//!   "validate": [{"verdict": "REJECT", "summary": "works as intended"}],
//!   "verify": [
//!     {"verdict": "RETRY", "summary": "2 tests failing"},
//!     {"error": "runner unreachable", "transient": true},
//!     {"verdict": "TERMINAL_SUCCESS", "summary": "all green", "delay_ms": 50}
//!   ],
//!   "default": {"verdict": "CONTINUE", "summary": "ok"}
//! }
//! ```
//!
//! Each invocation pops the next response for its phase. Once a phase's queue
//! is empty the `default` response (or a plain CONTINUE) answers.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;

use super::{PhaseParameters, PhaseWorker, WorkerOutput};
use crate::errors::WorkerError;
use crate::issue::{Phase, Verdict, WorkflowContext};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ScriptedResponse {
    Failure {
        error: String,
        #[serde(default)]
        transient: bool,
    },
    Output(WorkerOutput),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptStep {
    pub delay: Duration,
    pub response: ScriptedResponse,
}

impl ScriptStep {
    fn from_value(value: serde_json::Value) -> Result<Self> {
        let delay = value
            .get("delay_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or_default();
        let response = serde_json::from_value(value).context("Invalid scripted response")?;
        Ok(Self { delay, response })
    }
}

/// One invocation observed by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptedCall {
    pub phase: Phase,
    pub attempt: u32,
    pub invocation: u32,
}

#[derive(Debug, Default)]
pub struct ScriptedWorker {
    queues: Mutex<HashMap<Phase, VecDeque<ScriptStep>>>,
    default: Option<ScriptStep>,
    calls: Mutex<Vec<ScriptedCall>>,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script: {}", path.display()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(content).context("Script is not valid JSON")?;
        let Some(map) = value.as_object() else {
            bail!("Script must be a JSON object keyed by phase");
        };

        let mut worker = Self::new();
        for (key, entry) in map {
            if key == "default" {
                worker.default = Some(ScriptStep::from_value(entry.clone())?);
                continue;
            }
            let phase: Phase = key
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .with_context(|| format!("Unknown phase '{}' in script", key))?;
            let steps = match entry {
                serde_json::Value::Array(items) => items.clone(),
                single => vec![single.clone()],
            };
            for step in steps {
                worker.push_step(phase, ScriptStep::from_value(step)?);
            }
        }
        Ok(worker)
    }

    pub fn push_step(&self, phase: Phase, step: ScriptStep) {
        self.queues().entry(phase).or_default().push_back(step);
    }

    pub fn respond(self, phase: Phase, output: WorkerOutput) -> Self {
        self.push_step(
            phase,
            ScriptStep {
                delay: Duration::ZERO,
                response: ScriptedResponse::Output(output),
            },
        );
        self
    }

    /// Queue a simple verdict with a generated summary.
    pub fn verdict(self, phase: Phase, verdict: Verdict) -> Self {
        let summary = format!("{} {}", phase.slug(), verdict.as_str().to_lowercase());
        self.respond(phase, WorkerOutput::new(verdict, summary))
    }

    pub fn fail(self, phase: Phase, error: impl Into<String>, transient: bool) -> Self {
        self.push_step(
            phase,
            ScriptStep {
                delay: Duration::ZERO,
                response: ScriptedResponse::Failure {
                    error: error.into(),
                    transient,
                },
            },
        );
        self
    }

    /// Hold the next response for `phase` for `delay` before answering.
    pub fn delayed(self, phase: Phase, delay: Duration, output: WorkerOutput) -> Self {
        self.push_step(
            phase,
            ScriptStep {
                delay,
                response: ScriptedResponse::Output(output),
            },
        );
        self
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of invocations made for a phase, counting retried ones.
    pub fn invocations(&self, phase: Phase) -> usize {
        self.calls().iter().filter(|c| c.phase == phase).count()
    }

    fn queues(&self) -> std::sync::MutexGuard<'_, HashMap<Phase, VecDeque<ScriptStep>>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_step(&self, phase: Phase) -> ScriptStep {
        if let Some(step) = self.queues().get_mut(&phase).and_then(|q| q.pop_front()) {
            return step;
        }
        self.default.clone().unwrap_or_else(|| ScriptStep {
            delay: Duration::ZERO,
            response: ScriptedResponse::Output(WorkerOutput::new(
                Verdict::Continue,
                format!("{} completed", phase.slug()),
            )),
        })
    }
}

#[async_trait]
impl PhaseWorker for ScriptedWorker {
    async fn invoke(
        &self,
        _ctx: &WorkflowContext,
        params: &PhaseParameters,
    ) -> Result<WorkerOutput, WorkerError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ScriptedCall {
                phase: params.phase,
                attempt: params.attempt,
                invocation: params.invocation,
            });

        let step = self.next_step(params.phase);
        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }
        match step.response {
            ScriptedResponse::Output(output) => Ok(output),
            ScriptedResponse::Failure {
                error,
                transient: true,
            } => Err(WorkerError::Invocation(error)),
            ScriptedResponse::Failure { error, .. } => Err(WorkerError::Fatal(error)),
        }
    }

    fn name(&self) -> String {
        "scripted".to_string()
    }
}
