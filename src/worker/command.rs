//! External process worker.
//!
//! One process per invocation. The request `{"params": .., "context": ..}` is
//! written to stdin as JSON and stdin is closed; the first JSON object in stdout
//! that reads as a [`WorkerOutput`] is the result. Workers may log freely around it.
//!
//! Exit codes: `0` parses the output, `2` is a fatal worker failure, anything
//! else is a transient invocation failure. An output object of the form
//! `{"fatal": "reason"}` is fatal regardless of exit code.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{PhaseParameters, PhaseWorker, WorkerOutput};
use crate::errors::WorkerError;
use crate::issue::WorkflowContext;
use crate::util::json_objects;

const FATAL_EXIT_CODE: i32 = 2;
const STDERR_TAIL_CHARS: usize = 500;

#[derive(Serialize)]
struct WorkerRequest<'a> {
    params: &'a PhaseParameters,
    context: &'a WorkflowContext,
}

pub struct CommandWorker {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
    timeout_secs: Option<u64>,
}

impl CommandWorker {
    pub fn new(program: impl Into<String>, args: Vec<String>, working_dir: &Path) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: working_dir.to_path_buf(),
            timeout_secs: None,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: Option<u64>) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

#[async_trait]
impl PhaseWorker for CommandWorker {
    async fn invoke(
        &self,
        ctx: &WorkflowContext,
        params: &PhaseParameters,
    ) -> Result<WorkerOutput, WorkerError> {
        let request = serde_json::to_vec(&WorkerRequest {
            params,
            context: ctx,
        })
        .map_err(|e| WorkerError::Fatal(format!("Failed to encode worker request: {}", e)))?;

        // Killed on drop so a timeout or cancellation never leaves a stray worker.
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("MENDER_ISSUE_ID", params.issue_id.as_str())
            .env("MENDER_PHASE", params.phase.slug())
            .env("MENDER_ATTEMPT", params.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&self.working_dir)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::Invocation(format!("Failed to spawn '{}': {}", self.program, e)))?;

        debug!(
            worker = %self.program,
            pid = child.id().unwrap_or(0),
            phase = %params.phase,
            attempt = params.attempt,
            "spawned worker"
        );

        // Feed stdin while draining stdout and stderr, so a worker that answers
        // before it has read the whole request cannot fill its pipes and stall.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A worker that exits without reading stdin is judged by its exit code.
                if let Err(e) = stdin.write_all(&request).await {
                    debug!(error = %e, "worker closed stdin early");
                }
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output =
            output.map_err(|e| WorkerError::Invocation(format!("Failed to wait for worker: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code();

        parse_output(&stdout, &stderr, code)
    }

    fn name(&self) -> String {
        self.program.clone()
    }

    fn timeout_secs(&self) -> Option<u64> {
        self.timeout_secs
    }
}

/// Classify a finished worker process.
pub(crate) fn parse_output(
    stdout: &str,
    stderr: &str,
    code: Option<i32>,
) -> Result<WorkerOutput, WorkerError> {
    let objects: Vec<serde_json::Value> = json_objects(stdout)
        .into_iter()
        .filter_map(|text| serde_json::from_str(text).ok())
        .collect();

    if let Some(reason) = objects
        .iter()
        .find_map(|v| v.get("fatal").and_then(|f| f.as_str()))
    {
        return Err(WorkerError::Fatal(reason.to_string()));
    }

    match code {
        Some(0) => {}
        Some(FATAL_EXIT_CODE) => {
            return Err(WorkerError::Fatal(format!(
                "worker exited with code 2: {}",
                tail(stderr)
            )));
        }
        Some(other) => {
            return Err(WorkerError::Invocation(format!(
                "worker exited with code {}: {}",
                other,
                tail(stderr)
            )));
        }
        None => {
            return Err(WorkerError::Invocation(
                "worker terminated by signal".to_string(),
            ));
        }
    }

    // Workers may print JSON log lines too: the result is the first object
    // that reads as a worker output.
    let mut last_error = None;
    for value in objects {
        match serde_json::from_value::<WorkerOutput>(value) {
            Ok(output) => return Ok(output),
            Err(e) => last_error = Some(e),
        }
    }
    Err(match last_error {
        Some(e) => WorkerError::Invocation(format!("worker result is malformed: {}", e)),
        None => WorkerError::Invocation("worker produced no JSON result on stdout".to_string()),
    })
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_TAIL_CHARS {
        trimmed.to_string()
    } else {
        trimmed.chars().skip(count - STDERR_TAIL_CHARS).collect()
    }
}
