//! Phase controller: drives one issue through the pipeline.
//!
//! Each step reads the Workflow Context, invokes exactly one phase worker,
//! persists the outcome under its `(phase, attempt)` key and only then computes
//! the next state. Nothing advances without a successful persist.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use super::retry::RetryManager;
use super::transition::{self, NextStep, Target};
use crate::config::MenderConfig;
use crate::errors::{ControllerError, FinalizeError, RetryBudgetExhausted, StoreError, WorkerError};
use crate::finalize::Finalizer;
use crate::issue::{
    Artifact, ArtifactKind, FailureKind, FailureRecord, Issue, IssueId, IssueStatus, NewRecord,
    Phase, PhaseRecord, Resolution, Verdict, WorkflowContext,
};
use crate::store::{IssueStore, StoreHandle};
use crate::worker::{PhaseParameters, PhaseWorker, WorkerOutput, WorkerSet};

/// Tunables for one controller.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub project_dir: PathBuf,
    pub max_retries: u32,
    pub invocation_timeout: Duration,
    /// Invocations allowed per attempt, the first one included.
    pub worker_attempts: u32,
    pub worker_backoff: BackoffPolicy,
    pub storage_backoff: BackoffPolicy,
    pub stall_after: u32,
    pub give_up_after: Option<u32>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            max_retries: 3,
            invocation_timeout: Duration::from_secs(900),
            worker_attempts: 3,
            worker_backoff: BackoffPolicy::default(),
            storage_backoff: BackoffPolicy::new(
                Duration::from_millis(200),
                Duration::from_secs(10),
            ),
            stall_after: 5,
            give_up_after: None,
        }
    }
}

impl ControllerSettings {
    pub fn from_config(config: &MenderConfig) -> Self {
        let toml = &config.toml;
        Self {
            project_dir: config.project_dir.clone(),
            max_retries: config.max_verify_retries(),
            invocation_timeout: config.invocation_timeout(),
            worker_attempts: toml.worker_retry.max_attempts,
            worker_backoff: toml.worker_retry.policy(),
            storage_backoff: toml.storage_retry.policy(),
            stall_after: toml.storage_retry.stall_after,
            give_up_after: toml.storage_retry.give_up_after,
        }
    }
}

/// Result of a single [`PhaseController::step`].
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// One Phase Record was persisted (or found already persisted).
    Advanced {
        record: PhaseRecord,
        duplicate: bool,
        next: NextStep,
    },
    /// The archival transaction completed.
    Finalized(Issue),
    /// Nothing to do: the issue was archived earlier.
    AlreadyTerminal(Issue),
    /// Cancelled before anything was persisted.
    Aborted { phase: Option<Phase>, attempt: u32 },
    /// Storage stayed unavailable past the configured cap.
    Stalled { error: String },
}

/// Result of driving an issue as far as it goes.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Finished(Issue),
    Aborted { phase: Option<Phase>, attempt: u32 },
    Stalled { issue: IssueId, error: String },
}

impl RunOutcome {
    pub fn status(&self) -> IssueStatus {
        match self {
            RunOutcome::Finished(issue) => issue.status,
            RunOutcome::Aborted { .. } => IssueStatus::InProgress,
            RunOutcome::Stalled { .. } => IssueStatus::Stalled,
        }
    }
}

enum Storage<R> {
    Done(R),
    GaveUp(String),
    Aborted,
}

enum Invocation {
    Output {
        output: WorkerOutput,
        invocations: u32,
        failures: Vec<String>,
    },
    Failed {
        kind: FailureKind,
        error: WorkerError,
        invocations: u32,
        failures: Vec<String>,
    },
    Aborted,
}

pub struct PhaseController {
    store: StoreHandle,
    workers: WorkerSet,
    retry: Arc<RetryManager>,
    finalizer: Finalizer,
    settings: ControllerSettings,
    cancel: CancellationToken,
    driving: Arc<Mutex<HashSet<IssueId>>>,
}

/// Releases the per-issue claim when dropped.
struct Claim {
    driving: Arc<Mutex<HashSet<IssueId>>>,
    id: IssueId,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.driving
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

impl PhaseController {
    pub fn new(
        store: StoreHandle,
        workers: WorkerSet,
        finalizer: Finalizer,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            retry: Arc::new(RetryManager::new(settings.max_retries)),
            store,
            workers,
            finalizer,
            settings,
            cancel: CancellationToken::new(),
            driving: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn from_config(config: &MenderConfig, store: StoreHandle, workers: WorkerSet) -> Self {
        Self::new(
            store,
            workers,
            Finalizer::from_config(config),
            ControllerSettings::from_config(config),
        )
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_retry_manager(mut self, retry: Arc<RetryManager>) -> Self {
        self.retry = retry;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Create the issue (status OPEN, first phase RESEARCH) and drive it.
    pub async fn start(&self, id: &IssueId, title: &str) -> Result<RunOutcome, ControllerError> {
        let (key, title) = (id.clone(), title.to_string());
        let created = self
            .with_storage(id, "create", move |s| s.create(&key, &title))
            .await?;
        match created {
            Storage::Done(issue) => {
                info!(issue = %issue.id, title = %issue.title, "issue opened");
                self.run(id).await
            }
            Storage::GaveUp(error) => Ok(RunOutcome::Stalled {
                issue: id.clone(),
                error,
            }),
            Storage::Aborted => Ok(RunOutcome::Aborted {
                phase: None,
                attempt: 0,
            }),
        }
    }

    /// Continue from the last persisted state.
    pub async fn resume(&self, id: &IssueId) -> Result<RunOutcome, ControllerError> {
        self.run(id).await
    }

    /// Step until the issue is archived, aborted or stalled.
    pub async fn run(&self, id: &IssueId) -> Result<RunOutcome, ControllerError> {
        let _claim = self.claim(id)?;
        loop {
            match self.step_claimed(id).await? {
                StepOutcome::Advanced { .. } => continue,
                StepOutcome::Finalized(issue) | StepOutcome::AlreadyTerminal(issue) => {
                    return Ok(RunOutcome::Finished(issue));
                }
                StepOutcome::Aborted { phase, attempt } => {
                    return Ok(RunOutcome::Aborted { phase, attempt });
                }
                StepOutcome::Stalled { error } => {
                    return Ok(RunOutcome::Stalled {
                        issue: id.clone(),
                        error,
                    });
                }
            }
        }
    }

    /// Execute exactly one blocking point: one phase or the finalize transaction.
    pub async fn step(&self, id: &IssueId) -> Result<StepOutcome, ControllerError> {
        let _claim = self.claim(id)?;
        self.step_claimed(id).await
    }

    fn claim(&self, id: &IssueId) -> Result<Claim, ControllerError> {
        let mut driving = self.driving.lock().unwrap_or_else(|e| e.into_inner());
        if !driving.insert(id.clone()) {
            return Err(ControllerError::Busy(id.clone()));
        }
        Ok(Claim {
            driving: self.driving.clone(),
            id: id.clone(),
        })
    }

    async fn step_claimed(&self, id: &IssueId) -> Result<StepOutcome, ControllerError> {
        if self.cancel.is_cancelled() {
            return Ok(StepOutcome::Aborted {
                phase: None,
                attempt: 0,
            });
        }

        let key = id.clone();
        let ctx = match self.with_storage(id, "read", move |s| s.read(&key)).await? {
            Storage::Done(ctx) => ctx,
            Storage::GaveUp(error) => return Ok(StepOutcome::Stalled { error }),
            Storage::Aborted => {
                return Ok(StepOutcome::Aborted {
                    phase: None,
                    attempt: 0,
                });
            }
        };
        self.retry.restore(&ctx);

        match transition::next_step(&ctx, self.settings.max_retries)? {
            NextStep::Done(_) => Ok(StepOutcome::AlreadyTerminal(ctx.issue)),
            NextStep::Archive(resolution) => self.finalize(&ctx, resolution).await,
            NextStep::Invoke { phase, attempt } => self.run_phase(&ctx, phase, attempt).await,
        }
    }

    async fn run_phase(
        &self,
        ctx: &WorkflowContext,
        phase: Phase,
        attempt: u32,
    ) -> Result<StepOutcome, ControllerError> {
        let id = ctx.issue_id();
        let worker = self
            .workers
            .get(phase)
            .ok_or(ControllerError::MissingWorker(phase))?;

        if phase == Phase::Implement {
            self.retry.record_attempt(id)?;
        }

        info!(
            issue = %id,
            phase = %phase,
            attempt,
            worker = %worker.name(),
            "invoking phase worker"
        );

        let record = match self.invoke_with_retry(worker.as_ref(), ctx, phase, attempt).await {
            Invocation::Aborted => {
                info!(issue = %id, phase = %phase, attempt, "invocation aborted, nothing persisted");
                return Ok(StepOutcome::Aborted {
                    phase: Some(phase),
                    attempt,
                });
            }
            Invocation::Output {
                output,
                invocations,
                failures,
            } => self.record_from_output(ctx, phase, attempt, output, invocations, failures),
            Invocation::Failed {
                kind,
                error,
                invocations,
                failures,
            } => failure_record(id, phase, attempt, kind, &error, invocations, failures),
        };

        let key = id.clone();
        let persisted = self
            .with_storage(id, "append", move |s| s.append(&key, record.clone()))
            .await?;
        let outcome = match persisted {
            Storage::Done(outcome) => outcome,
            Storage::GaveUp(error) => return Ok(StepOutcome::Stalled { error }),
            Storage::Aborted => {
                return Ok(StepOutcome::Aborted {
                    phase: Some(phase),
                    attempt,
                });
            }
        };

        let duplicate = outcome.is_duplicate();
        if duplicate {
            info!(
                issue = %id,
                phase = %phase,
                attempt,
                "attempt already persisted, keeping the first result"
            );
        }
        let doc = outcome.into_document();
        let implement_attempts =
            ctx.attempts(Phase::Implement) + u32::from(phase == Phase::Implement);
        let target = transition::transition(
            doc.record.phase,
            doc.record.verdict,
            implement_attempts,
            self.settings.max_retries,
        )?;
        let next = match target {
            Target::Phase(next_phase) => NextStep::Invoke {
                phase: next_phase,
                attempt: ctx.attempts(next_phase) + 1,
            },
            Target::Terminal(resolution) => NextStep::Archive(resolution),
        };

        info!(
            issue = %id,
            phase = %phase,
            attempt,
            verdict = %doc.record.verdict,
            "phase completed"
        );
        Ok(StepOutcome::Advanced {
            record: doc.record,
            duplicate,
            next,
        })
    }

    /// Invoke the worker, retrying transient failures with bounded backoff.
    async fn invoke_with_retry(
        &self,
        worker: &dyn PhaseWorker,
        ctx: &WorkflowContext,
        phase: Phase,
        attempt: u32,
    ) -> Invocation {
        let id = ctx.issue_id();
        let timeout = worker
            .timeout_secs()
            .map(Duration::from_secs)
            .unwrap_or(self.settings.invocation_timeout);
        let max_invocations = self.settings.worker_attempts.max(1);
        let mut failures = Vec::new();

        for invocation in 1..=max_invocations {
            let params = PhaseParameters {
                issue_id: id.clone(),
                phase,
                attempt,
                invocation,
                timeout_secs: timeout.as_secs(),
                retry_count: self.retry.count(id),
                max_retries: self.settings.max_retries,
                project_dir: self.settings.project_dir.clone(),
            };

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Invocation::Aborted,
                r = tokio::time::timeout(timeout, worker.invoke(ctx, &params)) => r,
            };
            let error = match result {
                Ok(Ok(output)) => {
                    return Invocation::Output {
                        output,
                        invocations: invocation,
                        failures,
                    };
                }
                Ok(Err(e)) => e,
                Err(_) => WorkerError::Timeout {
                    secs: timeout.as_secs(),
                },
            };

            if !error.is_transient() {
                warn!(issue = %id, phase = %phase, attempt, error = %error, "worker failed fatally");
                return Invocation::Failed {
                    kind: FailureKind::WorkerFatal,
                    error,
                    invocations: invocation,
                    failures,
                };
            }
            if invocation == max_invocations {
                warn!(
                    issue = %id,
                    phase = %phase,
                    attempt,
                    invocations = invocation,
                    error = %error,
                    "worker invocation retries exhausted"
                );
                return Invocation::Failed {
                    kind: FailureKind::InvocationExhausted,
                    error,
                    invocations: invocation,
                    failures,
                };
            }

            let delay = self.settings.worker_backoff.delay(invocation);
            warn!(
                issue = %id,
                phase = %phase,
                attempt,
                invocation,
                max_invocations,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "worker invocation failed, retrying with backoff"
            );
            failures.push(error.to_string());
            if self.sleep_or_cancel(delay).await {
                return Invocation::Aborted;
            }
        }

        // The loop always returns on its last iteration.
        Invocation::Aborted
    }

    /// Turn worker output into the record to persist, overriding the verdict
    /// where the table or the retry budget demands it.
    fn record_from_output(
        &self,
        ctx: &WorkflowContext,
        phase: Phase,
        attempt: u32,
        output: WorkerOutput,
        invocations: u32,
        failures: Vec<String>,
    ) -> NewRecord {
        let id = ctx.issue_id();

        if !transition::is_valid_verdict(phase, output.verdict) {
            let message = format!(
                "{} returned verdict {}, which the transition table does not allow",
                phase, output.verdict
            );
            warn!(issue = %id, phase = %phase, attempt, verdict = %output.verdict, "protocol violation");
            return protocol_violation(id, phase, attempt, message, output, invocations, failures);
        }

        let mut output = output;
        match project_relative(&self.settings.project_dir, &output.changed_files) {
            Ok(files) => output.changed_files = files,
            Err(message) => {
                warn!(issue = %id, phase = %phase, attempt, error = %message, "protocol violation");
                return protocol_violation(id, phase, attempt, message, output, invocations, failures);
            }
        }

        if phase == Phase::Verify && output.verdict == Verdict::Retry && !self.retry.should_retry(id)
        {
            let exhausted = RetryBudgetExhausted {
                issue: id.clone(),
                max: self.retry.max(),
            };
            warn!(issue = %id, attempt, max = self.retry.max(), "retry budget exhausted, escalating");
            let artifact = self
                .retry
                .escalation_notice(ctx, attempt, &output.summary, output.body);
            let mut record = NewRecord::new(phase, attempt, Verdict::Escalate, artifact);
            record.reported_verdict = Some(Verdict::Retry);
            record.notes = output.notes;
            record.findings = output.findings;
            record.failure = Some(FailureRecord {
                kind: FailureKind::RetryBudgetExhausted,
                message: exhausted.to_string(),
                invocations,
            });
            record.invocation_failures = failures;
            return record;
        }

        let artifact = Artifact::new(
            id,
            phase,
            attempt,
            ArtifactKind::PhaseOutput,
            output.summary,
            output.body,
        );
        let mut record = NewRecord::new(phase, attempt, output.verdict, artifact);
        record.notes = output.notes;
        record.findings = output.findings;
        record.changed_files = output.changed_files;
        record.commit_type = output.commit_type;
        record.invocation_failures = failures;
        record
    }

    async fn finalize(
        &self,
        ctx: &WorkflowContext,
        resolution: Resolution,
    ) -> Result<StepOutcome, ControllerError> {
        let id = ctx.issue_id().clone();
        let mut failures = 0u32;

        loop {
            let store = self.store.shared();
            let finalizer = self.finalizer.clone();
            let key = id.clone();
            let result = tokio::task::spawn_blocking(move || {
                finalizer.finalize(store.as_ref(), &key, resolution)
            })
            .await
            .map_err(|e| ControllerError::Other(anyhow::anyhow!("finalize task panicked: {}", e)))?;

            match result {
                Ok(issue) => {
                    self.retry.forget(&id);
                    return Ok(StepOutcome::Finalized(issue));
                }
                Err(FinalizeError::Store(e)) if e.is_transient() => {
                    failures += 1;
                    match self.storage_backoff(&id, "archive", failures, &e).await {
                        Some(step) => return Ok(step),
                        None => continue,
                    }
                }
                Err(e) => {
                    warn!(issue = %id, resolution = %resolution, error = %e, "finalization failed");
                    let (key, status, message) = (id.clone(), ctx.issue.status, e.to_string());
                    if let Err(record_err) = self
                        .store
                        .call(move |s| s.set_status(&key, status, Some(message)))
                        .await
                    {
                        warn!(issue = %id, error = %record_err, "failed to record finalize error");
                    }
                    return Err(e.into());
                }
            }
        }
    }

    /// Run a store operation, retrying unavailability without bound unless a
    /// cap is configured. Marks the issue STALLED once failures pile up.
    async fn with_storage<F, R>(
        &self,
        id: &IssueId,
        op: &'static str,
        f: F,
    ) -> Result<Storage<R>, ControllerError>
    where
        F: Fn(&dyn IssueStore) -> Result<R, StoreError> + Clone + Send + 'static,
        R: Send + 'static,
    {
        let mut failures = 0u32;
        loop {
            match self.store.call(f.clone()).await {
                Ok(value) => {
                    if failures >= self.settings.stall_after.max(1) {
                        self.clear_stall(id).await;
                    }
                    return Ok(Storage::Done(value));
                }
                Err(e) if !e.is_transient() => return Err(e.into()),
                Err(e) => {
                    failures += 1;
                    match self.storage_backoff(id, op, failures, &e).await {
                        Some(StepOutcome::Stalled { error }) => return Ok(Storage::GaveUp(error)),
                        Some(_) => return Ok(Storage::Aborted),
                        None => continue,
                    }
                }
            }
        }
    }

    /// Shared bookkeeping after a transient storage failure. Returns `None`
    /// when the caller should try again.
    async fn storage_backoff(
        &self,
        id: &IssueId,
        op: &'static str,
        failures: u32,
        error: &StoreError,
    ) -> Option<StepOutcome> {
        let delay = self.settings.storage_backoff.delay(failures);
        warn!(
            issue = %id,
            op,
            failures,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "storage unavailable, retrying"
        );

        if failures == self.settings.stall_after.max(1) {
            let (key, message) = (id.clone(), error.to_string());
            match self
                .store
                .call(move |s| s.set_status(&key, IssueStatus::Stalled, Some(message)))
                .await
            {
                Ok(_) => warn!(issue = %id, "issue marked STALLED"),
                Err(e) => debug!(issue = %id, error = %e, "could not mark issue STALLED"),
            }
        }

        if let Some(cap) = self.settings.give_up_after
            && failures >= cap
        {
            return Some(StepOutcome::Stalled {
                error: error.to_string(),
            });
        }

        if self.sleep_or_cancel(delay).await {
            return Some(StepOutcome::Aborted {
                phase: None,
                attempt: 0,
            });
        }
        None
    }

    async fn clear_stall(&self, id: &IssueId) {
        let key = id.clone();
        let result = self
            .store
            .call(move |s| {
                let ctx = s.read(&key)?;
                if ctx.issue.status == IssueStatus::Stalled {
                    s.set_status(&key, IssueStatus::InProgress, None)?;
                }
                Ok(())
            })
            .await;
        match result {
            Ok(()) => info!(issue = %id, "storage recovered"),
            Err(StoreError::NotActive(_)) => {}
            Err(e) => debug!(issue = %id, error = %e, "could not clear STALLED status"),
        }
    }

    /// Sleep for `delay`; true if cancelled first.
    async fn sleep_or_cancel(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}

/// Escalation record for worker output that breaks the worker contract.
fn protocol_violation(
    id: &IssueId,
    phase: Phase,
    attempt: u32,
    message: String,
    output: WorkerOutput,
    invocations: u32,
    failures: Vec<String>,
) -> NewRecord {
    let artifact = Artifact::new(
        id,
        phase,
        attempt,
        ArtifactKind::FailureReport,
        message.clone(),
        json!({
            "error": message,
            "worker_summary": output.summary,
            "worker_output": output.body,
            "changed_files": output.changed_files,
        }),
    );
    let mut record = NewRecord::new(phase, attempt, Verdict::Escalate, artifact);
    record.reported_verdict = Some(output.verdict);
    record.failure = Some(FailureRecord {
        kind: FailureKind::ProtocolViolation,
        message,
        invocations,
    });
    record.invocation_failures = failures;
    record
}

/// Rewrite reported paths relative to `root`. Absolute paths under `root` are
/// accepted; anything that resolves outside it is an error.
fn project_relative(root: &Path, files: &[PathBuf]) -> Result<Vec<PathBuf>, String> {
    let canonical_root = root.canonicalize().ok();
    files
        .iter()
        .map(|file| {
            let relative = if file.is_absolute() {
                file.strip_prefix(root)
                    .ok()
                    .or_else(|| {
                        canonical_root
                            .as_deref()
                            .and_then(|r| file.strip_prefix(r).ok())
                    })
                    .ok_or_else(|| {
                        format!("changed file {} is outside the project", file.display())
                    })?
            } else {
                file.as_path()
            };

            let mut normalized = PathBuf::new();
            for component in relative.components() {
                match component {
                    Component::Normal(part) => normalized.push(part),
                    Component::CurDir => {}
                    Component::ParentDir if normalized.pop() => {}
                    _ => {
                        return Err(format!(
                            "changed file {} is outside the project",
                            file.display()
                        ));
                    }
                }
            }
            if normalized.as_os_str().is_empty() {
                return Err(format!("changed file '{}' names no file", file.display()));
            }
            Ok(normalized)
        })
        .collect()
}

fn failure_record(
    id: &IssueId,
    phase: Phase,
    attempt: u32,
    kind: FailureKind,
    error: &WorkerError,
    invocations: u32,
    failures: Vec<String>,
) -> NewRecord {
    let message = error.to_string();
    let artifact = Artifact::new(
        id,
        phase,
        attempt,
        ArtifactKind::FailureReport,
        message.clone(),
        json!({
            "error": message,
            "kind": kind,
            "invocations": invocations,
            "retried_failures": failures,
        }),
    );
    let mut record = NewRecord::new(phase, attempt, Verdict::Escalate, artifact);
    record.failure = Some(FailureRecord {
        kind,
        message,
        invocations,
    });
    record.invocation_failures = failures;
    record
}
