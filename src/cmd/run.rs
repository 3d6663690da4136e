//! Issue driving commands: `mender start`, `mender resume` and `mender trigger`.

use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use mender::config::MenderConfig;
use mender::errors::ControllerError;
use mender::issue::{IssueId, IssueStatus, Phase};
use mender::store::{FileIssueStore, StoreHandle};
use mender::trigger::{self, TriggerRequest};
use mender::worker::{ScriptedWorker, WorkerSet};
use mender::workflow::{PhaseController, RunOutcome};

use super::super::Cli;

/// Everything needed to build one controller per issue.
struct Runtime {
    config: MenderConfig,
    store: StoreHandle,
    workers: WorkerSet,
    cancel: CancellationToken,
}

impl Runtime {
    fn new(cli: &Cli, project_dir: &Path) -> Result<Self> {
        let config = MenderConfig::with_cli_args(
            project_dir.to_path_buf(),
            cli.verbose,
            cli.max_retries,
            cli.timeout,
            cli.no_commit,
        )?;
        let store = FileIssueStore::open(config.issues_dir())
            .context("Failed to open issue store (run `mender init` first?)")?;

        let workers = match &cli.script {
            Some(path) => WorkerSet::uniform(Arc::new(ScriptedWorker::load(path)?)),
            None => WorkerSet::from_config(&config),
        };
        let missing: Vec<&str> = Phase::ALL
            .iter()
            .filter(|p| workers.get(**p).is_none())
            .map(|p| p.slug())
            .collect();
        if !missing.is_empty() {
            bail!(
                "No worker configured for: {}. Set [workers] in mender.toml, MENDER_WORKER_CMD, or pass --script.",
                missing.join(", ")
            );
        }

        Ok(Self {
            config,
            store: StoreHandle::new(store),
            workers,
            cancel: cancel_on_ctrl_c(),
        })
    }

    fn controller(&self) -> PhaseController {
        PhaseController::from_config(&self.config, self.store.clone(), self.workers.clone())
            .with_cancellation(self.cancel.clone())
    }
}

/// Cancel in-flight work on SIGINT. The current attempt is dropped unpersisted.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting the current attempt");
            child.cancel();
        }
    });
    token
}

pub async fn cmd_start(
    cli: &Cli,
    project_dir: &Path,
    id: Option<&str>,
    title: Option<&str>,
) -> Result<()> {
    let issue_id = match (id, title) {
        (Some(id), _) => IssueId::parse(id).map_err(anyhow::Error::msg)?,
        (None, Some(title)) => IssueId::from_title(title).map_err(anyhow::Error::msg)?,
        (None, None) => bail!("Either an issue id or --title is required"),
    };
    let title = title.map(str::to_string).unwrap_or_else(|| issue_id.to_string());

    let runtime = Runtime::new(cli, project_dir)?;
    let request = TriggerRequest::start(issue_id.clone(), Some(title));
    let outcome = trigger::dispatch(&runtime.controller(), &request).await;
    report(&[(issue_id, outcome)])
}

pub async fn cmd_resume(cli: &Cli, project_dir: &Path, id: Option<&str>, all: bool) -> Result<()> {
    let runtime = Runtime::new(cli, project_dir)?;

    let requests: Vec<TriggerRequest> = if all {
        runtime
            .store
            .call(|s| s.list(None))
            .await?
            .into_iter()
            .filter(|issue| !issue.status.is_terminal())
            .map(|issue| TriggerRequest::resume(issue.id))
            .collect()
    } else {
        let Some(id) = id else {
            bail!("Either an issue id or --all is required");
        };
        vec![TriggerRequest::resume(
            IssueId::parse(id).map_err(anyhow::Error::msg)?,
        )]
    };

    if requests.is_empty() {
        println!("No unfinished issues to resume.");
        return Ok(());
    }

    let results = trigger::run_many(|| runtime.controller(), requests).await;
    report(&results)
}

pub async fn cmd_trigger(cli: &Cli, project_dir: &Path, raw: &[String]) -> Result<()> {
    let requests = raw
        .iter()
        .map(|json| {
            TriggerRequest::parse(json).with_context(|| format!("Invalid trigger request: {}", json))
        })
        .collect::<Result<Vec<_>>>()?;

    let runtime = Runtime::new(cli, project_dir)?;
    let results = trigger::run_many(|| runtime.controller(), requests).await;
    report(&results)
}

/// Print one line per issue. Errors and stalls make the command fail.
fn report(results: &[(IssueId, Result<RunOutcome, ControllerError>)]) -> Result<()> {
    let mut failed = 0;
    println!();
    for (id, result) in results {
        match result {
            Ok(RunOutcome::Finished(issue)) => {
                print!("{:<32} {}", style(id).bold(), styled_status(issue.status));
                if let Some(commit) = &issue.commit {
                    print!("  commit {}", &commit[..commit.len().min(10)]);
                }
                println!();
            }
            Ok(RunOutcome::Aborted { phase, attempt }) => {
                let at = match phase {
                    Some(phase) => format!("during {} attempt {}", phase, attempt),
                    None => "before the next step".to_string(),
                };
                println!(
                    "{:<32} {} {}; run `mender resume {}` to continue",
                    style(id).bold(),
                    style("ABORTED").yellow(),
                    at,
                    id
                );
            }
            Ok(RunOutcome::Stalled { error, .. }) => {
                failed += 1;
                println!(
                    "{:<32} {} {}",
                    style(id).bold(),
                    styled_status(IssueStatus::Stalled),
                    error
                );
            }
            Err(e) => {
                failed += 1;
                println!("{:<32} {} {}", style(id).bold(), style("ERROR").red(), e);
            }
        }
    }
    println!();

    if failed > 0 {
        bail!("{} of {} issue(s) did not finish", failed, results.len());
    }
    Ok(())
}

pub(super) fn styled_status(status: IssueStatus) -> console::StyledObject<&'static str> {
    let text = status.as_str();
    match status {
        IssueStatus::Resolved => style(text).green(),
        IssueStatus::Rejected => style(text).yellow(),
        IssueStatus::Escalated | IssueStatus::Stalled => style(text).red(),
        IssueStatus::Open | IssueStatus::InProgress => style(text).cyan(),
    }
}
