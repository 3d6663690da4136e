//! Issue inspection commands: `mender status`, `mender show` and `mender replay`.

use anyhow::{Result, bail};
use console::style;
use std::path::Path;

use mender::config::{MENDER_DIR, MenderConfig};
use mender::issue::{IssueId, IssueStatus, WorkflowContext};
use mender::store::{FileIssueStore, IssueStore};
use mender::util::first_line;
use mender::workflow::transition::{self, NextStep, Target};

use super::super::Cli;
use super::run::styled_status;

fn open_store(project_dir: &Path) -> Result<Option<FileIssueStore>> {
    let mender_dir = project_dir.join(MENDER_DIR);
    if !mender_dir.is_dir() {
        println!();
        println!("No mender project found. Run 'mender init' first.");
        println!();
        return Ok(None);
    }
    Ok(Some(FileIssueStore::open(mender_dir.join("issues"))?))
}

fn read_issue(store: &FileIssueStore, id: &str) -> Result<WorkflowContext> {
    let id = IssueId::parse(id).map_err(anyhow::Error::msg)?;
    Ok(store.read(&id)?)
}

pub fn cmd_status(project_dir: &Path, filter: Option<&str>) -> Result<()> {
    let Some(store) = open_store(project_dir)? else {
        return Ok(());
    };
    let filter = filter
        .map(|s| s.parse::<IssueStatus>())
        .transpose()
        .map_err(anyhow::Error::msg)?;

    let issues = store.list(filter)?;
    if issues.is_empty() {
        println!();
        match filter {
            Some(status) => println!("No issues with status {}.", status),
            None => println!("No issues yet. Run 'mender start <issue-id>' to open one."),
        }
        println!();
        return Ok(());
    }

    println!();
    println!(
        "{:<32} {:<12} {:<10} {:<8} {:<20} Title",
        "Issue", "Status", "Phase", "Retries", "Updated"
    );
    println!(
        "{:<32} {:<12} {:<10} {:<8} {:<20} -----",
        "-----", "------", "-----", "-------", "-------"
    );
    for issue in &issues {
        println!(
            "{:<32} {:<12} {:<10} {:<8} {:<20} {}",
            issue.id,
            styled_status(issue.status),
            issue
                .current_phase
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            issue.retry_count,
            issue.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            issue.title
        );
        if let Some(error) = &issue.last_error {
            println!("  {}", style(format!("last error: {}", error)).dim());
        }
    }
    println!();

    let open = issues.iter().filter(|i| !i.status.is_terminal()).count();
    println!("{} issue(s), {} not archived", issues.len(), open);
    println!();
    Ok(())
}

pub fn cmd_show(project_dir: &Path, id: &str, json: bool) -> Result<()> {
    let Some(store) = open_store(project_dir)? else {
        return Ok(());
    };
    let ctx = read_issue(&store, id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&ctx)?);
        return Ok(());
    }

    let issue = &ctx.issue;
    println!();
    println!("{} {}", style(&issue.id).bold(), issue.title);
    println!("  Status:   {}", styled_status(issue.status));
    println!("  Created:  {}", issue.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Updated:  {}", issue.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Retries:  {}", issue.retry_count);
    if let Some(archived) = issue.archived_at {
        println!("  Archived: {}", archived.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(commit) = &issue.commit {
        println!("  Commit:   {}", commit);
    }
    if let Some(error) = &issue.last_error {
        println!("  Error:    {}", style(error).red());
    }
    println!();

    if ctx.records.is_empty() {
        println!("No phase records yet.");
        println!();
        return Ok(());
    }

    println!("{:<4} {:<10} {:<8} {:<18} Summary", "#", "Phase", "Attempt", "Verdict");
    println!("{:<4} {:<10} {:<8} {:<18} -------", "-", "-----", "-------", "-------");
    for doc in &ctx.records {
        let record = &doc.record;
        let verdict = match record.reported_verdict {
            Some(reported) => format!("{} ({})", record.verdict, reported),
            None => record.verdict.to_string(),
        };
        println!(
            "{:<4} {:<10} {:<8} {:<18} {}",
            record.sequence,
            record.phase,
            record.attempt,
            verdict,
            first_line(&doc.artifact.summary, 80)
        );
        for failure in &record.invocation_failures {
            println!("     {}", style(format!("retried: {}", failure)).dim());
        }
        for finding in &doc.findings {
            println!("     {}", style(format!("finding: {}", finding.summary)).dim());
        }
    }
    println!();

    if let Some(failure) = ctx.failure() {
        println!(
            "Failure: {} ({:?}, {} invocation(s))",
            style(&failure.message).red(),
            failure.kind,
            failure.invocations
        );
        println!();
    }
    Ok(())
}

pub fn cmd_replay(cli: &Cli, project_dir: &Path, id: &str) -> Result<()> {
    let Some(store) = open_store(project_dir)? else {
        return Ok(());
    };
    let ctx = read_issue(&store, id)?;
    let config = MenderConfig::with_cli_args(
        project_dir.to_path_buf(),
        cli.verbose,
        cli.max_retries,
        cli.timeout,
        cli.no_commit,
    )?;

    let report = match transition::replay(&ctx.records, config.max_verify_retries()) {
        Ok(report) => report,
        Err(e) => bail!("Record log of {} is invalid: {}", ctx.issue.id, e),
    };

    println!();
    for step in &report.transitions {
        let target = match step.target {
            Target::Phase(phase) => phase.to_string(),
            Target::Terminal(resolution) => resolution.to_string(),
        };
        println!(
            "#{:<3} {:<10} attempt {:<3} {:<17} -> {}",
            step.sequence, step.phase, step.attempt, step.verdict, target
        );
    }
    let next = match report.next {
        NextStep::Invoke { phase, attempt } => format!("invoke {} attempt {}", phase, attempt),
        NextStep::Archive(resolution) if ctx.issue.status.is_terminal() => {
            format!("archived as {}", resolution)
        }
        NextStep::Archive(resolution) => format!("finalize as {}", resolution),
        NextStep::Done(resolution) => format!("archived as {}", resolution),
    };
    println!();
    println!(
        "{} {} record(s) valid; next: {}",
        style("OK").green(),
        report.transitions.len(),
        next
    );
    println!();
    Ok(())
}
