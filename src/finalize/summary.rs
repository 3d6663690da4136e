//! Summary document synthesized from the Phase Record chain.

use std::fmt::Write as _;

use serde_json::{Value, json};

use crate::issue::{ArtifactKind, Phase, Resolution, WorkflowContext};
use crate::util::first_line;

const TABLE_SUMMARY_CHARS: usize = 80;

/// Markdown summary for humans, written to the archive and, for resolved
/// issues, committed next to the code change.
pub fn render_markdown(ctx: &WorkflowContext, resolution: Resolution) -> String {
    let issue = &ctx.issue;
    let mut out = String::new();

    let _ = writeln!(out, "# {}", issue.title);
    let _ = writeln!(out);
    let _ = writeln!(out, "- **Issue:** `{}`", issue.id);
    let _ = writeln!(out, "- **Resolution:** {}", resolution);
    let _ = writeln!(out, "- **Opened:** {}", issue.created_at.to_rfc3339());
    let _ = writeln!(
        out,
        "- **Implement/verify iterations:** {}",
        ctx.attempts(Phase::Implement)
    );
    let _ = writeln!(out);

    let _ = writeln!(out, "## Phase Records");
    let _ = writeln!(out);
    if ctx.records.is_empty() {
        let _ = writeln!(out, "_No phase completed._");
    } else {
        let _ = writeln!(out, "| # | Phase | Attempt | Verdict | Summary |");
        let _ = writeln!(out, "|---|-------|---------|---------|---------|");
        for doc in &ctx.records {
            let r = &doc.record;
            let verdict = match r.reported_verdict {
                Some(reported) if reported != r.verdict => {
                    format!("{} (reported {})", r.verdict, reported)
                }
                _ => r.verdict.to_string(),
            };
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} |",
                r.sequence,
                r.phase,
                r.attempt,
                verdict,
                first_line(&doc.artifact.summary, TABLE_SUMMARY_CHARS).replace('|', "\\|")
            );
        }
    }

    match resolution {
        Resolution::Rejected => {
            if let Some(doc) = ctx.records_for(Phase::Validate).last() {
                let _ = writeln!(out);
                let _ = writeln!(out, "## Rejection");
                let _ = writeln!(out);
                let _ = writeln!(out, "{}", doc.artifact.summary);
            }
        }
        Resolution::Escalated => {
            let _ = writeln!(out);
            let _ = writeln!(out, "## Escalation");
            let _ = writeln!(out);
            match ctx.failure() {
                Some(failure) => {
                    let _ = writeln!(
                        out,
                        "**{:?}** after {} invocation(s): {}",
                        failure.kind, failure.invocations, failure.message
                    );
                }
                None => {
                    let reason = ctx
                        .last()
                        .map(|d| format!("{} returned {}", d.record.phase, d.record.verdict))
                        .unwrap_or_else(|| "no phase record".to_string());
                    let _ = writeln!(out, "{}", reason);
                }
            }
            if let Some(notice) = ctx
                .records
                .iter()
                .rev()
                .find(|d| d.artifact.kind == ArtifactKind::EscalationNotice)
            {
                let _ = writeln!(out);
                let _ = writeln!(out, "```text");
                let _ = writeln!(out, "{}", notice.artifact.summary);
                let _ = writeln!(out, "```");
            }
        }
        Resolution::Resolved => {
            let files = ctx.changed_files();
            if !files.is_empty() {
                let _ = writeln!(out);
                let _ = writeln!(out, "## Changed Files");
                let _ = writeln!(out);
                for file in files {
                    let _ = writeln!(out, "- `{}`", file.display());
                }
            }
        }
    }

    let findings: Vec<_> = ctx.findings().collect();
    if !findings.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Findings");
        let _ = writeln!(out);
        for (record, finding) in findings {
            let _ = writeln!(out, "- [{}] {}", record.phase, finding.summary);
            if let Some(detail) = &finding.detail {
                let _ = writeln!(out, "  {}", detail);
            }
        }
    }

    let failures: Vec<_> = ctx
        .records
        .iter()
        .flat_map(|d| d.record.invocation_failures.iter().map(move |f| (&d.record, f)))
        .collect();
    if !failures.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Retried Invocation Failures");
        let _ = writeln!(out);
        for (record, failure) in failures {
            let _ = writeln!(out, "- {} attempt {}: {}", record.phase, record.attempt, failure);
        }
    }

    out
}

/// Machine-readable companion of [`render_markdown`].
pub fn render_json(ctx: &WorkflowContext, resolution: Resolution) -> Value {
    let records: Vec<Value> = ctx
        .records
        .iter()
        .map(|d| {
            json!({
                "sequence": d.record.sequence,
                "phase": d.record.phase,
                "attempt": d.record.attempt,
                "verdict": d.record.verdict,
                "reported_verdict": d.record.reported_verdict,
                "artifact": d.record.artifact,
                "summary": d.artifact.summary,
            })
        })
        .collect();
    let findings: Vec<Value> = ctx
        .findings()
        .map(|(r, f)| json!({"phase": r.phase, "attempt": r.attempt, "finding": f}))
        .collect();

    json!({
        "issue": ctx.issue.id,
        "title": ctx.issue.title,
        "resolution": resolution,
        "implement_attempts": ctx.attempts(Phase::Implement),
        "records": records,
        "findings": findings,
        "failure": ctx.failure(),
        "changed_files": ctx.changed_files(),
    })
}
