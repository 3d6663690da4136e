//! Archival/finalization transaction.
//!
//! For every terminal outcome the full Workflow Context is snapshotted into the
//! archive together with a synthesized summary and the terminal status. A
//! RESOLVED issue additionally gets one commit bundling the IMPLEMENT changes
//! with the summary document. The store's archive rename is the commit point,
//! so a failure anywhere before it leaves the issue in its pre-finalize state;
//! a git commit made ahead of a failed archive is moved back off the branch.

pub mod summary;

use std::path::PathBuf;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::{CommitSection, MenderConfig};
use crate::errors::FinalizeError;
use crate::issue::{Issue, IssueId, Phase, Resolution, WorkflowContext};
use crate::store::{ArchiveBundle, IssueStore};
use crate::tracker::GitCommitter;
use crate::util::first_line;

const SUBJECT_MAX_CHARS: usize = 72;

#[derive(Debug, Clone)]
pub struct Finalizer {
    project_dir: PathBuf,
    commit: CommitSection,
    commit_enabled: bool,
}

impl Finalizer {
    pub fn new(project_dir: PathBuf, commit: CommitSection, commit_enabled: bool) -> Self {
        Self {
            project_dir,
            commit,
            commit_enabled,
        }
    }

    pub fn from_config(config: &MenderConfig) -> Self {
        Self::new(
            config.project_dir.clone(),
            config.toml.commit.clone(),
            config.commit_enabled(),
        )
    }

    /// Deterministic commit message: `<type>: <short description>` plus the issue reference.
    pub fn commit_message(&self, ctx: &WorkflowContext) -> String {
        let finalize = ctx.records_for(Phase::Finalize).last();
        let commit_type = finalize
            .and_then(|d| d.commit_type.clone())
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| self.commit.default_type.clone());
        let description = finalize
            .map(|d| d.artifact.summary.as_str())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&ctx.issue.title);
        let budget = SUBJECT_MAX_CHARS.saturating_sub(commit_type.len() + 2);
        format!(
            "{}: {}\n\nRefs: {}",
            commit_type,
            first_line(description, budget),
            ctx.issue.id
        )
    }

    /// Path of the committed summary document, relative to the project root.
    pub fn summary_path(&self, id: &IssueId) -> PathBuf {
        self.commit.summary_dir.join(format!("{}.md", id))
    }

    /// Assemble everything the archive receives, without touching any storage.
    pub fn bundle(
        &self,
        ctx: &WorkflowContext,
        resolution: Resolution,
        commit: Option<String>,
    ) -> ArchiveBundle {
        let mut issue = ctx.issue.clone();
        let now = Utc::now();
        issue.status = resolution.status();
        issue.resolution = Some(resolution);
        issue.archived_at = Some(now);
        issue.updated_at = now;
        issue.last_error = None;
        issue.commit = commit;
        issue.current_phase = ctx.last().map(|d| d.record.phase);
        issue.retry_count = ctx.attempts(Phase::Implement);

        ArchiveBundle {
            issue,
            context: ctx.clone(),
            summary_markdown: summary::render_markdown(ctx, resolution),
            summary_json: summary::render_json(ctx, resolution),
        }
    }

    /// Run the whole transaction against `store`. Blocking: call it from a
    /// blocking context.
    pub fn finalize(
        &self,
        store: &dyn IssueStore,
        id: &IssueId,
        resolution: Resolution,
    ) -> Result<Issue, FinalizeError> {
        let ctx = store.read(id)?;
        if ctx.issue.status.is_terminal() {
            return Ok(ctx.issue);
        }

        let commit = if resolution == Resolution::Resolved && self.commit_enabled {
            Some(self.commit_resolution(&ctx)?)
        } else {
            None
        };

        let bundle = self.bundle(&ctx, resolution, commit.clone());
        let issue = match store.archive(id, bundle) {
            Ok(issue) => issue,
            Err(e) => {
                if let Some(sha) = &commit {
                    self.roll_back_commit(id, sha);
                }
                return Err(e.into());
            }
        };
        info!(
            issue = %id,
            resolution = %resolution,
            commit = issue.commit.as_deref().unwrap_or("-"),
            "issue finalized"
        );
        Ok(issue)
    }

    /// Take back a commit whose archive step failed. If HEAD has moved on, the
    /// commit stays and the retry finds it again by its message.
    fn roll_back_commit(&self, id: &IssueId, sha: &str) {
        match GitCommitter::open(&self.project_dir).and_then(|git| git.revert_head(sha)) {
            Ok(true) => info!(issue = %id, commit = sha, "rolled back commit of unarchived issue"),
            Ok(false) => warn!(
                issue = %id,
                commit = sha,
                "commit is no longer HEAD; it will be reused when finalization is retried"
            ),
            Err(e) => warn!(issue = %id, commit = sha, error = %e, "failed to roll back commit"),
        }
    }

    /// Write the summary into the project tree and commit it with the changed files.
    fn commit_resolution(&self, ctx: &WorkflowContext) -> Result<String, FinalizeError> {
        let relative = self.summary_path(ctx.issue_id());
        let absolute = self.project_dir.join(&relative);
        let markdown = summary::render_markdown(ctx, Resolution::Resolved);

        let existed = absolute.exists();
        if let Some(parent) = absolute.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FinalizeError::Render(format!("{}: {}", parent.display(), e)))?;
        }
        std::fs::write(&absolute, &markdown)
            .map_err(|e| FinalizeError::Render(format!("{}: {}", absolute.display(), e)))?;

        let mut paths = ctx.changed_files();
        paths.push(relative);
        let message = self.commit_message(ctx);

        let result = GitCommitter::open(&self.project_dir).and_then(|git| {
            git.with_author(&self.commit.author_name, &self.commit.author_email)
                .commit_paths(&paths, &message)
        });
        if result.is_err() && !existed {
            // Nothing committed: take back the summary file as well.
            if let Err(e) = std::fs::remove_file(&absolute) {
                warn!(path = %absolute.display(), error = %e, "failed to remove uncommitted summary");
            }
        }
        result
    }
}
