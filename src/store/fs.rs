//! Filesystem-backed issue store.
//!
//! Layout under the store root (normally `.mender/issues`):
//!
//! ```text
//! active/<issue>/issue.json
//! active/<issue>/records/<phase>-<attempt>.json
//! active/<issue>/.lock
//! archive/<issue>/{issue.json,context.json,summary.md,summary.json}
//! archive/.staging/<issue>/
//! ```
//!
//! Every document is written to a hidden temp file and renamed into place, and
//! readers skip hidden files, so a partially written document is never visible.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{AppendOutcome, ArchiveBundle, IssueStore};
use crate::errors::StoreError;
use crate::issue::{
    Issue, IssueId, IssueStatus, NewRecord, Phase, RecordDocument, WorkflowContext,
};

const ISSUE_FILE: &str = "issue.json";
const CONTEXT_FILE: &str = "context.json";
const SUMMARY_MD: &str = "summary.md";
const SUMMARY_JSON: &str = "summary.json";
const RECORDS_DIR: &str = "records";
const LOCK_FILE: &str = ".lock";
const STAGING_DIR: &str = ".staging";

pub struct FileIssueStore {
    root: PathBuf,
}

impl FileIssueStore {
    /// Open (or create) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in [root.join("active"), root.join("archive")] {
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn active_dir(&self, id: &IssueId) -> PathBuf {
        self.root.join("active").join(id.as_str())
    }

    fn archive_dir(&self, id: &IssueId) -> PathBuf {
        self.root.join("archive").join(id.as_str())
    }

    fn staging_dir(&self, id: &IssueId) -> PathBuf {
        self.root.join("archive").join(STAGING_DIR).join(id.as_str())
    }

    fn record_path(&self, id: &IssueId, phase: Phase, attempt: u32) -> PathBuf {
        self.active_dir(id)
            .join(RECORDS_DIR)
            .join(format!("{}-{}.json", phase.slug(), attempt))
    }

    /// Take the per-issue exclusive lock. Released when the file is dropped.
    fn lock(&self, id: &IssueId) -> Result<File, StoreError> {
        let path = self.active_dir(id).join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.lock_exclusive().map_err(|e| StoreError::io(&path, e))?;
        Ok(file)
    }

    /// Fail unless the issue is in the active partition.
    fn ensure_active(&self, id: &IssueId) -> Result<(), StoreError> {
        if self.archive_dir(id).exists() {
            return Err(StoreError::NotActive(id.clone()));
        }
        if !self.active_dir(id).join(ISSUE_FILE).exists() {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(())
    }

    fn read_active(&self, id: &IssueId) -> Result<WorkflowContext, StoreError> {
        let dir = self.active_dir(id);
        let mut issue: Issue = read_json(&dir.join(ISSUE_FILE))?;
        let records = read_records(&dir.join(RECORDS_DIR))?;

        // issue.json is a cache; the record chain is authoritative.
        issue.current_phase = records.last().map(|d| d.record.phase);
        issue.retry_count = records
            .iter()
            .filter(|d| d.record.phase == Phase::Implement)
            .count() as u32;
        if issue.status == IssueStatus::Open && !records.is_empty() {
            issue.status = IssueStatus::InProgress;
        }

        Ok(WorkflowContext { issue, records })
    }

    fn read_archived(&self, id: &IssueId) -> Result<WorkflowContext, StoreError> {
        let dir = self.archive_dir(id);
        let issue: Issue = read_json(&dir.join(ISSUE_FILE))?;
        let context: WorkflowContext = read_json(&dir.join(CONTEXT_FILE))?;

        // A crash after the archive rename can leave the active copy behind.
        let leftover = self.active_dir(id);
        if leftover.exists() {
            debug!(issue = %id, "removing active copy of archived issue");
            if let Err(e) = fs::remove_dir_all(&leftover) {
                warn!(issue = %id, error = %e, "failed to remove leftover active directory");
            }
        }

        Ok(WorkflowContext {
            issue,
            records: context.records,
        })
    }

    /// First half of archiving: write the complete bundle into the staging area.
    /// Nothing is visible to readers until [`Self::commit_archive`] renames it.
    pub(crate) fn stage_archive(
        &self,
        id: &IssueId,
        bundle: &ArchiveBundle,
    ) -> Result<PathBuf, StoreError> {
        let staging = self.staging_dir(id);
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| StoreError::io(&staging, e))?;
        }
        fs::create_dir_all(&staging).map_err(|e| StoreError::io(&staging, e))?;

        write_json(&staging.join(CONTEXT_FILE), &bundle.context)?;
        write_json(&staging.join(SUMMARY_JSON), &bundle.summary_json)?;
        write_atomic(&staging.join(SUMMARY_MD), bundle.summary_markdown.as_bytes())?;
        write_json(&staging.join(ISSUE_FILE), &bundle.issue)?;
        Ok(staging)
    }

    /// Second half of archiving: the rename is the commit point.
    pub(crate) fn commit_archive(&self, id: &IssueId, staged: &Path) -> Result<(), StoreError> {
        let target = self.archive_dir(id);
        fs::rename(staged, &target).map_err(|e| StoreError::io(&target, e))?;

        let active = self.active_dir(id);
        if let Err(e) = fs::remove_dir_all(&active) {
            warn!(issue = %id, error = %e, "archived issue but failed to clean active directory");
        }
        Ok(())
    }

    fn issue_ids(&self, partition: &str) -> Result<Vec<IssueId>, StoreError> {
        let dir = self.root.join(partition);
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            match IssueId::parse(&name) {
                Ok(id) => ids.push(id),
                Err(e) => warn!(dir = %entry.path().display(), error = %e, "skipping unknown entry"),
            }
        }
        Ok(ids)
    }
}

impl IssueStore for FileIssueStore {
    fn create(&self, id: &IssueId, title: &str) -> Result<Issue, StoreError> {
        if self.archive_dir(id).exists() {
            return Err(StoreError::AlreadyExists(id.clone()));
        }
        let dir = self.active_dir(id);
        // create_dir (not _all) is the exclusivity check between racing creators.
        if let Err(e) = fs::create_dir(&dir) {
            return Err(if e.kind() == std::io::ErrorKind::AlreadyExists {
                StoreError::AlreadyExists(id.clone())
            } else {
                StoreError::io(&dir, e)
            });
        }
        let records = dir.join(RECORDS_DIR);
        fs::create_dir_all(&records).map_err(|e| StoreError::io(&records, e))?;

        let issue = Issue::new(id.clone(), title);
        write_json(&dir.join(ISSUE_FILE), &issue)?;
        debug!(issue = %id, "created issue");
        Ok(issue)
    }

    fn append(&self, id: &IssueId, record: NewRecord) -> Result<AppendOutcome, StoreError> {
        self.ensure_active(id)?;
        let _guard = self.lock(id)?;
        // The archive may have landed while we waited for the lock.
        self.ensure_active(id)?;

        let path = self.record_path(id, record.phase, record.attempt);
        if path.exists() {
            let existing: RecordDocument = read_json(&path)?;
            debug!(issue = %id, phase = %record.phase, attempt = record.attempt, "duplicate append ignored");
            return Ok(AppendOutcome::Duplicate(existing));
        }

        let dir = self.active_dir(id);
        let existing = read_records(&dir.join(RECORDS_DIR))?;
        let sequence = existing.len() as u32 + 1;
        let doc = record.into_document(sequence);
        write_json(&path, &doc)?;

        let issue_path = dir.join(ISSUE_FILE);
        let mut issue: Issue = read_json(&issue_path)?;
        issue.current_phase = Some(doc.record.phase);
        issue.retry_count = existing
            .iter()
            .chain(std::iter::once(&doc))
            .filter(|d| d.record.phase == Phase::Implement)
            .count() as u32;
        if matches!(issue.status, IssueStatus::Open | IssueStatus::Stalled) {
            issue.status = IssueStatus::InProgress;
        }
        issue.last_error = None;
        issue.updated_at = doc.record.timestamp;
        write_json(&issue_path, &issue)?;

        Ok(AppendOutcome::Appended(doc))
    }

    fn read(&self, id: &IssueId) -> Result<WorkflowContext, StoreError> {
        if self.archive_dir(id).join(ISSUE_FILE).exists() {
            return self.read_archived(id);
        }
        if !self.active_dir(id).join(ISSUE_FILE).exists() {
            return Err(StoreError::NotFound(id.clone()));
        }
        self.read_active(id)
    }

    fn set_status(
        &self,
        id: &IssueId,
        status: IssueStatus,
        last_error: Option<String>,
    ) -> Result<Issue, StoreError> {
        self.ensure_active(id)?;
        let _guard = self.lock(id)?;

        let path = self.active_dir(id).join(ISSUE_FILE);
        let mut issue: Issue = read_json(&path)?;
        issue.status = status;
        issue.last_error = last_error;
        issue.updated_at = chrono::Utc::now();
        write_json(&path, &issue)?;
        Ok(issue)
    }

    fn archive(&self, id: &IssueId, bundle: ArchiveBundle) -> Result<Issue, StoreError> {
        self.ensure_active(id)?;
        let _guard = self.lock(id)?;
        self.ensure_active(id)?;

        let staged = self.stage_archive(id, &bundle)?;
        self.commit_archive(id, &staged)?;
        debug!(issue = %id, status = %bundle.issue.status, "archived issue");
        Ok(bundle.issue)
    }

    fn list(&self, status: Option<IssueStatus>) -> Result<Vec<Issue>, StoreError> {
        let archived = self.issue_ids("archive")?;
        let mut issues = Vec::new();
        for id in &archived {
            let read = read_json::<Issue>(&self.archive_dir(id).join(ISSUE_FILE));
            if let Some(issue) = skip_corrupt(id, read)? {
                issues.push(issue);
            }
        }
        for id in self.issue_ids("active")? {
            if archived.contains(&id) || !self.active_dir(&id).join(ISSUE_FILE).exists() {
                continue;
            }
            if let Some(ctx) = skip_corrupt(&id, self.read_active(&id))? {
                issues.push(ctx.issue);
            }
        }

        issues.retain(|issue| status.is_none_or(|s| issue.status == s));
        issues.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(issues)
    }
}

/// One unreadable issue must not hide the others from a listing.
fn skip_corrupt<T>(id: &IssueId, read: Result<T, StoreError>) -> Result<Option<T>, StoreError> {
    match read {
        Ok(value) => Ok(Some(value)),
        Err(e @ StoreError::Corrupt { .. }) => {
            warn!(issue = %id, error = %e, "skipping unreadable issue");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let content = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json)
}

/// Write to a hidden sibling and rename over the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.tmp-{}", name, Uuid::new_v4().simple()));

    let write = || -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        std::io::Write::write_all(&mut file, bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StoreError::io(path, e)
    })
}

/// All committed record documents in a records directory, ordered by sequence.
fn read_records(dir: &Path) -> Result<Vec<RecordDocument>, StoreError> {
    let entries = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
    let mut docs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || !name.ends_with(".json") {
            continue;
        }
        docs.push(read_json::<RecordDocument>(&entry.path())?);
    }
    docs.sort_by_key(|d| d.record.sequence);
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::{Artifact, ArtifactKind, Resolution, Verdict};
    use serde_json::json;
    use tempfile::tempdir;

    fn setup() -> (FileIssueStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = FileIssueStore::open(dir.path().join("issues")).unwrap();
        (store, dir)
    }

    fn id(s: &str) -> IssueId {
        IssueId::parse(s).unwrap()
    }

    fn record(issue: &IssueId, phase: Phase, attempt: u32, verdict: Verdict) -> NewRecord {
        let artifact = Artifact::new(
            issue,
            phase,
            attempt,
            ArtifactKind::PhaseOutput,
            format!("{} attempt {}", phase, attempt),
            json!({"phase": phase.slug()}),
        );
        NewRecord::new(phase, attempt, verdict, artifact)
    }

    fn bundle_for(store: &FileIssueStore, issue: &IssueId, resolution: Resolution) -> ArchiveBundle {
        let context = store.read(issue).unwrap();
        let mut final_issue = context.issue.clone();
        final_issue.status = resolution.status();
        final_issue.resolution = Some(resolution);
        ArchiveBundle {
            issue: final_issue,
            context,
            summary_markdown: "# summary".to_string(),
            summary_json: json!({"resolution": resolution}),
        }
    }

    #[test]
    fn test_create_and_read_empty_issue() {
        let (store, _dir) = setup();
        let issue = id("fix-timeout-bug");
        let created = store.create(&issue, "Fix timeout bug").unwrap();
        assert_eq!(created.status, IssueStatus::Open);

        let ctx = store.read(&issue).unwrap();
        assert_eq!(ctx.issue.title, "Fix timeout bug");
        assert!(ctx.records.is_empty());
        assert!(ctx.issue.current_phase.is_none());
    }

    #[test]
    fn test_create_twice_fails() {
        let (store, _dir) = setup();
        let issue = id("dup");
        store.create(&issue, "first").unwrap();
        assert!(matches!(
            store.create(&issue, "second"),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_read_missing_issue() {
        let (store, _dir) = setup();
        assert!(matches!(
            store.read(&id("nope")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_append_orders_records_and_updates_issue() {
        let (store, _dir) = setup();
        let issue = id("fix-timeout-bug");
        store.create(&issue, "t").unwrap();

        store
            .append(&issue, record(&issue, Phase::Research, 1, Verdict::Continue))
            .unwrap();
        store
            .append(&issue, record(&issue, Phase::Validate, 1, Verdict::Continue))
            .unwrap();
        store
            .append(&issue, record(&issue, Phase::Propose, 1, Verdict::Continue))
            .unwrap();

        let ctx = store.read(&issue).unwrap();
        let phases: Vec<Phase> = ctx.records.iter().map(|d| d.record.phase).collect();
        assert_eq!(phases, vec![Phase::Research, Phase::Validate, Phase::Propose]);
        let sequences: Vec<u32> = ctx.records.iter().map(|d| d.record.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(ctx.issue.status, IssueStatus::InProgress);
        assert_eq!(ctx.issue.current_phase, Some(Phase::Propose));
        assert!(ctx.records.iter().all(|d| d.artifact.verify_digest()));
    }

    #[test]
    fn test_append_is_idempotent_on_phase_attempt() {
        let (store, _dir) = setup();
        let issue = id("fix-timeout-bug");
        store.create(&issue, "t").unwrap();

        let first = store
            .append(&issue, record(&issue, Phase::Research, 1, Verdict::Continue))
            .unwrap();
        assert!(!first.is_duplicate());

        // A second invocation's output for the same key must not replace the first.
        let second = store
            .append(&issue, record(&issue, Phase::Research, 1, Verdict::Escalate))
            .unwrap();
        assert!(second.is_duplicate());
        assert_eq!(second.document().record.verdict, Verdict::Continue);

        let ctx = store.read(&issue).unwrap();
        assert_eq!(ctx.records.len(), 1);
    }

    #[test]
    fn test_concurrent_appends_same_key_persist_once() {
        let (store, _dir) = setup();
        let store = std::sync::Arc::new(store);
        let issue = id("racy");
        store.create(&issue, "t").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let issue = issue.clone();
                std::thread::spawn(move || {
                    store
                        .append(&issue, record(&issue, Phase::Research, 1, Verdict::Continue))
                        .unwrap()
                })
            })
            .collect();
        let outcomes: Vec<AppendOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(outcomes.iter().filter(|o| !o.is_duplicate()).count(), 1);
        assert_eq!(store.read(&issue).unwrap().records.len(), 1);
    }

    #[test]
    fn test_hidden_temp_files_are_invisible() {
        let (store, _dir) = setup();
        let issue = id("partial");
        store.create(&issue, "t").unwrap();
        let records = store.active_dir(&issue).join(RECORDS_DIR);
        fs::write(records.join(".research-1.json.tmp-abc"), "{ half written").unwrap();

        let ctx = store.read(&issue).unwrap();
        assert!(ctx.records.is_empty());
    }

    #[test]
    fn test_set_status_records_error() {
        let (store, _dir) = setup();
        let issue = id("stall-me");
        store.create(&issue, "t").unwrap();
        let updated = store
            .set_status(&issue, IssueStatus::Stalled, Some("disk full".into()))
            .unwrap();
        assert_eq!(updated.status, IssueStatus::Stalled);

        let ctx = store.read(&issue).unwrap();
        assert_eq!(ctx.issue.status, IssueStatus::Stalled);
        assert_eq!(ctx.issue.last_error.as_deref(), Some("disk full"));

        // A successful append recovers the issue.
        store
            .append(&issue, record(&issue, Phase::Research, 1, Verdict::Continue))
            .unwrap();
        let ctx = store.read(&issue).unwrap();
        assert_eq!(ctx.issue.status, IssueStatus::InProgress);
        assert!(ctx.issue.last_error.is_none());
    }

    #[test]
    fn test_archive_moves_issue_and_blocks_appends() {
        let (store, _dir) = setup();
        let issue = id("not-a-bug-report");
        store.create(&issue, "t").unwrap();
        store
            .append(&issue, record(&issue, Phase::Research, 1, Verdict::Continue))
            .unwrap();
        store
            .append(&issue, record(&issue, Phase::Validate, 1, Verdict::Reject))
            .unwrap();

        let bundle = bundle_for(&store, &issue, Resolution::Rejected);
        store.archive(&issue, bundle).unwrap();

        assert!(!store.active_dir(&issue).exists());
        assert!(store.archive_dir(&issue).join(SUMMARY_MD).exists());

        let ctx = store.read(&issue).unwrap();
        assert_eq!(ctx.issue.status, IssueStatus::Rejected);
        assert_eq!(ctx.records.len(), 2);

        assert!(matches!(
            store.append(&issue, record(&issue, Phase::Propose, 1, Verdict::Continue)),
            Err(StoreError::NotActive(_))
        ));
        assert!(matches!(
            store.set_status(&issue, IssueStatus::Stalled, None),
            Err(StoreError::NotActive(_))
        ));
    }

    #[test]
    fn test_crash_after_staging_leaves_issue_untouched() {
        let (store, _dir) = setup();
        let issue = id("half-finalized");
        store.create(&issue, "t").unwrap();
        store
            .append(&issue, record(&issue, Phase::Research, 1, Verdict::Continue))
            .unwrap();

        // Snapshot written, status update never committed.
        let bundle = bundle_for(&store, &issue, Resolution::Escalated);
        store.stage_archive(&issue, &bundle).unwrap();

        let ctx = store.read(&issue).unwrap();
        assert_eq!(ctx.issue.status, IssueStatus::InProgress);
        assert!(ctx.issue.resolution.is_none());
        assert!(store.list(Some(IssueStatus::Escalated)).unwrap().is_empty());

        // Retrying the whole transaction succeeds over the stale staging area.
        let bundle = bundle_for(&store, &issue, Resolution::Escalated);
        store.archive(&issue, bundle).unwrap();
        assert_eq!(store.read(&issue).unwrap().issue.status, IssueStatus::Escalated);
    }

    #[test]
    fn test_crash_after_commit_rename_reads_as_archived() {
        let (store, _dir) = setup();
        let issue = id("renamed");
        store.create(&issue, "t").unwrap();
        let bundle = bundle_for(&store, &issue, Resolution::Rejected);
        let staged = store.stage_archive(&issue, &bundle).unwrap();
        // Rename without the cleanup step.
        fs::rename(&staged, store.archive_dir(&issue)).unwrap();
        assert!(store.active_dir(&issue).exists());

        let ctx = store.read(&issue).unwrap();
        assert_eq!(ctx.issue.status, IssueStatus::Rejected);
        assert!(!store.active_dir(&issue).exists());
    }

    #[test]
    fn test_list_filters_by_status() {
        let (store, _dir) = setup();
        let open = id("open-one");
        let rejected = id("rejected-one");
        store.create(&open, "a").unwrap();
        store.create(&rejected, "b").unwrap();
        let bundle = bundle_for(&store, &rejected, Resolution::Rejected);
        store.archive(&rejected, bundle).unwrap();

        assert_eq!(store.list(None).unwrap().len(), 2);
        let only_rejected = store.list(Some(IssueStatus::Rejected)).unwrap();
        assert_eq!(only_rejected.len(), 1);
        assert_eq!(only_rejected[0].id, rejected);
        let only_open = store.list(Some(IssueStatus::Open)).unwrap();
        assert_eq!(only_open[0].id, open);
    }

    #[test]
    fn test_list_skips_corrupt_issue() {
        let (store, dir) = setup();
        let good = id("good-one");
        let broken = id("broken-one");
        store.create(&good, "a").unwrap();
        store.create(&broken, "b").unwrap();
        fs::write(dir.path().join("issues/active/broken-one/issue.json"), "{ not json").unwrap();

        let listed = store.list(None).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, good);
        assert!(matches!(store.read(&broken), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_recovery_after_reopen() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("issues");
        let issue = id("persisted");
        {
            let store = FileIssueStore::open(&root).unwrap();
            store.create(&issue, "t").unwrap();
            store
                .append(&issue, record(&issue, Phase::Research, 1, Verdict::Continue))
                .unwrap();
        }
        let store = FileIssueStore::open(&root).unwrap();
        let ctx = store.read(&issue).unwrap();
        assert_eq!(ctx.records.len(), 1);
        assert_eq!(ctx.records[0].record.phase, Phase::Research);
    }
}
