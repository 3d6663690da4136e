//! Durable, per-issue keyed artifact storage.
//!
//! The store is addressable by `(issue, phase, attempt)`. Appends are atomic and
//! idempotent on that key, reads always return a consistent snapshot, and
//! archiving moves an issue from the active partition to the immutable archive.

pub mod fs;

use std::sync::Arc;

use crate::errors::StoreError;
use crate::issue::{Issue, IssueId, IssueStatus, NewRecord, RecordDocument, WorkflowContext};

pub use fs::FileIssueStore;

/// Result of an append. A duplicate returns the document that was persisted first.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Appended(RecordDocument),
    Duplicate(RecordDocument),
}

impl AppendOutcome {
    pub fn document(&self) -> &RecordDocument {
        match self {
            AppendOutcome::Appended(doc) | AppendOutcome::Duplicate(doc) => doc,
        }
    }

    pub fn into_document(self) -> RecordDocument {
        match self {
            AppendOutcome::Appended(doc) | AppendOutcome::Duplicate(doc) => doc,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, AppendOutcome::Duplicate(_))
    }
}

/// Everything written by the finalize transaction, applied as one unit.
#[derive(Debug, Clone)]
pub struct ArchiveBundle {
    /// Issue metadata carrying its terminal status.
    pub issue: Issue,
    /// Full Workflow Context as it stood when finalization began.
    pub context: WorkflowContext,
    pub summary_markdown: String,
    pub summary_json: serde_json::Value,
}

pub trait IssueStore: Send + Sync {
    /// Create a new issue in the active partition with status OPEN.
    fn create(&self, id: &IssueId, title: &str) -> Result<Issue, StoreError>;

    /// Atomically append one Phase Record. `(phase, attempt)` is the idempotency key.
    fn append(&self, id: &IssueId, record: NewRecord) -> Result<AppendOutcome, StoreError>;

    /// Consistent snapshot of an active or archived issue.
    fn read(&self, id: &IssueId) -> Result<WorkflowContext, StoreError>;

    /// Update a non-terminal status (STALLED marking, error recording).
    fn set_status(
        &self,
        id: &IssueId,
        status: IssueStatus,
        last_error: Option<String>,
    ) -> Result<Issue, StoreError>;

    /// Move the issue into the archive partition together with its summary.
    fn archive(&self, id: &IssueId, bundle: ArchiveBundle) -> Result<Issue, StoreError>;

    /// Issues in both partitions, oldest first, optionally filtered by status.
    fn list(&self, status: Option<IssueStatus>) -> Result<Vec<Issue>, StoreError>;

    fn exists(&self, id: &IssueId) -> Result<bool, StoreError> {
        match self.read(id) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Async-safe handle to an issue store.
///
/// Runs every store call on tokio's blocking thread pool via `spawn_blocking`,
/// so file locking and synchronous I/O never tie up async worker threads.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<dyn IssueStore>,
}

impl StoreHandle {
    pub fn new(store: impl IssueStore + 'static) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    pub fn from_arc(store: Arc<dyn IssueStore>) -> Self {
        Self { inner: store }
    }

    /// Run a closure with access to the store on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&dyn IssueStore) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| StoreError::Corrupt {
                path: Default::default(),
                message: format!("store task panicked: {}", e),
            })?
    }

    /// Shared ownership of the store, for work that must run on its own blocking task.
    pub fn shared(&self) -> Arc<dyn IssueStore> {
        self.inner.clone()
    }

    /// Direct synchronous access, for CLI paths that are not on a hot async path.
    pub fn blocking(&self) -> &dyn IssueStore {
        self.inner.as_ref()
    }
}
