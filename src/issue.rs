//! Domain model for issues moving through the resolution workflow.
//!
//! An [`Issue`] accumulates an ordered chain of [`PhaseRecord`]s, each pointing
//! at exactly one immutable [`Artifact`]. The [`WorkflowContext`] is the
//! read-only snapshot of both that phase workers receive.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::util::slugify;

const MAX_ISSUE_ID_LEN: usize = 64;

/// Slug identifying an issue (`[a-z0-9-]`, at most 64 characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IssueId(String);

impl IssueId {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_ISSUE_ID_LEN
            && !raw.starts_with('-')
            && !raw.ends_with('-')
            && raw
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(format!(
                "Invalid issue id '{}': use 1-{} lowercase letters, digits and dashes",
                raw, MAX_ISSUE_ID_LEN
            ))
        }
    }

    /// Derive an id from free text, e.g. an issue title.
    pub fn from_title(title: &str) -> Result<Self, String> {
        Self::parse(&slugify(title, MAX_ISSUE_ID_LEN))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl TryFrom<String> for IssueId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<IssueId> for String {
    fn from(id: IssueId) -> Self {
        id.0
    }
}

impl FromStr for IssueId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Externally visible issue status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueStatus {
    Open,
    InProgress,
    Resolved,
    Rejected,
    Escalated,
    Stalled,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::InProgress => "IN_PROGRESS",
            Self::Resolved => "RESOLVED",
            Self::Rejected => "REJECTED",
            Self::Escalated => "ESCALATED",
            Self::Stalled => "STALLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Rejected | Self::Escalated)
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for IssueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "OPEN" => Ok(Self::Open),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "RESOLVED" => Ok(Self::Resolved),
            "REJECTED" => Ok(Self::Rejected),
            "ESCALATED" => Ok(Self::Escalated),
            "STALLED" => Ok(Self::Stalled),
            _ => Err(format!("Invalid issue status: {}", s)),
        }
    }
}

/// One named stage of the pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Research,
    Validate,
    Propose,
    Review,
    Implement,
    Verify,
    Finalize,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Research,
        Phase::Validate,
        Phase::Propose,
        Phase::Review,
        Phase::Implement,
        Phase::Verify,
        Phase::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "RESEARCH",
            Self::Validate => "VALIDATE",
            Self::Propose => "PROPOSE",
            Self::Review => "REVIEW",
            Self::Implement => "IMPLEMENT",
            Self::Verify => "VERIFY",
            Self::Finalize => "FINALIZE",
        }
    }

    /// Lowercase name used in file names and config keys.
    pub fn slug(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Validate => "validate",
            Self::Propose => "propose",
            Self::Review => "review",
            Self::Implement => "implement",
            Self::Verify => "verify",
            Self::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|p| p.slug().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Invalid phase: {}", s))
    }
}

/// A worker's outcome classification for one phase attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Continue,
    Reject,
    Retry,
    Escalate,
    TerminalSuccess,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "CONTINUE",
            Self::Reject => "REJECT",
            Self::Retry => "RETRY",
            Self::Escalate => "ESCALATE",
            Self::TerminalSuccess => "TERMINAL_SUCCESS",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// How a finished issue left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    Resolved,
    Rejected,
    Escalated,
}

impl Resolution {
    pub fn status(&self) -> IssueStatus {
        match self {
            Self::Resolved => IssueStatus::Resolved,
            Self::Rejected => IssueStatus::Rejected,
            Self::Escalated => IssueStatus::Escalated,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.status().as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Regular output of a phase worker.
    PhaseOutput,
    /// Synthesized when the implement/verify loop runs out of budget.
    EscalationNotice,
    /// Synthesized when a worker fails fatally or exhausts its invocation retries.
    FailureReport,
}

/// Immutable structured document produced by exactly one Phase Record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub kind: ArtifactKind,
    pub summary: String,
    #[serde(default)]
    pub body: serde_json::Value,
    /// SHA-256 of the serialized body.
    pub digest: String,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(
        issue: &IssueId,
        phase: Phase,
        attempt: u32,
        kind: ArtifactKind,
        summary: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        let digest = digest_of(&body);
        Self {
            id: artifact_id(issue, phase, attempt),
            kind,
            summary: summary.into(),
            body,
            digest,
            created_at: Utc::now(),
        }
    }

    pub fn reference(&self) -> ArtifactRef {
        ArtifactRef {
            id: self.id.clone(),
            digest: self.digest.clone(),
        }
    }

    /// Recompute the digest and compare it with the stored one.
    pub fn verify_digest(&self) -> bool {
        digest_of(&self.body) == self.digest
    }
}

pub fn artifact_id(issue: &IssueId, phase: Phase, attempt: u32) -> String {
    format!("{}/{}-{}", issue, phase.slug(), attempt)
}

fn digest_of(body: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: String,
    pub digest: String,
}

/// Non-blocking supplementary finding reported alongside an advancing verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The worker reported an unrecoverable failure.
    WorkerFatal,
    /// Transient invocation failures used up the bounded retry budget.
    InvocationExhausted,
    /// The worker returned a verdict the transition table does not allow.
    ProtocolViolation,
    /// The implement/verify loop used all of its iterations.
    RetryBudgetExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub message: String,
    /// Worker invocations made for this attempt before giving up.
    pub invocations: u32,
}

/// Persisted outcome of one (phase, attempt).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    /// Position in the issue's record chain, starting at 1.
    pub sequence: u32,
    pub phase: Phase,
    pub attempt: u32,
    pub verdict: Verdict,
    /// What the worker said when the controller overrode it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_verdict: Option<Verdict>,
    pub artifact: ArtifactRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
    /// Transient invocation errors absorbed by retries before this outcome.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invocation_failures: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// A Phase Record together with everything persisted in the same atomic unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDocument {
    pub record: PhaseRecord,
    pub artifact: Artifact,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<Finding>,
    /// Source files touched by an IMPLEMENT attempt, relative to the project root.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_files: Vec<PathBuf>,
    /// Conventional commit type chosen by the FINALIZE worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_type: Option<String>,
}

/// Everything the controller hands to the store for one append.
/// The store assigns the sequence number and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub phase: Phase,
    pub attempt: u32,
    pub verdict: Verdict,
    pub reported_verdict: Option<Verdict>,
    pub artifact: Artifact,
    pub notes: Option<String>,
    pub failure: Option<FailureRecord>,
    pub invocation_failures: Vec<String>,
    pub findings: Vec<Finding>,
    pub changed_files: Vec<PathBuf>,
    pub commit_type: Option<String>,
}

impl NewRecord {
    pub fn new(phase: Phase, attempt: u32, verdict: Verdict, artifact: Artifact) -> Self {
        Self {
            phase,
            attempt,
            verdict,
            reported_verdict: None,
            artifact,
            notes: None,
            failure: None,
            invocation_failures: Vec::new(),
            findings: Vec::new(),
            changed_files: Vec::new(),
            commit_type: None,
        }
    }

    pub fn into_document(self, sequence: u32) -> RecordDocument {
        RecordDocument {
            record: PhaseRecord {
                sequence,
                phase: self.phase,
                attempt: self.attempt,
                verdict: self.verdict,
                reported_verdict: self.reported_verdict,
                artifact: self.artifact.reference(),
                notes: self.notes,
                failure: self.failure,
                invocation_failures: self.invocation_failures,
                timestamp: Utc::now(),
            },
            artifact: self.artifact,
            findings: self.findings,
            changed_files: self.changed_files,
            commit_type: self.commit_type,
        }
    }
}

/// Issue metadata. The record chain lives next to it in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,
    pub title: String,
    pub status: IssueStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Phase of the most recent record; `None` before the first append.
    #[serde(default)]
    pub current_phase: Option<Phase>,
    /// Implement/verify iterations consumed so far.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    /// Most recent operator-visible failure (stall, finalize error).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

impl Issue {
    pub fn new(id: IssueId, title: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: title.to_string(),
            status: IssueStatus::Open,
            created_at: now,
            updated_at: now,
            current_phase: None,
            retry_count: 0,
            resolution: None,
            last_error: None,
            archived_at: None,
            commit: None,
        }
    }
}

/// Read-only aggregation of an issue and its record chain, ordered by sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub issue: Issue,
    pub records: Vec<RecordDocument>,
}

impl WorkflowContext {
    pub fn issue_id(&self) -> &IssueId {
        &self.issue.id
    }

    pub fn last(&self) -> Option<&RecordDocument> {
        self.records.last()
    }

    pub fn records_for(&self, phase: Phase) -> impl Iterator<Item = &RecordDocument> {
        self.records.iter().filter(move |d| d.record.phase == phase)
    }

    /// Number of attempts already persisted for a phase.
    pub fn attempts(&self, phase: Phase) -> u32 {
        self.records_for(phase).count() as u32
    }

    pub fn find(&self, phase: Phase, attempt: u32) -> Option<&RecordDocument> {
        self.records_for(phase).find(|d| d.record.attempt == attempt)
    }

    /// Summaries of the most recent `n` VERIFY artifacts, oldest first.
    pub fn recent_verify_summaries(&self, n: usize) -> Vec<String> {
        let summaries: Vec<String> = self
            .records_for(Phase::Verify)
            .map(|d| d.artifact.summary.clone())
            .collect();
        let skip = summaries.len().saturating_sub(n);
        summaries.into_iter().skip(skip).collect()
    }

    /// Files changed across all IMPLEMENT attempts, deduplicated in first-seen order.
    pub fn changed_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = Vec::new();
        for doc in self.records_for(Phase::Implement) {
            for file in &doc.changed_files {
                if !files.contains(file) {
                    files.push(file.clone());
                }
            }
        }
        files
    }

    pub fn findings(&self) -> impl Iterator<Item = (&PhaseRecord, &Finding)> {
        self.records
            .iter()
            .flat_map(|d| d.findings.iter().map(move |f| (&d.record, f)))
    }

    /// The failure that ended the workflow, if any.
    pub fn failure(&self) -> Option<&FailureRecord> {
        self.records.iter().rev().find_map(|d| d.record.failure.as_ref())
    }
}
