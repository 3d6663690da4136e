//! Unified configuration for mender.
//!
//! Settings are read from `.mender/mender.toml` and layered
//! file → environment → CLI, with sensible defaults for every field.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "my-service"
//!
//! [workflow]
//! max_verify_retries = 3
//! invocation_timeout_secs = 900
//!
//! [worker_retry]
//! max_attempts = 3
//! initial_backoff_ms = 1000
//! max_backoff_ms = 30000
//!
//! [storage_retry]
//! initial_backoff_ms = 200
//! max_backoff_ms = 10000
//! stall_after = 5
//!
//! [commit]
//! enabled = true
//! default_type = "fix"
//! summary_dir = "docs/issues"
//!
//! [workers]
//! command = "my-worker"
//!
//! [workers.phases.implement]
//! command = "my-implementer"
//! timeout_secs = 1800
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::issue::Phase;
use crate::workflow::backoff::BackoffPolicy;

pub const MENDER_DIR: &str = ".mender";
pub const CONFIG_FILE: &str = "mender.toml";

/// Project-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name (optional, defaults to directory name)
    #[serde(default)]
    pub name: Option<String>,
}

/// Workflow bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSection {
    /// Maximum implement/verify iterations before escalation
    #[serde(default = "default_max_verify_retries")]
    pub max_verify_retries: u32,
    /// Per-invocation worker timeout
    #[serde(default = "default_invocation_timeout_secs")]
    pub invocation_timeout_secs: u64,
}

fn default_max_verify_retries() -> u32 {
    3
}

fn default_invocation_timeout_secs() -> u64 {
    900
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_verify_retries: default_max_verify_retries(),
            invocation_timeout_secs: default_invocation_timeout_secs(),
        }
    }
}

/// Bounded retry budget for transient worker invocation failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRetrySection {
    #[serde(default = "default_worker_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_worker_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_worker_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_worker_max_attempts() -> u32 {
    3
}

fn default_worker_initial_backoff_ms() -> u64 {
    1000
}

fn default_worker_max_backoff_ms() -> u64 {
    30_000
}

impl Default for WorkerRetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_worker_max_attempts(),
            initial_backoff_ms: default_worker_initial_backoff_ms(),
            max_backoff_ms: default_worker_max_backoff_ms(),
        }
    }
}

impl WorkerRetrySection {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

/// Storage failures are retried without bound unless `give_up_after` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageRetrySection {
    #[serde(default = "default_storage_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_storage_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Consecutive failures after which the issue is marked STALLED
    #[serde(default = "default_stall_after")]
    pub stall_after: u32,
    /// Optional hard cap on attempts; absent means retry forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub give_up_after: Option<u32>,
}

fn default_storage_initial_backoff_ms() -> u64 {
    200
}

fn default_storage_max_backoff_ms() -> u64 {
    10_000
}

fn default_stall_after() -> u32 {
    5
}

impl Default for StorageRetrySection {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_storage_initial_backoff_ms(),
            max_backoff_ms: default_storage_max_backoff_ms(),
            stall_after: default_stall_after(),
            give_up_after: None,
        }
    }
}

impl StorageRetrySection {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

/// Version-control emission on RESOLVED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitSection {
    #[serde(default = "default_commit_enabled")]
    pub enabled: bool,
    /// Commit type prefix when the FINALIZE worker does not choose one
    #[serde(default = "default_commit_type")]
    pub default_type: String,
    /// Directory (relative to the project root) receiving finalized summaries
    #[serde(default = "default_summary_dir")]
    pub summary_dir: PathBuf,
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
}

fn default_commit_enabled() -> bool {
    true
}

fn default_commit_type() -> String {
    "fix".to_string()
}

fn default_summary_dir() -> PathBuf {
    PathBuf::from("docs/issues")
}

fn default_author_name() -> String {
    "mender".to_string()
}

fn default_author_email() -> String {
    "mender@localhost".to_string()
}

impl Default for CommitSection {
    fn default() -> Self {
        Self {
            enabled: default_commit_enabled(),
            default_type: default_commit_type(),
            summary_dir: default_summary_dir(),
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }
}

/// External command serving one or more phases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerCommand {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkersSection {
    /// Fallback command for phases without an override
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Per-phase overrides keyed by lowercase phase name
    #[serde(default)]
    pub phases: HashMap<String, WorkerCommand>,
}

/// The complete mender.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MenderToml {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub worker_retry: WorkerRetrySection,
    #[serde(default)]
    pub storage_retry: StorageRetrySection,
    #[serde(default)]
    pub commit: CommitSection,
    #[serde(default)]
    pub workers: WorkersSection,
}

impl MenderToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse mender.toml")
    }

    /// Load `.mender/mender.toml`, or defaults if the file doesn't exist.
    pub fn load_or_default(mender_dir: &Path) -> Result<Self> {
        let config_path = mender_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize mender.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Resolve the worker command for a phase: phase override → `[workers]` → `MENDER_WORKER_CMD`.
    pub fn worker_for(&self, phase: Phase) -> Option<WorkerCommand> {
        let fallback = self
            .workers
            .command
            .clone()
            .or_else(|| std::env::var("MENDER_WORKER_CMD").ok());

        match self.workers.phases.get(phase.slug()) {
            Some(over) if over.command.is_some() => Some(over.clone()),
            Some(over) => fallback.map(|command| WorkerCommand {
                command: Some(command),
                args: if over.args.is_empty() {
                    self.workers.args.clone()
                } else {
                    over.args.clone()
                },
                timeout_secs: over.timeout_secs,
            }),
            None => fallback.map(|command| WorkerCommand {
                command: Some(command),
                args: self.workers.args.clone(),
                timeout_secs: None,
            }),
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.workflow.max_verify_retries == 0 {
            warnings.push(
                "max_verify_retries = 0: IMPLEMENT can never run, every issue will escalate"
                    .to_string(),
            );
        }
        if self.workflow.invocation_timeout_secs == 0 {
            warnings.push("invocation_timeout_secs = 0: every worker call will time out".into());
        }
        if self.worker_retry.max_attempts == 0 {
            warnings.push("worker_retry.max_attempts = 0: workers will never be invoked".into());
        }
        if self.worker_retry.max_backoff_ms < self.worker_retry.initial_backoff_ms {
            warnings.push("worker_retry.max_backoff_ms is below initial_backoff_ms".into());
        }
        if self.storage_retry.max_backoff_ms < self.storage_retry.initial_backoff_ms {
            warnings.push("storage_retry.max_backoff_ms is below initial_backoff_ms".into());
        }
        for key in self.workers.phases.keys() {
            if key.parse::<Phase>().is_err() {
                warnings.push(format!("Unknown phase '{}' in [workers.phases]", key));
            }
        }
        let missing: Vec<&str> = Phase::ALL
            .iter()
            .filter(|p| self.worker_for(**p).is_none())
            .map(|p| p.slug())
            .collect();
        if !missing.is_empty() {
            warnings.push(format!(
                "No worker command configured for: {}",
                missing.join(", ")
            ));
        }

        warnings
    }
}

/// Runtime configuration: mender.toml plus environment and CLI overrides.
#[derive(Debug, Clone)]
pub struct MenderConfig {
    pub project_dir: PathBuf,
    pub mender_dir: PathBuf,
    pub toml: MenderToml,
    pub verbose: bool,
    /// CLI override for max_verify_retries
    pub cli_max_retries: Option<u32>,
    /// CLI override for invocation_timeout_secs
    pub cli_timeout_secs: Option<u64>,
    /// CLI switch disabling the version-control commit
    pub no_commit: bool,
}

impl MenderConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let mender_dir = project_dir.join(MENDER_DIR);
        let toml = MenderToml::load_or_default(&mender_dir)?;

        Ok(Self {
            project_dir,
            mender_dir,
            toml,
            verbose: false,
            cli_max_retries: None,
            cli_timeout_secs: None,
            no_commit: false,
        })
    }

    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        max_retries: Option<u32>,
        timeout_secs: Option<u64>,
        no_commit: bool,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.cli_max_retries = max_retries;
        config.cli_timeout_secs = timeout_secs;
        config.no_commit = no_commit;
        Ok(config)
    }

    /// CLI → `MENDER_MAX_RETRIES` → file → default.
    pub fn max_verify_retries(&self) -> u32 {
        self.cli_max_retries
            .or_else(|| {
                std::env::var("MENDER_MAX_RETRIES")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(self.toml.workflow.max_verify_retries)
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(
            self.cli_timeout_secs
                .unwrap_or(self.toml.workflow.invocation_timeout_secs),
        )
    }

    pub fn commit_enabled(&self) -> bool {
        self.toml.commit.enabled && !self.no_commit
    }

    pub fn issues_dir(&self) -> PathBuf {
        self.mender_dir.join("issues")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.mender_dir.join("logs")
    }

    pub fn config_file(&self) -> PathBuf {
        self.mender_dir.join(CONFIG_FILE)
    }

    pub fn project_name(&self) -> String {
        self.toml.project.name.clone().unwrap_or_else(|| {
            self.project_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "project".to_string())
        })
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
