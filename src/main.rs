use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "mender")]
#[command(version, about = "Drive issues through research, fix and verification phases")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Maximum implement/verify iterations before escalation. Overrides mender.toml.
    #[arg(long, global = true, env = "MENDER_MAX_RETRIES")]
    pub max_retries: Option<u32>,

    /// Per-invocation worker timeout in seconds. Overrides mender.toml.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Archive RESOLVED issues without creating a commit
    #[arg(long, global = true)]
    pub no_commit: bool,

    /// Write the log file as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Serve every phase from a scripted response file instead of configured commands
    #[arg(long, global = true)]
    pub script: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a mender project in the project directory
    Init,
    /// Open a new issue and drive it as far as it goes
    Start {
        /// Issue identifier (lowercase letters, digits and dashes)
        #[arg(required_unless_present = "title")]
        id: Option<String>,
        /// Issue title; the id is derived from it when omitted
        #[arg(short, long)]
        title: Option<String>,
    },
    /// Continue an issue from its last persisted state
    Resume {
        /// Issue to resume
        #[arg(required_unless_present = "all")]
        id: Option<String>,
        /// Resume every issue that is not archived
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
    /// Handle one or more JSON trigger requests: {"command": "start", "issueId": "..."}
    Trigger {
        #[arg(required = true)]
        requests: Vec<String>,
    },
    /// List issues and their status
    Status {
        /// Only show issues in this status (e.g. IN_PROGRESS, ESCALATED)
        #[arg(long)]
        status: Option<String>,
    },
    /// Show an issue with its full record chain
    Show {
        id: String,
        /// Print the Workflow Context as JSON
        #[arg(long)]
        json: bool,
    },
    /// Re-check an issue's record log against the transition table
    Replay { id: String },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default mender.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let _log_guard = cmd::init_logging(&cli, &project_dir)?;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Start { id, title } => {
            cmd::cmd_start(&cli, &project_dir, id.as_deref(), title.as_deref()).await?
        }
        Commands::Resume { id, all } => {
            cmd::cmd_resume(&cli, &project_dir, id.as_deref(), *all).await?
        }
        Commands::Trigger { requests } => cmd::cmd_trigger(&cli, &project_dir, requests).await?,
        Commands::Status { status } => cmd::cmd_status(&project_dir, status.as_deref())?,
        Commands::Show { id, json } => cmd::cmd_show(&project_dir, id, *json)?,
        Commands::Replay { id } => cmd::cmd_replay(&cli, &project_dir, id)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
