//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `run`           | `Start`, `Resume`, `Trigger`                       |
//! | `issue`         | `Status`, `Show`, `Replay`                         |
//! | `project`       | `Init`                                             |
//! | `config`        | `Config`                                           |

pub mod config;
pub mod issue;
pub mod project;
pub mod run;

pub use config::cmd_config;
pub use issue::{cmd_replay, cmd_show, cmd_status};
pub use project::cmd_init;
pub use run::{cmd_resume, cmd_start, cmd_trigger};

use anyhow::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

use super::Cli;

/// Logs go to stderr, and to `.mender/logs/` once the project is initialized.
pub fn init_logging(cli: &Cli, project_dir: &Path) -> Result<Option<WorkerGuard>> {
    use mender::config::MENDER_DIR;
    use mender::logging::{self, LogConfig};

    let log_dir = project_dir.join(MENDER_DIR).join("logs");
    let initialized = project_dir.join(MENDER_DIR).is_dir();
    logging::init(LogConfig {
        log_dir: initialized.then_some(log_dir.as_path()),
        verbose: cli.verbose,
        json: cli.json_logs,
    })
}
