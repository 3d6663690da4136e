//! Tracing setup for the mender binary.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "mender=info";
const VERBOSE_LOG_FILTER: &str = "mender=debug";
const LOG_ENV: &str = "MENDER_LOG";
const LOG_FILE_PREFIX: &str = "mender.log";

pub struct LogConfig<'a> {
    /// Directory for the daily rolling log file; `None` logs to stderr only.
    pub log_dir: Option<&'a Path>,
    pub verbose: bool,
    /// Write the file log as JSON lines.
    pub json: bool,
}

/// Install the global subscriber: stderr plus an optional daily rolling file.
///
/// The returned guard flushes the file writer on drop and must be held for the
/// lifetime of the process.
pub fn init(config: LogConfig<'_>) -> Result<Option<WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
            EnvFilter::new(if config.verbose {
                VERBOSE_LOG_FILTER
            } else {
                DEFAULT_LOG_FILTER
            })
        })
    };

    let mut guard = None;
    let (plain_file, json_file) = match config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            guard = Some(file_guard);
            if config.json {
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_filter(filter());
                (None, Some(layer))
            } else {
                let layer = tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(filter());
                (Some(layer), None)
            }
        }
        None => (None, None),
    };

    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter());

    tracing_subscriber::registry()
        .with(plain_file)
        .with(json_file)
        .with(console)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
