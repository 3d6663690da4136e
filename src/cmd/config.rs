//! Configuration view and validation commands: `mender config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use mender::config::{CONFIG_FILE, MENDER_DIR, MenderConfig, MenderToml};

    let mender_dir = project_dir.join(MENDER_DIR);
    let config_path = mender_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Mender Configuration");
            println!("====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No mender.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let config = MenderConfig::new(project_dir.to_path_buf())?;
            let toml = &config.toml;

            println!("[project]");
            println!("  name = \"{}\"", config.project_name());
            println!();

            println!("[workflow]");
            println!("  max_verify_retries = {}", toml.workflow.max_verify_retries);
            println!(
                "  invocation_timeout_secs = {}",
                toml.workflow.invocation_timeout_secs
            );
            println!();

            println!("[worker_retry]");
            println!("  max_attempts = {}", toml.worker_retry.max_attempts);
            println!("  initial_backoff_ms = {}", toml.worker_retry.initial_backoff_ms);
            println!("  max_backoff_ms = {}", toml.worker_retry.max_backoff_ms);
            println!();

            println!("[storage_retry]");
            println!("  initial_backoff_ms = {}", toml.storage_retry.initial_backoff_ms);
            println!("  max_backoff_ms = {}", toml.storage_retry.max_backoff_ms);
            println!("  stall_after = {}", toml.storage_retry.stall_after);
            match toml.storage_retry.give_up_after {
                Some(cap) => println!("  give_up_after = {}", cap),
                None => println!("  give_up_after = (retry forever)"),
            }
            println!();

            println!("[commit]");
            println!("  enabled = {}", toml.commit.enabled);
            println!("  default_type = \"{}\"", toml.commit.default_type);
            println!("  summary_dir = \"{}\"", toml.commit.summary_dir.display());
            println!();

            println!("Phase workers:");
            for phase in mender::issue::Phase::ALL {
                match toml.worker_for(phase).and_then(|w| w.command.map(|c| (c, w.args))) {
                    Some((command, args)) if args.is_empty() => {
                        println!("  {:<10} {}", phase.slug(), command)
                    }
                    Some((command, args)) => {
                        println!("  {:<10} {} {}", phase.slug(), command, args.join(" "))
                    }
                    None => println!(
                        "  {:<10} {}",
                        phase.slug(),
                        console::style("(not configured)").dim()
                    ),
                }
            }
            println!();

            println!("Effective values (with env/CLI overrides):");
            println!("  max_verify_retries = {}", config.max_verify_retries());
            println!("  commit_enabled = {}", config.commit_enabled());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let toml = MenderToml::load_or_default(&mender_dir)?;
            if !config_path.exists() {
                println!("No mender.toml found. Checking defaults.");
            }
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("mender.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !mender_dir.exists() {
                std::fs::create_dir_all(&mender_dir)?;
            }

            MenderToml::default().save(&config_path)?;

            println!("Created mender.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [workflow] max_verify_retries, invocation_timeout_secs");
            println!("  - [workers] command, args and [workers.phases.<phase>] overrides");
            println!("  - [commit] enabled, default_type, summary_dir");
            println!();
        }
    }

    Ok(())
}
