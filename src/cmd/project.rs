//! Project setup command: `mender init`.

use anyhow::{Context, Result};
use std::path::Path;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    use mender::config::{CONFIG_FILE, MENDER_DIR, MenderToml};
    use mender::store::FileIssueStore;

    let mender_dir = project_dir.join(MENDER_DIR);
    let was_initialized = mender_dir.is_dir();

    FileIssueStore::open(mender_dir.join("issues"))
        .with_context(|| format!("Failed to create issue store in {}", mender_dir.display()))?;
    std::fs::create_dir_all(mender_dir.join("logs"))
        .with_context(|| format!("Failed to create {}", mender_dir.join("logs").display()))?;

    let config_path = mender_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        MenderToml::default().save(&config_path)?;
    }

    if was_initialized {
        println!(
            "Mender project already initialized at {}",
            mender_dir.display()
        );
        println!("Directory structure verified.");
        return Ok(());
    }

    println!("Initialized mender project at {}", mender_dir.display());
    println!();
    println!("Created directory structure:");
    println!("  .mender/");
    println!("  ├── mender.toml      # Workers, retry bounds, commit settings");
    println!("  ├── issues/active/   # Issues in flight");
    println!("  ├── issues/archive/  # Finalized issues (immutable)");
    println!("  └── logs/            # Daily rolling logs");
    println!();
    println!("Next steps:");
    println!("  1. Configure phase workers under [workers] in mender.toml");
    println!("  2. Run `mender start <issue-id> --title \"...\"`");
    Ok(())
}
