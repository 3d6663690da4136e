//! Integration tests for the mender CLI
//!
//! These tests drive the binary end to end against temp project directories,
//! using scripted workers so no external worker command is needed.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Helper to create a mender Command
fn mender() -> Command {
    let mut cmd = cargo_bin_cmd!("mender");
    cmd.env_remove("MENDER_WORKER_CMD")
        .env_remove("MENDER_MAX_RETRIES")
        .env_remove("MENDER_LOG");
    cmd
}

/// Helper to create a temporary project directory
fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

/// Helper to initialize a mender project in a temp directory
fn init_mender_project(dir: &TempDir) {
    mender()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
}

/// Write a worker script into the project and return its path.
fn write_script(dir: &TempDir, name: &str, script: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, script).unwrap();
    path
}

const RESOLVE_AFTER_RETRY: &str = r#"{
    "implement": [
        {"verdict": "CONTINUE", "summary": "add deadline", "changed_files": ["src/client.rs"]},
        {"verdict": "CONTINUE", "summary": "handle retry deadline", "changed_files": ["src/client.rs"]}
    ],
    "verify": [
        {"verdict": "RETRY", "summary": "2 tests failing"},
        {"verdict": "TERMINAL_SUCCESS", "summary": "all green"}
    ],
    "finalize": {"verdict": "CONTINUE", "summary": "add request deadline", "commit_type": "fix"},
    "default": {"verdict": "CONTINUE", "summary": "ok"}
}"#;

const REJECT_AT_VALIDATE: &str = r#"{
    "validate": {"verdict": "REJECT", "summary": "works as intended"}
}"#;

fn archived(dir: &Path, id: &str) -> PathBuf {
    dir.join(".mender/issues/archive").join(id)
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_mender_help() {
        mender().arg("--help").assert().success();
    }

    #[test]
    fn test_mender_version() {
        mender()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("mender"));
    }

    #[test]
    fn test_subcommand_help() {
        for sub in ["init", "start", "resume", "trigger", "status", "show", "replay", "config"] {
            mender().args([sub, "--help"]).assert().success();
        }
    }

    #[test]
    fn test_start_requires_id_or_title() {
        mender().arg("start").assert().failure();
    }

    #[test]
    fn test_resume_id_conflicts_with_all() {
        mender()
            .args(["resume", "some-issue", "--all"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Init Tests
// =============================================================================

mod init {
    use super::*;

    #[test]
    fn test_init_creates_project_structure() {
        let dir = create_temp_project();
        mender()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized mender project"));

        let mender_dir = dir.path().join(".mender");
        assert!(mender_dir.join("mender.toml").exists());
        assert!(mender_dir.join("issues/active").is_dir());
        assert!(mender_dir.join("issues/archive").is_dir());
        assert!(mender_dir.join("logs").is_dir());
    }

    #[test]
    fn test_init_twice_is_idempotent() {
        let dir = create_temp_project();
        init_mender_project(&dir);
        fs::write(
            dir.path().join(".mender/mender.toml"),
            "[workflow]\nmax_verify_retries = 5\n",
        )
        .unwrap();

        mender()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));

        let config = fs::read_to_string(dir.path().join(".mender/mender.toml")).unwrap();
        assert!(config.contains("max_verify_retries = 5"));
    }
}

// =============================================================================
// Workflow Tests
// =============================================================================

mod workflow {
    use super::*;

    #[test]
    fn test_start_resolves_with_script() {
        let dir = create_temp_project();
        init_mender_project(&dir);
        let script = write_script(&dir, "script.json", RESOLVE_AFTER_RETRY);

        mender()
            .current_dir(dir.path())
            .args(["start", "fix-timeout-bug", "--title", "Fix timeout bug", "--no-commit"])
            .arg("--script")
            .arg(&script)
            .assert()
            .success()
            .stdout(predicate::str::contains("fix-timeout-bug"))
            .stdout(predicate::str::contains("RESOLVED"));

        let archive = archived(dir.path(), "fix-timeout-bug");
        assert!(archive.join("summary.md").exists());
        let context = fs::read_to_string(archive.join("context.json")).unwrap();
        let context: serde_json::Value = serde_json::from_str(&context).unwrap();
        assert_eq!(context["records"].as_array().unwrap().len(), 9);
    }

    #[test]
    fn test_start_derives_id_from_title() {
        let dir = create_temp_project();
        init_mender_project(&dir);
        let script = write_script(&dir, "script.json", REJECT_AT_VALIDATE);

        mender()
            .current_dir(dir.path())
            .args(["start", "--title", "Login Page Crashes!"])
            .arg("--script")
            .arg(&script)
            .assert()
            .success()
            .stdout(predicate::str::contains("REJECTED"));

        assert!(archived(dir.path(), "login-page-crashes").exists());
    }

    #[test]
    fn test_start_rejects_invalid_id() {
        let dir = create_temp_project();
        init_mender_project(&dir);
        let script = write_script(&dir, "script.json", REJECT_AT_VALIDATE);

        mender()
            .current_dir(dir.path())
            .args(["start", "Not Valid"])
            .arg("--script")
            .arg(&script)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid issue id"));
    }

    #[test]
    fn test_start_without_workers_fails_before_creating_issue() {
        let dir = create_temp_project();
        init_mender_project(&dir);

        mender()
            .current_dir(dir.path())
            .args(["start", "no-workers"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No worker configured"));

        assert!(!dir.path().join(".mender/issues/active/no-workers").exists());
    }

    #[test]
    fn test_start_existing_issue_fails() {
        let dir = create_temp_project();
        init_mender_project(&dir);
        let script = write_script(&dir, "script.json", REJECT_AT_VALIDATE);

        for expect_success in [true, false] {
            let assert = mender()
                .current_dir(dir.path())
                .args(["start", "twice"])
                .arg("--script")
                .arg(&script)
                .assert();
            if expect_success {
                assert.success();
            } else {
                assert.failure().stdout(predicate::str::contains("ERROR"));
            }
        }
    }

    #[test]
    fn test_retry_budget_from_cli_flag() {
        let dir = create_temp_project();
        init_mender_project(&dir);
        let script = write_script(
            &dir,
            "script.json",
            r#"{"verify": {"verdict": "RETRY", "summary": "still failing"}}"#,
        );

        mender()
            .current_dir(dir.path())
            .args(["start", "endless-retry", "--max-retries", "1"])
            .arg("--script")
            .arg(&script)
            .assert()
            .success()
            .stdout(predicate::str::contains("ESCALATED"));

        mender()
            .current_dir(dir.path())
            .args(["show", "endless-retry"])
            .assert()
            .success()
            .stdout(predicate::str::contains("ESCALATE (RETRY)"))
            .stdout(predicate::str::contains("Retry budget exhausted"));
    }

    #[test]
    fn test_resolved_issue_is_committed() {
        let dir = create_temp_project();
        git2::Repository::init(dir.path()).unwrap();
        init_mender_project(&dir);
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/client.rs"), "// deadline\n").unwrap();
        let script = write_script(&dir, "script.json", RESOLVE_AFTER_RETRY);

        mender()
            .current_dir(dir.path())
            .args(["start", "fix-timeout-bug"])
            .arg("--script")
            .arg(&script)
            .assert()
            .success()
            .stdout(predicate::str::contains("commit"));

        let repo = git2::Repository::open(dir.path()).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(
            head.message(),
            Some("fix: add request deadline\n\nRefs: fix-timeout-bug")
        );
    }

    #[test]
    fn test_log_file_written_for_initialized_project() {
        let dir = create_temp_project();
        init_mender_project(&dir);
        let script = write_script(&dir, "script.json", REJECT_AT_VALIDATE);

        mender()
            .current_dir(dir.path())
            .args(["start", "logged-issue"])
            .arg("--script")
            .arg(&script)
            .assert()
            .success();

        let logs: Vec<String> = fs::read_dir(dir.path().join(".mender/logs"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(logs.iter().any(|name| name.starts_with("mender.log")));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_worker_from_config() {
        let dir = create_temp_project();
        init_mender_project(&dir);
        fs::write(
            dir.path().join(".mender/mender.toml"),
            r#"
[workers]
command = "sh"
args = ["-c", "cat > /dev/null; echo '{\"verdict\": \"CONTINUE\", \"summary\": \"ok\"}'"]

[workers.phases.validate]
command = "sh"
args = ["-c", "cat > /dev/null; echo 'checking...'; echo '{\"verdict\": \"REJECT\", \"summary\": \"duplicate\"}'"]
"#,
        )
        .unwrap();

        mender()
            .current_dir(dir.path())
            .args(["start", "via-command"])
            .assert()
            .success()
            .stdout(predicate::str::contains("REJECTED"));
    }
}

// =============================================================================
// Trigger and Resume Tests
// =============================================================================

mod trigger {
    use super::*;

    #[test]
    fn test_trigger_json_requests() {
        let dir = create_temp_project();
        init_mender_project(&dir);
        // One scripted worker serves both issues.
        let script = write_script(
            &dir,
            "script.json",
            r#"{"validate": [
                {"verdict": "REJECT", "summary": "duplicate"},
                {"verdict": "REJECT", "summary": "duplicate"}
            ]}"#,
        );

        mender()
            .current_dir(dir.path())
            .arg("trigger")
            .arg(r#"{"command": "start", "issueId": "first-report"}"#)
            .arg(r#"{"command": "start", "issueId": "second-report", "title": "Second"}"#)
            .arg("--script")
            .arg(&script)
            .assert()
            .success()
            .stdout(predicate::str::contains("first-report"))
            .stdout(predicate::str::contains("second-report"));

        assert!(archived(dir.path(), "first-report").exists());
        assert!(archived(dir.path(), "second-report").exists());
    }

    #[test]
    fn test_trigger_rejects_malformed_request() {
        let dir = create_temp_project();
        init_mender_project(&dir);

        mender()
            .current_dir(dir.path())
            .args(["trigger", r#"{"command": "restart", "issueId": "x"}"#])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid trigger request"));
    }

    #[test]
    fn test_resume_unknown_issue_fails() {
        let dir = create_temp_project();
        init_mender_project(&dir);
        let script = write_script(&dir, "script.json", REJECT_AT_VALIDATE);

        mender()
            .current_dir(dir.path())
            .args(["resume", "never-started"])
            .arg("--script")
            .arg(&script)
            .assert()
            .failure()
            .stdout(predicate::str::contains("not found"));
    }

    #[test]
    fn test_resume_all_with_nothing_open() {
        let dir = create_temp_project();
        init_mender_project(&dir);
        let script = write_script(&dir, "script.json", REJECT_AT_VALIDATE);

        mender()
            .current_dir(dir.path())
            .args(["resume", "--all"])
            .arg("--script")
            .arg(&script)
            .assert()
            .success()
            .stdout(predicate::str::contains("No unfinished issues"));
    }

    #[test]
    fn test_resume_after_finalize_failure() {
        let dir = create_temp_project();
        init_mender_project(&dir);
        let script = write_script(&dir, "script.json", r#"{}"#);

        // Commits are on by default and there is no repository yet.
        mender()
            .current_dir(dir.path())
            .args(["start", "needs-repo"])
            .arg("--script")
            .arg(&script)
            .assert()
            .failure()
            .stdout(predicate::str::contains("commit failed"));

        mender()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("IN_PROGRESS"))
            .stdout(predicate::str::contains("last error"));

        git2::Repository::init(dir.path()).unwrap();
        mender()
            .current_dir(dir.path())
            .args(["resume", "--all"])
            .arg("--script")
            .arg(&script)
            .assert()
            .success()
            .stdout(predicate::str::contains("RESOLVED"));
    }
}

// =============================================================================
// Inspection Tests
// =============================================================================

mod inspection {
    use super::*;

    fn resolved_project() -> TempDir {
        let dir = create_temp_project();
        init_mender_project(&dir);
        let script = write_script(&dir, "script.json", RESOLVE_AFTER_RETRY);
        mender()
            .current_dir(dir.path())
            .args(["start", "fix-timeout-bug", "--no-commit"])
            .arg("--script")
            .arg(&script)
            .assert()
            .success();
        dir
    }

    #[test]
    fn test_status_without_init() {
        let dir = create_temp_project();
        mender()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("mender init"));
    }

    #[test]
    fn test_status_lists_and_filters() {
        let dir = resolved_project();

        mender()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("fix-timeout-bug"))
            .stdout(predicate::str::contains("RESOLVED"));

        mender()
            .current_dir(dir.path())
            .args(["status", "--status", "escalated"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No issues with status ESCALATED"));

        mender()
            .current_dir(dir.path())
            .args(["status", "--status", "bogus"])
            .assert()
            .failure();
    }

    #[test]
    fn test_show_prints_record_chain() {
        let dir = resolved_project();

        mender()
            .current_dir(dir.path())
            .args(["show", "fix-timeout-bug"])
            .assert()
            .success()
            .stdout(predicate::str::contains("RESEARCH"))
            .stdout(predicate::str::contains("2 tests failing"))
            .stdout(predicate::str::contains("TERMINAL_SUCCESS"))
            .stdout(predicate::str::contains("FINALIZE"));

        let output = mender()
            .current_dir(dir.path())
            .args(["show", "fix-timeout-bug", "--json"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let ctx: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(ctx["issue"]["status"], "RESOLVED");
        assert_eq!(ctx["records"].as_array().unwrap().len(), 9);
    }

    #[test]
    fn test_show_unknown_issue_fails() {
        let dir = create_temp_project();
        init_mender_project(&dir);
        mender()
            .current_dir(dir.path())
            .args(["show", "missing-issue"])
            .assert()
            .failure();
    }

    #[test]
    fn test_replay_validates_log() {
        let dir = resolved_project();

        mender()
            .current_dir(dir.path())
            .args(["replay", "fix-timeout-bug"])
            .assert()
            .success()
            .stdout(predicate::str::contains("9 record(s) valid"))
            .stdout(predicate::str::contains("archived as RESOLVED"));
    }
}

// =============================================================================
// Config Tests
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();
        mender()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_verify_retries = 3"))
            .stdout(predicate::str::contains("(not configured)"));
    }

    #[test]
    fn test_config_init_and_validate() {
        let dir = create_temp_project();
        mender()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created mender.toml"));

        mender()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        mender()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No worker command configured"));
    }

    #[test]
    fn test_config_validate_clean() {
        let dir = create_temp_project();
        init_mender_project(&dir);
        fs::write(
            dir.path().join(".mender/mender.toml"),
            "[workers]\ncommand = \"my-worker\"\n",
        )
        .unwrap();

        mender()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_config_invalid_toml_fails() {
        let dir = create_temp_project();
        init_mender_project(&dir);
        fs::write(dir.path().join(".mender/mender.toml"), "[workflow\n").unwrap();

        mender()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure();
    }
}
