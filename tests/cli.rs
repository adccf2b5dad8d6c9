use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn evolver(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("evolver").unwrap();
    cmd.arg("--project-root")
        .arg(root)
        .env("EVOLVER_LOG", "error")
        .env_remove("ANTHROPIC_API_KEY")
        .env_remove("LINE_CHANNEL_ACCESS_TOKEN")
        .env_remove("LINE_USER_ID");
    cmd
}

fn write_config(root: &Path, toml: &str) {
    fs::write(root.join(".evolver.toml"), toml).unwrap();
}

#[test]
fn schema_describes_config_sections() {
    let mut cmd = Command::cargo_bin("evolver").unwrap();
    cmd.arg("schema");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("forbidden_files"))
        .stdout(predicate::str::contains("health_url"));
}

#[test]
fn classify_reports_most_restrictive_level() {
    let dir = tempfile::tempdir().unwrap();
    evolver(dir.path())
        .args(["classify", "src/config.py", "docs/readme.md", "--format", "text"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0\tsrc/config.py"))
        .stdout(predicate::str::contains("3\tdocs/readme.md"))
        .stdout(predicate::str::contains("task\t0"));
}

#[test]
fn classify_uses_project_safety_tables() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        "[safety]\nforbidden_files = []\nforbidden_patterns = [\"*.key\"]\ncore_files = []\nguarded_files = []\nfree_dirs = [\"notes/\"]\n",
    );
    evolver(dir.path())
        .args(["classify", "deploy.key", "notes/a.md", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"task_level\": 0"))
        .stdout(predicate::str::contains("\"deploy.key\""));
}

#[test]
fn submit_then_history_lists_pending_task() {
    let dir = tempfile::tempdir().unwrap();
    let output = evolver(dir.path())
        .args([
            "evolve",
            "submit",
            "--title",
            "Tidy docs",
            "--description",
            "Rewrite the intro",
            "--files",
            "docs/intro.md",
            "--level",
            "3",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());
    let id = String::from_utf8(output.stdout).unwrap().trim().to_string();
    assert_eq!(id.len(), 32);

    evolver(dir.path())
        .args(["evolve", "history", "--format", "text"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("{id}\tpending\t3")))
        .stdout(predicate::str::contains("Tidy docs"));
}

#[test]
fn submit_from_markdown_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("prompt-tweak.md");
    fs::write(
        &file,
        "# Evolution Task: Soften tone\nLevel 2\n## Description\nAdjust the system prompt.\n## Files\nsrc/prompts/system_prompt.md\n",
    )
    .unwrap();
    evolver(dir.path())
        .args(["evolve", "submit"])
        .arg(&file)
        .assert()
        .success();

    evolver(dir.path())
        .args(["evolve", "history", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"title\": \"Soften tone\""))
        .stdout(predicate::str::contains("\"task_type\": \"prompt\""))
        .stdout(predicate::str::contains("\"level\": 2"));
}

#[test]
fn submit_without_title_or_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    evolver(dir.path())
        .args(["evolve", "submit", "--title", "only a title"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--description"));
}

#[test]
fn submit_rejects_out_of_range_level() {
    let dir = tempfile::tempdir().unwrap();
    evolver(dir.path())
        .args(["evolve", "submit", "--title", "t", "--description", "d", "--level", "4"])
        .assert()
        .failure();
}

#[test]
fn running_unknown_task_is_precondition_failure() {
    let dir = tempfile::tempdir().unwrap();
    evolver(dir.path())
        .args(["evolve", "run", "does-not-exist"])
        .assert()
        .code(6)
        .stderr(predicate::str::contains("Task not found"));
    assert!(!dir.path().join(".evolver/store/locks/evolution.lock").exists());
}

#[test]
fn held_evolution_lease_blocks_second_run() {
    let dir = tempfile::tempdir().unwrap();
    let locks = dir.path().join(".evolver/store/locks");
    fs::create_dir_all(&locks).unwrap();
    let record = serde_json::json!({
        "pid": 1,
        "acquired_at": chrono::Utc::now().to_rfc3339(),
    });
    fs::write(locks.join("evolution.lock"), record.to_string()).unwrap();

    evolver(dir.path())
        .args(["evolve", "pending"])
        .assert()
        .code(6)
        .stderr(predicate::str::contains("another run is active"));
    assert!(locks.join("evolution.lock").exists());
}

#[test]
fn pending_with_empty_queue_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    evolver(dir.path())
        .args(["evolve", "pending"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No pending evolution tasks"));
}

#[test]
fn health_reports_unreachable_service() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        "[service]\nhealth_url = \"http://127.0.0.1:9/health\"\nhealth_timeout_secs = 2\n",
    );
    evolver(dir.path())
        .arg("health")
        .assert()
        .code(1)
        .stdout(predicate::str::starts_with("FAIL - "));
}

#[test]
fn unauthorized_sender_is_rejected_before_analysis() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), "[access]\nauthorized_users = [\"U123\"]\n");
    evolver(dir.path())
        .args(["task", "process", "hello", "--sender", "U999"])
        .assert()
        .code(6)
        .stderr(predicate::str::contains("not authorized"));
}

#[test]
fn task_processing_requires_api_key() {
    let dir = tempfile::tempdir().unwrap();
    evolver(dir.path())
        .args(["task", "process", "hello"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("ANTHROPIC_API_KEY"));
}

#[test]
fn malformed_config_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), "[ralph\nmax_attempts = ");
    evolver(dir.path())
        .args(["classify", "docs/a.md"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains(".evolver.toml"));
}

#[test]
fn run_agent_reports_missing_agent_binary() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        "[agent]\nprogram = \"evolver-test-no-such-agent\"\nbackoff_secs = 0\n",
    );
    evolver(dir.path())
        .args([
            "run",
            "agent",
            "--prompt",
            "say hello",
            "--max-attempts",
            "2",
            "--timeout",
            "5",
            "--format",
            "text",
        ])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("failed after 2 attempt(s)"))
        .stderr(predicate::str::contains("not found"));
    assert!(dir.path().join("tasks").is_dir());
}

#[test]
fn run_agent_requires_prompt() {
    let mut cmd = Command::cargo_bin("evolver").unwrap();
    cmd.args(["run", "agent"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("required arguments were not provided"));
}
