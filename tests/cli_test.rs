#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::TempDir;

/// Write an unconfined configuration so the tests run on any host.
fn write_config(dir: &Path, approval_policy: &str) -> std::path::PathBuf {
    let path = dir.join("execward.toml");
    let contents = format!(
        "[sandbox]\ntechnology = \"none\"\n\n[execution]\napproval_policy = \"{approval_policy}\"\nwork_root = \"{}\"\nstate_file = \"{}\"\n",
        dir.join("sessions").display(),
        dir.join("state").join("state.json").display()
    );
    fs::write(&path, contents).expect("write config");
    path
}

fn execward(dir: &TempDir, approval_policy: &str) -> Command {
    let config = write_config(dir.path(), approval_policy);
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("execward"));
    cmd.current_dir(dir.path())
        .env("HOME", dir.path())
        .env("XDG_CONFIG_HOME", dir.path().join("xdg"))
        .env("XDG_DATA_HOME", dir.path().join("xdg-data"))
        .env_remove("EXECWARD_CONFIG_PATH")
        .env_remove("RUST_LOG")
        .stdin(Stdio::null())
        .arg("--config")
        .arg(config);
    cmd
}

#[test]
fn run_prints_snippet_output() {
    let temp = TempDir::new().unwrap();
    execward(&temp, "none")
        .args(["run", "--code", "echo hi; echo warn >&2"])
        .assert()
        .success()
        .stdout("hi\n")
        .stderr(predicate::str::contains("warn"));
}

#[test]
fn run_propagates_exit_code() {
    let temp = TempDir::new().unwrap();
    execward(&temp, "none")
        .args(["run", "--code", "exit 7"])
        .assert()
        .code(7);
}

#[test]
fn run_reads_snippet_from_file() {
    let temp = TempDir::new().unwrap();
    let script = temp.path().join("snippet.sh");
    fs::write(&script, "printf 'from file'\n").unwrap();

    execward(&temp, "none")
        .arg("run")
        .arg("--file")
        .arg(&script)
        .assert()
        .success()
        .stdout("from file");
}

#[test]
fn json_output_describes_the_result() {
    let temp = TempDir::new().unwrap();
    let output = execward(&temp, "none")
        .args(["--json", "run", "--code", "echo structured"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["exit_code"], 0);
    assert_eq!(result["stdout"], "structured\n");
    assert_eq!(result["runtime"], "shell");
    assert_eq!(result["sandbox_type"], "noop");
}

#[test]
fn approval_without_terminal_is_left_pending() {
    let temp = TempDir::new().unwrap();
    execward(&temp, "first_time")
        .args(["run", "--code", "echo should-not-run"])
        .assert()
        .code(3)
        .stdout(predicate::str::contains("should-not-run").not())
        .stderr(predicate::str::contains("pending"));
}

#[test]
fn approved_session_runs_on_resubmit() {
    let temp = TempDir::new().unwrap();
    let output = execward(&temp, "first_time")
        .args(["--json", "run", "--session", "review", "--code", "echo resumed"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(3));
    let pending: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(pending["status"], "pending");
    assert_eq!(pending["session_id"], "review");
    let approval_id = pending["approval_id"].as_str().unwrap().to_string();

    execward(&temp, "first_time")
        .arg("approvals")
        .assert()
        .success()
        .stdout(predicate::str::contains(approval_id.as_str()));

    execward(&temp, "first_time")
        .args(["approve", &approval_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("approved"));

    execward(&temp, "first_time")
        .args(["run", "--session", "review", "--code", "echo resumed"])
        .assert()
        .success()
        .stdout("resumed\n");

    execward(&temp, "first_time")
        .args(["session", "terminate", "review"])
        .assert()
        .success()
        .stdout(predicate::str::contains("terminated"));
}

#[test]
fn approval_state_is_kept_outside_the_work_root() {
    let temp = TempDir::new().unwrap();
    execward(&temp, "first_time")
        .args(["run", "--session", "outside", "--code", "ls -a .."])
        .assert()
        .code(3);

    assert!(temp.path().join("state").join("state.json").exists());
    assert!(!temp.path().join("sessions").join(".state").exists());
}

#[test]
fn state_file_inside_work_root_is_refused() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("nested.toml");
    fs::write(
        &config,
        format!(
            "[execution]\nwork_root = \"{root}\"\nstate_file = \"{root}/.state/state.json\"\n",
            root = temp.path().join("sessions").display()
        ),
    )
    .unwrap();

    Command::new(assert_cmd::cargo::cargo_bin!("execward"))
        .current_dir(temp.path())
        .env("HOME", temp.path())
        .env("XDG_CONFIG_HOME", temp.path().join("xdg"))
        .arg("--config")
        .arg(&config)
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("must not lie inside work_root"));
}

#[test]
fn rejected_approval_blocks_the_session() {
    let temp = TempDir::new().unwrap();
    let output = execward(&temp, "first_time")
        .args(["--json", "run", "--session", "denied", "--code", "echo nope"])
        .output()
        .unwrap();
    let pending: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let approval_id = pending["approval_id"].as_str().unwrap().to_string();

    execward(&temp, "first_time")
        .args(["reject", &approval_id])
        .assert()
        .success();

    execward(&temp, "first_time")
        .args(["run", "--session", "denied", "--code", "echo nope"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("nope").not())
        .stderr(predicate::str::contains("rejected"));

    execward(&temp, "first_time")
        .args(["approve", &approval_id])
        .assert()
        .failure();
}

#[test]
fn unknown_session_status_fails() {
    let temp = TempDir::new().unwrap();
    execward(&temp, "none")
        .args(["session", "status", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ghost"));
}

#[test]
fn yes_flag_approves_the_request() {
    let temp = TempDir::new().unwrap();
    execward(&temp, "always")
        .args(["run", "--yes", "--code", "echo approved"])
        .assert()
        .success()
        .stdout("approved\n");
}

#[test]
fn sandbox_status_reports_capabilities() {
    let temp = TempDir::new().unwrap();
    let output = execward(&temp, "none")
        .args(["--json", "sandbox-status"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["enabled"], false);
    assert_eq!(status["technology"], "none");
    assert!(status["capabilities"]["platform"].is_string());
}

#[test]
fn config_command_prints_effective_configuration() {
    let temp = TempDir::new().unwrap();
    execward(&temp, "always")
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"approval_policy\": \"always\""));
}

#[test]
fn missing_explicit_config_is_reported() {
    let temp = TempDir::new().unwrap();
    Command::new(assert_cmd::cargo::cargo_bin!("execward"))
        .current_dir(temp.path())
        .env("HOME", temp.path())
        .arg("--config")
        .arg(temp.path().join("missing.toml"))
        .arg("sandbox-status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load configuration"));
}
