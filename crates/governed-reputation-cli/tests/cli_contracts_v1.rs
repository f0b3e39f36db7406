#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::{json, Value};
use ulid::Ulid;

fn reputation_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_reputation"))
}

fn self_report_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_self-report"))
}

fn temp_db_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("reputation-contract-{label}-{}.sqlite3", Ulid::new()))
}

fn remove_db(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut raw = path.as_os_str().to_os_string();
        raw.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(raw));
    }
}

fn run_binary(binary: &Path, db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(binary);
    command.env_remove("REPUTATION_DB");
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run {} {:?}: {err}", binary.display(), args),
    }
}

fn reputation_output(db_path: &Path, args: &[&str]) -> Output {
    run_binary(&reputation_binary_path(), db_path, args)
}

fn self_report_output(db_path: &Path, args: &[&str]) -> Output {
    run_binary(&self_report_binary_path(), db_path, args)
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn raw_row_count(db_path: &Path) -> i64 {
    let conn = match Connection::open(db_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to open ledger for inspection: {err}"),
    };
    match conn.query_row("SELECT COUNT(*) FROM task_outcomes", [], |row| row.get(0)) {
        Ok(value) => value,
        Err(err) => panic!("failed to count task_outcomes: {err}"),
    }
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(reputation_binary_path())
        .arg("--help")
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "init", "report", "history", "task", "stats", "policy", "contract",
    ] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn report_json_contract_is_stable() {
    let db_path = temp_db_path("report-json");
    let output = reputation_output(
        &db_path,
        &[
            "report",
            "--task-id",
            "TASK-1",
            "--agent-id",
            "agent-A",
            "--objective",
            "Build X",
            "--status",
            "success",
            "--details",
            "done",
        ],
    );
    assert!(
        output.status.success(),
        "report failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let payload = stdout_json(&output);
    assert_eq!(payload["outcome_seq"], json!(1));
    assert_eq!(payload["task_id"], json!("TASK-1"));
    assert_eq!(payload["agent_id"], json!("agent-A"));
    assert_eq!(payload["objective"], json!("Build X"));
    assert_eq!(payload["status"], json!("success"));
    assert_eq!(payload["score"], json!(1.0));
    assert_eq!(payload["details"], json!("done"));
    assert!(payload["recorded_at"]
        .as_str()
        .is_some_and(|value| value.ends_with('Z')));
    assert_eq!(raw_row_count(&db_path), 1);

    remove_db(&db_path);
}

#[test]
fn history_and_stats_for_fresh_agent_are_empty() {
    let db_path = temp_db_path("fresh-agent");

    let history = reputation_output(&db_path, &["history", "--agent-id", "agent-new"]);
    assert!(history.status.success());
    assert_eq!(stdout_json(&history), json!([]));

    let stats = reputation_output(&db_path, &["stats", "--agent-id", "agent-new"]);
    assert!(stats.status.success());
    assert_eq!(
        stdout_json(&stats),
        json!({
            "agent_id": "agent-new",
            "task_count": 0,
            "mean_score": null,
            "success_count": 0,
            "blocked_count": 0,
            "failure_count": 0,
            "other_count": 0,
            "last_recorded_at": null
        })
    );

    remove_db(&db_path);
}

#[test]
fn policy_json_contract_is_stable() {
    let db_path = temp_db_path("policy");
    let output = reputation_output(&db_path, &["policy"]);
    assert!(output.status.success());
    assert_eq!(
        stdout_json(&output),
        json!([
            { "status": "success", "aliases": [], "score": 1.0 },
            { "status": "blocked", "aliases": [], "score": 0.5 },
            { "status": "failure", "aliases": ["failed", "error"], "score": 0.0 },
            { "status": "(other)", "aliases": [], "score": 0.0 }
        ])
    );
    assert!(!db_path.exists(), "policy must not touch the ledger");
}

#[test]
fn missing_field_exits_non_zero_without_writing() {
    let db_path = temp_db_path("missing-field");
    let output = self_report_output(
        &db_path,
        &[
            "--task-id",
            "TASK-1",
            "--agent-id",
            "agent-A",
            "--objective",
            "Build X",
            "--status",
            "success",
        ],
    );

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("--details"),
        "expected usage error naming the missing field, got stderr={stderr}"
    );
    assert!(!db_path.exists());
}

#[test]
fn empty_task_id_is_a_validation_error() {
    let db_path = temp_db_path("empty-task-id");
    let output = self_report_output(
        &db_path,
        &[
            "--task-id",
            "",
            "--agent-id",
            "agent-A",
            "--objective",
            "Build X",
            "--status",
            "success",
            "--details",
            "done",
        ],
    );

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("error: validation error: task_id MUST be provided"),
        "expected stable validation error shape, got stderr={stderr}"
    );
    assert!(output.stdout.is_empty());
    assert_eq!(raw_row_count(&db_path), 0);

    remove_db(&db_path);
}

#[test]
fn hyphen_leading_ids_are_recorded_verbatim() {
    let db_path = temp_db_path("hyphen-ids");
    let output = self_report_output(
        &db_path,
        &[
            "--task-id",
            "-1",
            "--agent-id",
            "--agent",
            "--objective",
            "-n",
            "--status",
            "success",
            "--details",
            "-",
        ],
    );
    assert!(
        output.status.success(),
        "stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );

    let payload = stdout_json(&output);
    assert_eq!(payload["task_id"], json!("-1"));
    assert_eq!(payload["agent_id"], json!("--agent"));
    assert_eq!(payload["objective"], json!("-n"));
    assert_eq!(raw_row_count(&db_path), 1);

    remove_db(&db_path);
}

#[test]
fn unreachable_store_exits_non_zero_with_message() {
    let db_path = std::env::temp_dir()
        .join(format!("reputation-missing-dir-{}", Ulid::new()))
        .join("ledger.sqlite3");
    let output = self_report_output(
        &db_path,
        &[
            "--task-id",
            "TASK-1",
            "--agent-id",
            "agent-A",
            "--objective",
            "Build X",
            "--status",
            "success",
            "--details",
            "done",
        ],
    );

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.starts_with("error: persistence error: failed to open sqlite database"),
        "expected stable persistence error shape, got stderr={stderr}"
    );
}

#[test]
fn corrupt_store_exits_non_zero() {
    let db_path = temp_db_path("corrupt");
    if let Err(err) = std::fs::write(&db_path, b"definitely not sqlite") {
        panic!("failed to write corrupt fixture: {err}");
    }

    let output = reputation_output(&db_path, &["history", "--agent-id", "agent-A"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).starts_with("error: "));

    remove_db(&db_path);
}

#[test]
fn db_path_can_come_from_environment() {
    let db_path = temp_db_path("env");
    let output = match Command::new(self_report_binary_path())
        .env("REPUTATION_DB", &db_path)
        .args([
            "--task-id",
            "TASK-env",
            "--agent-id",
            "agent-env",
            "--objective",
            "env config",
            "--status",
            "blocked",
            "--details",
            "",
        ])
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run self-report: {err}"),
    };

    assert!(
        output.status.success(),
        "self-report failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(raw_row_count(&db_path), 1);

    remove_db(&db_path);
}
