#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

struct TempDb(PathBuf);

impl TempDb {
    fn new(label: &str) -> Self {
        Self(std::env::temp_dir().join(format!("lb-contract-{label}-{}.sqlite3", Ulid::new())))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut raw = self.0.clone().into_os_string();
            raw.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(raw));
        }
    }
}

fn lb_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_lb") {
        Ok(value) => PathBuf::from(value),
        Err(_) => PathBuf::from(env!("CARGO_BIN_EXE_lb")),
    }
}

fn lb_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(lb_binary_path());
    command
        .arg("--db")
        .arg(db_path)
        .arg("--cache-url")
        .arg("memory")
        .env_remove("RUST_LOG");
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run lb command {:?}: {err}", args),
    }
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

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "command failed\nstdout={}\nstderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(lb_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["migrate", "submit", "top", "rank", "history", "cache", "audit"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn submit_accumulates_and_rank_reports_total() {
    let db = TempDb::new("submit");

    let first = lb_output(db.path(), &["submit", "--participant", "42", "--delta", "50"]);
    assert_success(&first);
    let first = stdout_json(&first);
    assert_eq!(first["total_score"], 50);
    assert_eq!(first["event"]["participant_id"], 42);
    assert_eq!(first["event"]["category"], "default");

    let second = lb_output(
        db.path(),
        &[
            "submit",
            "--participant",
            "42",
            "--delta",
            "30",
            "--category",
            "bonus",
            "--occurred-at",
            "2026-02-07T12:00:00Z",
        ],
    );
    assert_success(&second);
    assert_eq!(stdout_json(&second)["total_score"], 80);

    let rank = lb_output(db.path(), &["rank", "--participant", "42"]);
    assert_success(&rank);
    let rank = stdout_json(&rank);
    assert_eq!(rank["participant_id"], 42);
    assert_eq!(rank["score"], 80);
    assert_eq!(rank["rank"], 1);

    let history = lb_output(db.path(), &["history", "--participant", "42"]);
    assert_success(&history);
    let history = stdout_json(&history);
    let events = match history.as_array() {
        Some(value) => value,
        None => panic!("history output must be an array: {history}"),
    };
    assert_eq!(events.len(), 2);
}

#[test]
fn top_orders_by_score_with_competition_ranks() {
    let db = TempDb::new("top");
    for (participant, delta) in [("1", "100"), ("2", "90"), ("3", "90"), ("4", "10")] {
        let output = lb_output(
            db.path(),
            &["submit", "--participant", participant, "--delta", delta],
        );
        assert_success(&output);
    }

    let output = lb_output(db.path(), &["top", "--k", "3"]);
    assert_success(&output);
    let top = stdout_json(&output);
    let entries = match top.as_array() {
        Some(value) => value,
        None => panic!("top output must be an array: {top}"),
    };

    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0]["participant_id"], 1);
    assert_eq!(entries[0]["rank"], 1);
    assert_eq!(entries[1]["score"], 90);
    assert_eq!(entries[1]["rank"], 2);
    assert_eq!(entries[2]["score"], 90);
    assert_eq!(entries[2]["rank"], 2);
}

#[test]
fn rank_of_unknown_participant_exits_non_zero() {
    let db = TempDb::new("missing");
    assert_success(&lb_output(db.path(), &["migrate"]));

    let output = lb_output(db.path(), &["rank", "--participant", "7"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not found"), "stderr={stderr}");
}

#[test]
fn negative_delta_is_rejected_without_writing() {
    let db = TempDb::new("negative");
    let output = lb_output(db.path(), &["submit", "--participant", "5", "--delta", "-3"]);
    assert!(!output.status.success());

    let conn = match Connection::open(db.path()) {
        Ok(value) => value,
        Err(err) => panic!("failed to open db: {err}"),
    };
    let events: i64 = match conn.query_row("SELECT COUNT(*) FROM score_events", [], |row| {
        row.get(0)
    }) {
        Ok(value) => value,
        Err(err) => panic!("failed to count events: {err}"),
    };
    assert_eq!(events, 0);
}

#[test]
fn audit_passes_on_consistent_state() {
    let db = TempDb::new("audit-ok");
    for (participant, delta) in [("1", "5"), ("2", "15"), ("1", "20")] {
        assert_success(&lb_output(
            db.path(),
            &["submit", "--participant", participant, "--delta", delta],
        ));
    }

    let audit = lb_output(db.path(), &["audit", "totals"]);
    assert_success(&audit);
    assert_eq!(stdout_json(&audit), Value::Array(Vec::new()));
}

#[test]
fn cache_maintenance_is_rejected_on_the_in_process_cache() {
    let db = TempDb::new("maintenance");
    assert_success(&lb_output(
        db.path(),
        &["submit", "--participant", "1", "--delta", "5"],
    ));

    for args in [
        &["cache", "rebuild"][..],
        &["cache", "check", "--limit", "10"][..],
    ] {
        let output = lb_output(db.path(), args);
        assert!(
            !output.status.success(),
            "{args:?} must fail on the in-process cache"
        );
        assert!(output.stdout.is_empty());
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("shared cache"), "stderr={stderr}");
    }
}

#[test]
fn audit_totals_fails_when_aggregate_diverges_from_events() {
    let db = TempDb::new("audit");
    assert_success(&lb_output(
        db.path(),
        &["submit", "--participant", "9", "--delta", "40"],
    ));

    let conn = match Connection::open(db.path()) {
        Ok(value) => value,
        Err(err) => panic!("failed to open db: {err}"),
    };
    if let Err(err) = conn.execute(
        "UPDATE leaderboard_aggregates SET total_score = 41 WHERE participant_id = 9",
        [],
    ) {
        panic!("failed to tamper aggregate: {err}");
    }
    drop(conn);

    let output = lb_output(db.path(), &["audit", "totals"]);
    assert!(!output.status.success());
    let mismatches = stdout_json(&output);
    assert_eq!(mismatches[0]["participant_id"], 9);
    assert_eq!(mismatches[0]["total_score"], 41);
    assert_eq!(mismatches[0]["event_sum"], 40);
}
