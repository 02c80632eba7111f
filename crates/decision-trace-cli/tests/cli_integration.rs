use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;

const THREAD: &str = "From: john.sales@company.com\n\
Customer is asking for a 18% discount on the renewal.\n\
Approved at 18% by jane.vp@company.com\n";

fn unique_temp_path(prefix: &str, suffix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}-{}{suffix}", ulid::Ulid::new()))
}

fn run_dtrace<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_dtrace"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute dtrace binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_dtrace(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "dtrace command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_str<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{pointer}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

#[test]
fn migrate_reports_schema_up_to_date() {
    let db = unique_temp_path("dtrace-cli-migrate", ".sqlite3");

    let migrated = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(migrated.get("contract_version").and_then(Value::as_str), Some("cli.v1"));
    assert_eq!(migrated.get("up_to_date").and_then(Value::as_bool), Some(true));

    let status = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(status.get("current_version").and_then(Value::as_i64), Some(1));
    assert_eq!(status.get("up_to_date").and_then(Value::as_bool), Some(true));

    let _ = fs::remove_file(&db);
}

#[test]
fn ingest_show_and_recent_round_trip() {
    let db = unique_temp_path("dtrace-cli-ingest", ".sqlite3");

    let report = run_json([
        "--db",
        path_str(&db),
        "ingest",
        "--text",
        THREAD,
        "--customer",
        "MedTech Corp",
        "--decision-type",
        "discount-approval",
        "--message-key",
        "msg-cli-001",
    ]);
    assert_eq!(report.pointer("/persisted").and_then(Value::as_bool), Some(true));
    let decision_id = as_str(&report, "/trace/decision_id").to_string();
    assert!(decision_id.starts_with("dec_"));

    let replay = run_json([
        "--db",
        path_str(&db),
        "ingest",
        "--text",
        THREAD,
        "--customer",
        "MedTech Corp",
        "--decision-type",
        "discount-approval",
        "--message-key",
        "msg-cli-001",
    ]);
    assert_eq!(replay.pointer("/persisted").and_then(Value::as_bool), Some(false));
    assert_eq!(
        replay.pointer("/duplicate_of").and_then(Value::as_str),
        Some(decision_id.as_str())
    );

    let shown = run_json(["--db", path_str(&db), "decision", "show", "--id", decision_id.as_str()]);
    assert_eq!(as_str(&shown, "/request/customer"), "MedTech Corp");

    let recent = run_json(["--db", path_str(&db), "decision", "recent", "--limit", "10"]);
    let rows = match recent.pointer("/decisions").and_then(Value::as_array) {
        Some(rows) => rows,
        None => panic!("decision list should be an array: {recent}"),
    };
    assert_eq!(rows.len(), 1);

    let _ = fs::remove_file(&db);
}

#[test]
fn patterns_aggregate_over_ingested_decisions() {
    let db = unique_temp_path("dtrace-cli-patterns", ".sqlite3");

    let _ = run_json([
        "--db",
        path_str(&db),
        "ingest",
        "--text",
        THREAD,
        "--customer",
        "MedTech Corp",
        "--decision-type",
        "discount-approval",
    ]);

    let stats = run_json([
        "--db",
        path_str(&db),
        "patterns",
        "--decision-type",
        "discount-approval",
    ]);
    assert_eq!(stats.pointer("/total").and_then(Value::as_i64), Some(1));
    assert_eq!(stats.pointer("/approved").and_then(Value::as_i64), Some(1));

    let _ = fs::remove_file(&db);
}

#[test]
fn policy_commands_resolve_the_version_table() {
    let db = unique_temp_path("dtrace-cli-policy", ".sqlite3");

    let current = run_json(["--db", path_str(&db), "policy", "current"]);
    assert_eq!(current.get("version").and_then(Value::as_str), Some("v2.0"));

    let earlier = run_json([
        "--db",
        path_str(&db),
        "policy",
        "at",
        "--timestamp",
        "2024-06-01T00:00:00Z",
    ]);
    assert_eq!(as_str(&earlier, "/policy/version"), "v1.0");

    let listed = run_json(["--db", path_str(&db), "policy", "list"]);
    let versions = match listed.pointer("/versions").and_then(Value::as_array) {
        Some(versions) => versions,
        None => panic!("policy list should be an array: {listed}"),
    };
    assert_eq!(versions.len(), 2);

    let _ = fs::remove_file(&db);
}

#[test]
fn export_writes_snapshot_with_manifest() {
    let db = unique_temp_path("dtrace-cli-export", ".sqlite3");
    let out_dir = unique_temp_path("dtrace-cli-export-out", "");

    let _ = run_json([
        "--db",
        path_str(&db),
        "ingest",
        "--text",
        THREAD,
        "--customer",
        "MedTech Corp",
        "--decision-type",
        "discount-approval",
    ]);

    let exported = run_json(["--db", path_str(&db), "db", "export", "--out", path_str(&out_dir)]);
    let files = match exported.pointer("/manifest/files").and_then(Value::as_array) {
        Some(files) => files,
        None => panic!("manifest should list files: {exported}"),
    };
    assert_eq!(files.len(), 2);
    assert!(out_dir.join("manifest.json").is_file());
    assert!(out_dir.join("decision_traces.ndjson").is_file());

    let _ = fs::remove_file(&db);
    let _ = fs::remove_dir_all(&out_dir);
}
