use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::{Command, Output};

use serde_json::Value;

fn unique_temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("household-state-cli-{}.sqlite3", ulid::Ulid::new()))
}

fn run_hsk<I, S>(db: &PathBuf, args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_hsk"))
        .arg("--db")
        .arg(db)
        .args(["--free-limit", "3"])
        .args(args)
        .env_remove("HSK_FREE_LIMIT")
        .env_remove("HSK_UNKNOWN_KEYS")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute hsk binary: {err}"))
}

fn run_json<I, S>(db: &PathBuf, args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_hsk(db, args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "hsk command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn pointer_f64(value: &Value, pointer: &str) -> f64 {
    value
        .pointer(pointer)
        .and_then(Value::as_f64)
        .unwrap_or_else(|| panic!("missing number at `{pointer}` in payload: {value}"))
}

fn pointer_u64(value: &Value, pointer: &str) -> u64 {
    value
        .pointer(pointer)
        .and_then(Value::as_u64)
        .unwrap_or_else(|| panic!("missing integer at `{pointer}` in payload: {value}"))
}

// Test IDs: TCLI-101
#[test]
fn migrate_dry_run_then_apply_reports_schema_versions() {
    let db = unique_temp_db_path();

    let planned = run_json(&db, ["db", "migrate", "--dry-run"]);
    assert_eq!(planned.get("contract_version").and_then(Value::as_str), Some("cli.v1"));
    assert_eq!(planned.get("dry_run"), Some(&Value::Bool(true)));
    assert_eq!(planned.get("would_apply_versions"), Some(&serde_json::json!([1, 2])));

    let applied = run_json(&db, ["db", "migrate"]);
    assert_eq!(applied.get("up_to_date"), Some(&Value::Bool(true)));

    let status = run_json(&db, ["db", "schema-version"]);
    assert_eq!(status.get("current_version").and_then(Value::as_i64), Some(2));
    assert_eq!(status.get("pending_versions"), Some(&serde_json::json!([])));
}

// Test IDs: TCLI-102
#[test]
fn set_delta_and_show_flow_clamps_at_zero() {
    let db = unique_temp_db_path();

    let set = run_json(
        &db,
        ["state", "set", "--household-id", "hh-cli", "--key", "cash", "--value", "2,500", "--kind", "money"],
    );
    assert_eq!(pointer_u64(&set, "/version"), 1);
    assert_eq!(set.get("changed"), Some(&Value::Bool(true)));

    let delta = run_json(&db, ["state", "delta", "--household-id", "hh-cli", "--delta", "savings=-5000"]);
    assert_eq!(pointer_u64(&delta, "/version"), 2);

    let shown = run_json(&db, ["state", "show", "--household-id", "hh-cli"]);
    assert_eq!(pointer_f64(&shown, "/snapshot/inputs/slots/cash_liquid_total/value"), 0.0);
    assert_eq!(pointer_u64(&shown, "/usage/used"), 2);

    let merged = run_json(
        &db,
        ["state", "merge", "--household-id", "hh-cli", "--slot", "rent=1200", "--input", "source=\"cli\""],
    );
    assert_eq!(pointer_u64(&merged, "/usage/remaining"), 0);

    let blocked = run_hsk(&db, ["state", "set", "--household-id", "hh-cli", "--key", "kids", "--value", "2"]);
    assert!(!blocked.status.success());
    assert!(String::from_utf8_lossy(&blocked.stderr).contains("free snapshot limit reached"));

    let integrity = run_json(&db, ["db", "integrity-check"]);
    assert_eq!(integrity.get("usage_mismatches"), Some(&serde_json::json!([])));
}

// Test IDs: TCLI-103
#[test]
fn entitlement_claim_and_delete_lifecycle() {
    let db = unique_temp_db_path();
    run_json(&db, ["state", "set", "--household-id", "hh-life", "--key", "income", "--value", "4000"]);

    let premium = run_json(
        &db,
        [
            "entitlement",
            "set",
            "--household-id",
            "hh-life",
            "--plan",
            "premium",
            "--status",
            "active",
            "--period-end",
            "2999-01-01T00:00:00Z",
        ],
    );
    assert_eq!(premium.get("premium"), Some(&Value::Bool(true)));
    let shown = run_json(&db, ["entitlement", "show", "--household-id", "hh-life"]);
    assert_eq!(shown.pointer("/entitlement/plan").and_then(Value::as_str), Some("premium"));

    let claimed = run_json(&db, ["household", "claim", "--household-id", "hh-life", "--subject", "alice"]);
    assert_eq!(claimed.get("owner_subject").and_then(Value::as_str), Some("alice"));
    let stolen = run_hsk(&db, ["household", "claim", "--household-id", "hh-life", "--subject", "bob"]);
    assert!(!stolen.status.success());

    let anonymous = run_hsk(&db, ["state", "show", "--household-id", "hh-life"]);
    assert!(!anonymous.status.success());
    let owner_view = run_json(&db, ["state", "show", "--household-id", "hh-life", "--subject", "alice"]);
    assert_eq!(pointer_f64(&owner_view, "/snapshot/inputs/slots/income_net_monthly/value"), 4000.0);

    let summary = run_json(&db, ["household", "show", "--household-id", "hh-life"]);
    assert_eq!(pointer_u64(&summary, "/snapshot_count"), 1);

    let deleted = run_json(&db, ["household", "delete", "--household-id", "hh-life"]);
    assert_eq!(deleted.get("household_deleted"), Some(&Value::Bool(true)));
    let missing = run_hsk(&db, ["household", "show", "--household-id", "hh-life"]);
    assert!(!missing.status.success());
}

// Test IDs: TCLI-104
#[test]
fn malformed_arguments_fail_without_touching_state() {
    let db = unique_temp_db_path();
    for args in [
        vec!["state", "delta", "--household-id", "hh-bad", "--delta", "cash"],
        vec!["state", "delta", "--household-id", "hh-bad", "--delta", "cash=lots"],
        vec!["state", "set", "--household-id", "bad id", "--key", "cash", "--value", "1"],
        vec!["state", "set", "--key", "cash", "--value", "1", "--kind", "currency"],
        vec!["entitlement", "set", "--household-id", "hh-bad", "--status", "suspended"],
    ] {
        let output = run_hsk(&db, &args);
        assert!(!output.status.success(), "expected failure for {args:?}");
    }

    let status = run_json(&db, ["db", "schema-version"]);
    assert!(status.get("current_version").is_some());
}

// Test IDs: TCLI-105
#[test]
fn operator_writes_emit_log_events_on_stderr() {
    let db = unique_temp_db_path();
    run_json(&db, ["state", "set", "--household-id", "hh-logged", "--key", "cash", "--value", "10"]);

    let output = Command::new(env!("CARGO_BIN_EXE_hsk"))
        .arg("--db")
        .arg(&db)
        .args(["household", "delete", "--household-id", "hh-logged"])
        .env("RUST_LOG", "hsk=info")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute hsk binary: {err}"));
    assert!(output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("household deleted"), "stderr:\n{stderr}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("household deleted"));
}
