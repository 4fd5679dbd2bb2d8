use serde_json::Value;
use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Output},
};

pub fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_filetrace-rs")
}

/// Run the tracer from `cwd` with `args`.
pub fn filetrace(cwd: &Path, args: &[&str]) -> Output {
    Command::new(bin())
        .current_dir(cwd)
        .args(args)
        .output()
        .expect("Failed to run binary")
}

/// Trace `script` with `sh -c` from inside `dir`, restricted to `dir`, and
/// return the exit status with the parsed JSON report.
pub fn trace_json(dir: &Path, extra: &[&str], script: &str) -> (Option<i32>, Value) {
    let report = dir.join("report.json");
    let report_str = report.to_str().expect("utf-8 path");
    let dir_str = dir.to_str().expect("utf-8 path");
    let mut args = vec!["--format", "json", "-o", report_str, "-d", dir_str];
    args.extend_from_slice(extra);
    args.extend_from_slice(&["--", "sh", "-c", script]);

    let output = filetrace(dir, &args);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let json = fs::read_to_string(&report)
        .unwrap_or_else(|e| panic!("no report ({e}), stderr: {stderr}"));
    let value = serde_json::from_str(&json).expect("valid json");
    (output.status.code(), value)
}

pub fn tempdir() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let canonical = fs::canonicalize(dir.path()).expect("canonicalize");
    (dir, canonical)
}

/// Operations whose path ends with `name`.
pub fn operations_on<'a>(report: &'a Value, name: &str) -> Vec<&'a Value> {
    report["operations"]
        .as_array()
        .expect("operations")
        .iter()
        .filter(|op| op["path"].as_str().is_some_and(|path| path.ends_with(name)))
        .collect()
}

pub fn process<'a>(report: &'a Value, id: &Value) -> &'a Value {
    report["processes"]
        .as_array()
        .expect("processes")
        .iter()
        .rev()
        .find(|process| &process["id"] == id)
        .expect("process entry")
}
