use serde_derive::Serialize;
use std::{io::Write, time::UNIX_EPOCH};

use crate::{
    diag::Result,
    engine::Session,
    oplog::FileOperation,
    registry::{Kind, ThreadInfo},
};

#[derive(Serialize)]
struct Process<'a> {
    id: i32,
    parent: Option<i32>,
    name: &'a str,
    kind: Kind,
    active: bool,
    exit_status: Option<i32>,
    child_processes: Vec<i32>,
    child_threads: Vec<i32>,
    created_at_ms: u64,
}

impl<'a> From<&'a ThreadInfo> for Process<'a> {
    fn from(info: &'a ThreadInfo) -> Self {
        Self {
            id: info.id().as_raw(),
            parent: info.parent().map(|pid| pid.as_raw()),
            name: info.name(),
            kind: info.kind(),
            active: info.is_active(),
            exit_status: info.exit_status(),
            child_processes: info.child_processes().iter().map(|pid| pid.as_raw()).collect(),
            child_threads: info.child_threads().iter().map(|pid| pid.as_raw()).collect(),
            created_at_ms: info
                .created_at()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |elapsed| {
                    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
                }),
        }
    }
}

#[derive(Serialize)]
struct Report<'a> {
    command: &'a str,
    root: i32,
    exit_status: Option<i32>,
    fatal: Option<&'a str>,
    operations: &'a [FileOperation],
    processes: Vec<Process<'a>>,
}

/// Write the operation log and the full process history of `session` as
/// pretty-printed JSON.
///
/// # Errors
///
/// Returns `Err` if serialization or writing fails.
pub fn render(session: &Session, command: &str, out: &mut impl Write) -> Result<()> {
    let report = Report {
        command,
        root: session.root().as_raw(),
        exit_status: session.root_status(),
        fatal: session.fatal(),
        operations: session.log().as_slice(),
        processes: session.registry().iter().map(Process::from).collect(),
    };
    serde_json::to_writer_pretty(&mut *out, &report)?;
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        control::testing::Fake,
        oplog::OperationLog,
        registry::Registry,
        report::tests::session_with,
    };
    use nix::unistd::Pid;
    use serde_json::Value;
    use std::{ffi::OsStr, os::unix::ffi::OsStrExt, path::PathBuf};

    #[test]
    fn test_render_operations_and_processes() {
        let session = session_with(&[(100, "/tmp/a"), (101, "/tmp/b"), (100, "/tmp/c")]);
        let mut out = Vec::new();
        render(&session, "sh -c true", &mut out).expect("render");
        let json: Value = serde_json::from_slice(&out).expect("valid json");

        assert_eq!(json["command"], "sh -c true");
        assert_eq!(json["root"], 100);
        assert_eq!(json["exit_status"], 0);
        assert!(json["fatal"].is_null());

        let operations = json["operations"].as_array().expect("operations");
        assert_eq!(operations.len(), 3);
        assert_eq!(operations[1]["sequence"], 2);
        assert_eq!(operations[1]["owner"], 101);
        assert_eq!(operations[1]["thread_name"], "cat");
        assert_eq!(operations[2]["path"], "/tmp/c");

        let processes = json["processes"].as_array().expect("processes");
        assert_eq!(processes.len(), 2);
        assert_eq!(processes[0]["kind"], "Process");
        assert!(processes[0]["parent"].is_null());
        assert_eq!(processes[0]["child_processes"][0], 101);
        assert_eq!(processes[1]["parent"], 100);
    }

    #[test]
    fn test_render_non_utf8_path() {
        let root = Pid::from_raw(100);
        let mut fake = Fake::new();
        fake.set_name(root, "sh");
        let mut registry = Registry::new();
        registry.register(&fake, None, root, Kind::Process);
        let mut log = OperationLog::new();
        log.append(root, PathBuf::from("/tmp/ok.txt"), "sh".into());
        log.append(
            root,
            PathBuf::from(OsStr::from_bytes(b"/tmp/caf\xe9.txt")),
            "sh".into(),
        );
        let session = Session::from_parts(registry, log, root, Some(0));

        let mut out = Vec::new();
        render(&session, "sh", &mut out).expect("render");
        let json: Value = serde_json::from_slice(&out).expect("valid json");

        let operations = json["operations"].as_array().expect("operations");
        assert_eq!(operations.len(), 2);
        assert_eq!(operations[0]["path"], "/tmp/ok.txt");
        assert_eq!(operations[1]["path"], "/tmp/caf\u{fffd}.txt");
        assert_eq!(operations[1]["sequence"], 2);
    }
}
