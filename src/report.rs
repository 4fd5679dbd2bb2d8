//! Rendering of a finished session: an HTML directory tree for people, a
//! JSON dump for tools.

use clap::ValueEnum;
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};
use tracing::info;

use crate::{
    diag::{Context, Result},
    engine::Session,
};

pub mod html;
pub mod json;
pub mod tree;

/// Report output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Collapsible, searchable directory tree
    #[default]
    Html,
    /// Operation log and process history
    Json,
}

/// Render `session` into `out`.
///
/// # Errors
///
/// Returns `Err` if rendering or writing fails.
pub fn render(
    session: &Session,
    command: &str,
    format: Format,
    out: &mut impl Write,
) -> Result<()> {
    match format {
        Format::Html => html::render(session, command, out),
        Format::Json => json::render(session, command, out),
    }
}

/// Render `session` into the file at `output`, replacing it.
///
/// # Errors
///
/// Returns `Err` if the file cannot be created or written.
pub fn write(session: &Session, command: &str, output: &Path, format: Format) -> Result<()> {
    let file = File::create(output).context(output.display())?;
    let mut out = BufWriter::new(file);
    render(session, command, format, &mut out)?;
    out.flush().context(output.display())?;
    info!(
        path = %output.display(),
        ?format,
        operations = session.log().len(),
        "report written"
    );
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use crate::{
        control::testing::Fake,
        oplog::OperationLog,
        registry::{Kind, Registry},
    };
    use nix::unistd::Pid;
    use std::{fs, path::PathBuf};

    /// Session rooted at 100 ("sh"), where every other id is a child process
    /// named "cat", holding one operation per `(id, path)` entry.
    pub(crate) fn session_with(operations: &[(i32, &str)]) -> Session {
        let root = Pid::from_raw(100);
        let mut fake = Fake::new();
        fake.set_name(root, "sh");
        for (id, _) in operations {
            if *id != 100 {
                fake.set_name(Pid::from_raw(*id), "cat");
            }
        }

        let mut registry = Registry::new();
        registry.register(&fake, None, root, Kind::Process);
        let mut log = OperationLog::new();
        for (id, path) in operations {
            let pid = Pid::from_raw(*id);
            if pid != root {
                registry.register(&fake, Some(root), pid, Kind::Process);
            }
            let name = registry
                .lookup(pid)
                .map(|entry| entry.name().to_string())
                .unwrap_or_default();
            log.append(pid, PathBuf::from(path), name);
        }

        Session::from_parts(registry, log, root, Some(0))
    }

    #[test]
    fn test_write_creates_file_per_format() {
        let dir = tempfile::tempdir().expect("tempdir");
        let session = session_with(&[(100, "/tmp/a.txt")]);

        let html = dir.path().join("out.html");
        write(&session, "cat a.txt", &html, Format::Html).expect("html");
        assert!(fs::read_to_string(&html)
            .expect("read")
            .contains("a.txt"));

        let json = dir.path().join("out.json");
        write(&session, "cat a.txt", &json, Format::Json).expect("json");
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&json).expect("read")).expect("parse");
        assert_eq!(value["operations"][0]["path"], "/tmp/a.txt");
    }

    #[test]
    fn test_write_to_missing_directory_fails() {
        let session = session_with(&[]);
        let result = write(
            &session,
            "true",
            Path::new("/nonexistent/dir/out.html"),
            Format::Html,
        );
        let err = result.expect_err("missing directory");
        assert!(err.message().contains("/nonexistent/dir/out.html"));
    }
}
