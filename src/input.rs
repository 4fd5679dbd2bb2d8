use nix::{
    errno::Errno,
    unistd::{access, AccessFlags},
};
use std::{
    env,
    ffi::{CString, OsStr, OsString},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use crate::diag::{Context, Error, Result};

fn is_executable(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

fn to_cstring(value: &OsStr) -> Result<CString> {
    CString::new(value.as_bytes()).map_err(Error::from)
}

/// Locate `command` the way a shell would.
///
/// A name containing a `/` is taken as a path; anything else is looked up in
/// each `PATH` entry in order.
///
/// # Returns
///
/// The path to an executable file, or `None`.
#[must_use]
pub fn find_executable(command: &OsStr) -> Option<PathBuf> {
    let path = Path::new(command);
    if command.as_bytes().contains(&b'/') {
        return is_executable(path).then(|| path.to_path_buf());
    }

    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths)
            .map(|dir| dir.join(command))
            .find(|candidate| is_executable(candidate))
    })
}

/// Build the `execve` argument vector for `command`.
///
/// The first element is replaced with the resolved executable path.
///
/// # Errors
///
/// Will return `Err` if `command` is empty, if the executable cannot be
/// found, or if an argument contains an interior NUL byte.
pub fn args(command: &[OsString]) -> Result<Vec<CString>> {
    let (program, rest) = command
        .split_first()
        .ok_or_else(|| Error::from_errno(Errno::EINVAL).context("no command"))?;
    let executable = find_executable(program).ok_or_else(|| {
        Error::from_errno(Errno::ENOENT)
            .context(format!("{}: command not found", program.to_string_lossy()))
    })?;

    let mut ret = vec![to_cstring(executable.as_os_str())?];
    for arg in rest {
        ret.push(to_cstring(arg).context("invalid argument")?);
    }
    Ok(ret)
}

/// # Errors
///
/// Will return `Err` if an environment variable contains a NUL byte.
pub fn env() -> Result<Vec<CString>> {
    env::vars_os()
        .map(|(key, val)| {
            let mut entry = key;
            entry.push("=");
            entry.push(val);
            to_cstring(&entry)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_executable_in_path() {
        let sh = find_executable(OsStr::new("sh")).expect("sh in PATH");
        assert!(sh.is_absolute());
        assert!(sh.ends_with("sh"));
    }

    #[test]
    fn test_find_executable_explicit_path() {
        assert_eq!(
            find_executable(OsStr::new("/bin/sh")),
            Some(PathBuf::from("/bin/sh"))
        );
        assert_eq!(find_executable(OsStr::new("/nonexistent/binary")), None);
    }

    #[test]
    fn test_find_executable_skips_plain_files() {
        use std::{fs, os::unix::fs::PermissionsExt};

        let file = tempfile::NamedTempFile::new().expect("tempfile");
        fs::set_permissions(file.path(), fs::Permissions::from_mode(0o644))
            .expect("chmod");
        assert_eq!(find_executable(file.path().as_os_str()), None);
    }

    #[test]
    fn test_args_resolve_program() {
        let command = vec![OsString::from("sh"), OsString::from("-c"), "true".into()];
        let args = args(&command).expect("args");
        assert_eq!(args.len(), 3);
        assert!(args[0].to_bytes().ends_with(b"/sh"));
        assert_eq!(args[2].to_bytes(), b"true");
    }

    #[test]
    fn test_args_errors() {
        let err = args(&[]).expect_err("empty");
        assert_eq!(err.errno(), Some(Errno::EINVAL));

        let err = args(&[OsString::from("definitely-not-a-command-xyz")])
            .expect_err("missing");
        assert_eq!(err.errno(), Some(Errno::ENOENT));
        assert!(err.message().contains("command not found"));
    }

    #[test]
    fn test_env_entries() {
        let env = env().expect("env");
        assert!(env
            .iter()
            .all(|entry| entry.to_bytes().contains(&b'=')));
    }
}
