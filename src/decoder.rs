use nix::{errno::Errno, unistd::Pid};
use std::{
    ffi::OsString,
    mem,
    os::unix::ffi::OsStringExt,
    path::PathBuf,
};
use tracing::{debug, trace};

use crate::{
    control::Control,
    hwaccess::Registers,
    oplog::OperationLog,
    path::{self, Scope},
    registry::{Kind, Registry},
};

/// Upper bound on the bytes read for one path argument.
pub const MAX_PATH_LEN: usize = 4096;

const WORD_SIZE: u64 = mem::size_of::<i64>() as u64;

/// What a syscall-entry stop turned out to be.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    /// Not a syscall of interest.
    Ignored,
    /// `exit`/`exit_group`: the id was terminated with this status.
    Exited(i32),
    /// `execve` of this normalized path. Never logged.
    Exec(PathBuf),
    /// Logged with this sequence number.
    Recorded(usize),
    /// A path-bearing call whose path was unreadable, out of scope or
    /// missing.
    Dropped,
}

/// Read a NUL-terminated string out of the address space of `pid`.
///
/// Memory is read one word at a time. At most [`MAX_PATH_LEN`] bytes are
/// returned; longer strings are cut.
///
/// # Errors
///
/// `EFAULT` for a null pointer, otherwise the first `errno` reported while
/// reading.
pub fn read_string(ctl: &impl Control, pid: Pid, addr: u64) -> Result<Vec<u8>, Errno> {
    if addr == 0 {
        return Err(Errno::EFAULT);
    }

    let mut bytes = Vec::new();
    let mut cursor = addr;
    while bytes.len() < MAX_PATH_LEN {
        let word = ctl.read_word(pid, cursor)?;
        for byte in word.to_ne_bytes() {
            if byte == 0 || bytes.len() == MAX_PATH_LEN {
                return Ok(bytes);
            }
            bytes.push(byte);
        }
        cursor = cursor.wrapping_add(WORD_SIZE);
    }

    Ok(bytes)
}

/// Turns syscall-entry register snapshots into file operations.
pub struct Decoder<'a> {
    scope: &'a Scope,
    root: Pid,
}

impl<'a> Decoder<'a> {
    #[must_use]
    /// # Arguments
    ///
    /// * `scope` - Which paths end up in the log.
    /// * `root` - Parent used when an unknown id has to be registered lazily.
    pub fn new(scope: &'a Scope, root: Pid) -> Self {
        Self { scope, root }
    }

    /// Classify the syscall `pid` is entering and act on it.
    ///
    /// Exits terminate `pid` in `registry`. Successful in-scope `open` and
    /// `openat` calls on existing files are appended to `log`. Failures to
    /// read the path argument only drop this one record.
    #[allow(clippy::cast_possible_truncation)]
    pub fn decode(
        &self,
        ctl: &impl Control,
        registry: &mut Registry,
        log: &mut OperationLog,
        pid: Pid,
        regs: &Registers,
    ) -> Decoded {
        match regs.syscall() {
            libc::SYS_exit | libc::SYS_exit_group => {
                let status = regs.arg(0) as i32;
                debug!(pid = %pid, status, "exit");
                registry.terminate(ctl, pid, status);
                Decoded::Exited(status)
            }
            libc::SYS_open => {
                self.record(ctl, registry, log, pid, libc::AT_FDCWD, regs.arg(0))
            }
            libc::SYS_openat => {
                self.record(ctl, registry, log, pid, regs.arg(0) as i32, regs.arg(1))
            }
            libc::SYS_execve => match read_path(ctl, pid, libc::AT_FDCWD, regs.arg(0))
            {
                Some(path) => {
                    debug!(
                        pid = %pid,
                        path = %path.display(),
                        in_scope = path::within_scope(&path, self.scope),
                        "execve"
                    );
                    Decoded::Exec(path)
                }
                None => Decoded::Dropped,
            },
            _ => Decoded::Ignored,
        }
    }

    fn record(
        &self,
        ctl: &impl Control,
        registry: &mut Registry,
        log: &mut OperationLog,
        pid: Pid,
        dirfd: i32,
        addr: u64,
    ) -> Decoded {
        let Some(path) = read_path(ctl, pid, dirfd, addr) else {
            return Decoded::Dropped;
        };
        if self.scope.is_active() && !path::within_scope(&path, self.scope) {
            trace!(pid = %pid, path = %path.display(), "out of scope");
            return Decoded::Dropped;
        }
        if !path.exists() {
            trace!(pid = %pid, path = %path.display(), "missing");
            return Decoded::Dropped;
        }

        if registry.lookup(pid).is_none() {
            registry.register(ctl, Some(self.root), pid, Kind::Thread);
        }
        let name = registry
            .lookup(pid)
            .map(|entry| entry.name().to_string())
            .unwrap_or_default();

        let op = log.append(pid, path, name);
        debug!(
            pid = %pid,
            sequence = op.sequence(),
            path = %op.path().display(),
            "recorded"
        );
        Decoded::Recorded(op.sequence())
    }
}

fn read_path(ctl: &impl Control, pid: Pid, dirfd: i32, addr: u64) -> Option<PathBuf> {
    let bytes = match read_string(ctl, pid, addr) {
        Ok(bytes) if !bytes.is_empty() => bytes,
        Ok(_) => return None,
        Err(errno) => {
            trace!(pid = %pid, addr, %errno, "unreadable path");
            return None;
        }
    };

    let raw = PathBuf::from(OsString::from_vec(bytes));
    let full = if raw.is_relative() {
        match ctl.fd_target(pid, dirfd) {
            Some(base) if !base.as_os_str().is_empty() => path::resolve_relative(&base, &raw),
            _ => raw,
        }
    } else {
        raw
    };

    let normalized = path::normalize(&full);
    (!normalized.as_os_str().is_empty()).then_some(normalized)
}
