use nix::{
    errno::Errno,
    sys::{
        ptrace,
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};
use procfs::process::{FDTarget, Process};
use std::{path::PathBuf, thread, time::Duration};

use crate::hwaccess::Registers;

/// Name recorded for an id whose `/proc` entry could not be read.
pub const UNKNOWN_NAME: &str = "unknown";

/// Kernel-facing operations used while tracing.
///
/// Everything the registry, the decoder and the event loop ask of the kernel
/// goes through this trait: waiting for stop events, resuming and detaching
/// tracees, reading their registers and memory, probing liveness and reading
/// the `/proc` pseudo-filesystem. `Ptrace` is the real implementation; tests
/// drive the same code with a scripted fake.
///
/// Every call must come from the thread that attached to the tracee.
pub trait Control {
    /// Block until any tracee produces a stop event (`waitpid(-1, __WALL)`).
    ///
    /// # Errors
    ///
    /// Returns the raw `errno`, notably `ECHILD` when nothing is left to wait
    /// for.
    fn wait_any(&self) -> Result<WaitStatus, Errno>;

    /// Block until `pid` produces a stop event.
    ///
    /// # Errors
    ///
    /// Returns the raw `errno` reported by `waitpid`.
    fn wait_for(&self, pid: Pid) -> Result<WaitStatus, Errno>;

    /// Enable syscall-stop marking and fork/vfork/clone/exit/exec events.
    ///
    /// # Errors
    ///
    /// Returns the raw `errno` reported by `PTRACE_SETOPTIONS`.
    fn set_options(&self, pid: Pid) -> Result<(), Errno>;

    /// Resume `pid` until its next syscall boundary, optionally injecting
    /// `signal`.
    ///
    /// # Errors
    ///
    /// Returns the raw `errno` reported by `PTRACE_SYSCALL`.
    fn resume(&self, pid: Pid, signal: Option<Signal>) -> Result<(), Errno>;

    /// Release `pid`. Idempotent; failures (already gone, not stopped) are
    /// swallowed.
    fn detach(&self, pid: Pid);

    /// The message attached to the last ptrace event of `pid`.
    ///
    /// # Errors
    ///
    /// Returns the raw `errno` reported by `PTRACE_GETEVENTMSG`.
    fn event_message(&self, pid: Pid) -> Result<i64, Errno>;

    /// Snapshot the registers of the stopped `pid`.
    ///
    /// # Errors
    ///
    /// Returns the raw `errno` reported by `PTRACE_GETREGS`.
    fn registers(&self, pid: Pid) -> Result<Registers, Errno>;

    /// Read one machine word at `addr` in the address space of `pid`.
    ///
    /// # Errors
    ///
    /// Returns the raw `errno` reported by `PTRACE_PEEKDATA`.
    fn read_word(&self, pid: Pid, addr: u64) -> Result<i64, Errno>;

    /// Best-effort signal delivery; failures are ignored.
    fn signal(&self, pid: Pid, signal: Signal);

    /// Signal-0 style liveness probe.
    fn is_alive(&self, pid: Pid) -> bool;

    /// The command name of `pid`, or [`UNKNOWN_NAME`].
    fn thread_name(&self, pid: Pid) -> String;

    /// The target of descriptor `fd` of `pid`. `AT_FDCWD` resolves to the
    /// working directory. `None` when unreadable or not a path.
    fn fd_target(&self, pid: Pid, fd: i32) -> Option<PathBuf>;

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[must_use]
/// Options armed on every tracee.
pub fn trace_options() -> ptrace::Options {
    ptrace::Options::PTRACE_O_TRACESYSGOOD
        | ptrace::Options::PTRACE_O_TRACEFORK
        | ptrace::Options::PTRACE_O_TRACEVFORK
        | ptrace::Options::PTRACE_O_TRACECLONE
        | ptrace::Options::PTRACE_O_TRACEEXIT
        | ptrace::Options::PTRACE_O_TRACEEXEC
}

/// `Control` backed by `ptrace(2)`, `waitpid(2)`, `kill(2)` and `/proc`.
#[derive(Default)]
pub struct Ptrace;

impl Control for Ptrace {
    fn wait_any(&self) -> Result<WaitStatus, Errno> {
        waitpid(None, Some(WaitPidFlag::__WALL))
    }

    fn wait_for(&self, pid: Pid) -> Result<WaitStatus, Errno> {
        waitpid(pid, Some(WaitPidFlag::__WALL))
    }

    fn set_options(&self, pid: Pid) -> Result<(), Errno> {
        ptrace::setoptions(pid, trace_options())
    }

    fn resume(&self, pid: Pid, signal: Option<Signal>) -> Result<(), Errno> {
        ptrace::syscall(pid, signal)
    }

    fn detach(&self, pid: Pid) {
        let _ = ptrace::detach(pid, None);
    }

    fn event_message(&self, pid: Pid) -> Result<i64, Errno> {
        ptrace::getevent(pid)
    }

    fn registers(&self, pid: Pid) -> Result<Registers, Errno> {
        Registers::read(pid)
    }

    fn read_word(&self, pid: Pid, addr: u64) -> Result<i64, Errno> {
        ptrace::read(pid, addr as ptrace::AddressType)
    }

    fn signal(&self, pid: Pid, signal: Signal) {
        let _ = kill(pid, signal);
    }

    fn is_alive(&self, pid: Pid) -> bool {
        !matches!(kill(pid, None), Err(Errno::ESRCH))
    }

    fn thread_name(&self, pid: Pid) -> String {
        Process::new(pid.as_raw())
            .and_then(|process| process.stat())
            .map_or_else(|_| UNKNOWN_NAME.to_string(), |stat| stat.comm)
    }

    fn fd_target(&self, pid: Pid, fd: i32) -> Option<PathBuf> {
        let process = Process::new(pid.as_raw()).ok()?;
        if fd == libc::AT_FDCWD {
            return process.cwd().ok();
        }
        match process.fd_from_fd(fd).ok()?.target {
            FDTarget::Path(path) => Some(path),
            _ => None,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_options_follow_children() {
        let options = trace_options();
        assert!(options.contains(ptrace::Options::PTRACE_O_TRACEFORK));
        assert!(options.contains(ptrace::Options::PTRACE_O_TRACEVFORK));
        assert!(options.contains(ptrace::Options::PTRACE_O_TRACECLONE));
        assert!(options.contains(ptrace::Options::PTRACE_O_TRACEEXIT));
        assert!(options.contains(ptrace::Options::PTRACE_O_TRACEEXEC));
        assert!(options.contains(ptrace::Options::PTRACE_O_TRACESYSGOOD));
    }

    #[test]
    fn test_ptrace_probe_self_is_alive() {
        let ptrace = Ptrace;
        assert!(ptrace.is_alive(nix::unistd::getpid()));
    }

    #[test]
    fn test_ptrace_thread_name_of_self() {
        let ptrace = Ptrace;
        let name = ptrace.thread_name(nix::unistd::getpid());
        assert!(!name.is_empty());
        assert_ne!(name, UNKNOWN_NAME);
    }

    #[test]
    fn test_ptrace_fd_target_cwd() {
        let ptrace = Ptrace;
        let cwd = ptrace.fd_target(nix::unistd::getpid(), libc::AT_FDCWD);
        assert_eq!(cwd, std::env::current_dir().ok());
    }

    #[test]
    fn test_ptrace_fd_target_of_open_file() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(file.as_file());
        let ptrace = Ptrace;
        let target = ptrace.fd_target(nix::unistd::getpid(), fd);
        let expected = std::fs::canonicalize(file.path()).expect("canonicalize");
        assert_eq!(target, Some(expected));
    }

    #[test]
    fn test_fake_reads_words_across_string() {
        let fake = testing::Fake::new();
        let pid = Pid::from_raw(10);
        fake.write_str(pid, 0x100, "abc");
        let word = fake.read_word(pid, 0x100).expect("mapped");
        let bytes = word.to_ne_bytes();
        assert_eq!(&bytes[..4], b"abc\0");
        assert_eq!(fake.read_word(pid, 0x200), Err(Errno::EIO));
    }
}
