use nix::{
    sys::{
        ptrace,
        signal::{raise, Signal},
    },
    unistd::{execve, fork, ForkResult, Pid},
};
use std::{ffi::CString, process};

use crate::diag::Result;

/// Exit code of the child when it cannot request tracing.
pub const EXIT_TRACEME_FAILED: i32 = 126;
/// Exit code of the child when the command cannot be executed.
pub const EXIT_EXEC_FAILED: i32 = 127;

/// A trait for implementing ptrace-based process tracers.
///
/// Types implementing `Tracer` drive the inspection of a child that has
/// already requested to be traced and stopped itself before `execve`. The
/// primary extension point is the `trace` method, invoked with the PID of
/// that child.
pub trait Tracer {
    /// Trace the process identified by `pid` and everything it spawns.
    ///
    /// # Arguments
    ///
    /// * `pid` - PID of the traced child process.
    ///
    /// # Errors
    ///
    /// Returns `Err` when tracing cannot start or fails for the whole
    /// session.
    ///
    /// # Returns
    ///
    /// Returns `Ok(exit_code)` where `exit_code` is the traced process's
    /// numeric exit status (or a signal-derived value).
    fn trace(&mut self, pid: Pid) -> Result<i32>;
}

fn tracee(args: &[CString], env: &[CString]) -> ! {
    if let Err(errno) = ptrace::traceme() {
        eprintln!("cannot request tracing: {errno}");
        process::exit(EXIT_TRACEME_FAILED);
    }
    // Parked until the tracer has set its options.
    if let Err(errno) = raise(Signal::SIGSTOP) {
        eprintln!("cannot stop: {errno}");
        process::exit(EXIT_TRACEME_FAILED);
    }

    let errno = match execve(&args[0], args, env) {
        Err(errno) => errno,
        Ok(infallible) => match infallible {},
    };
    eprintln!("{}: {errno}", args[0].to_string_lossy());
    process::exit(EXIT_EXEC_FAILED)
}

/// Fork and execute the target program, running `tracer` against the
/// resulting child process.
///
/// The child requests tracing, stops itself, then execs `args[0]`. The
/// parent hands the child's PID to `tracer`.
///
/// # Arguments
///
/// * `tracer` - The tracer implementation to drive the child with.
/// * `args` - Command-line arguments of the program (the first element is
///   the program path). Must not be empty.
/// * `env` - Environment variables for the child process.
///
/// # Errors
///
/// Returns `Err` if `args` is empty, if the fork fails or if the tracer
/// returns an error.
///
/// # Returns
///
/// Returns `Ok(status)` where `status` is the exit code produced by the
/// tracer.
pub fn run<T: Tracer>(tracer: &mut T, args: &[CString], env: &[CString]) -> Result<i32> {
    if args.is_empty() {
        return Err("empty command".into());
    }

    match unsafe { fork() }? {
        ForkResult::Parent { child: pid, .. } => tracer.trace(pid),
        ForkResult::Child => tracee(args, env),
    }
}
