use core::fmt;

use libc::user_regs_struct;
use nix::{errno::Errno, sys::ptrace, unistd::Pid};

/// Typed view over the registers of a tracee stopped at a syscall boundary.
///
/// Only the values the decoder cares about are kept: the syscall number, the
/// six argument registers in calling-convention order and the return value.
/// The conversion from the platform `user_regs_struct` is the only place tied
/// to a register layout; this module currently assumes `x86_64`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registers {
    syscall: u64,
    args: [u64; 6],
    ret: u64,
}

impl Registers {
    #[must_use]
    /// Build a snapshot from raw values, mostly useful for tests and fakes.
    ///
    /// # Arguments
    ///
    /// * `syscall` - The syscall number (`orig_rax` on `x86_64`).
    /// * `args` - The six syscall arguments, first argument first.
    #[allow(clippy::cast_sign_loss)]
    pub fn new(syscall: i64, args: [u64; 6]) -> Self {
        Self {
            syscall: syscall as u64,
            args,
            ret: 0,
        }
    }

    /// Read the current register state of `pid`.
    ///
    /// # Errors
    ///
    /// Returns the `errno` reported by `PTRACE_GETREGS`, unchanged, so the
    /// caller can tell transient states from a vanished tracee.
    pub fn read(pid: Pid) -> Result<Self, Errno> {
        ptrace::getregs(pid).map(Self::from)
    }

    #[must_use]
    /// The syscall number, as the signed value the `libc::SYS_*` constants use.
    #[allow(clippy::cast_possible_wrap)]
    pub fn syscall(&self) -> i64 {
        self.syscall as i64
    }

    #[must_use]
    /// The `n`-th syscall argument (0-based). Out-of-range indices read as 0.
    pub fn arg(&self, n: usize) -> u64 {
        self.args.get(n).copied().unwrap_or(0)
    }

    #[must_use]
    /// All six syscall arguments, first argument first.
    pub fn args(&self) -> [u64; 6] {
        self.args
    }

    #[must_use]
    /// Syscall return value; only meaningful at a syscall-exit stop.
    #[allow(clippy::cast_possible_wrap)]
    pub fn ret(&self) -> i64 {
        self.ret as i64
    }
}

impl From<user_regs_struct> for Registers {
    fn from(regs: user_regs_struct) -> Self {
        Self {
            syscall: regs.orig_rax,
            args: [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9],
            ret: regs.rax,
        }
    }
}

impl fmt::Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "syscall {}(", self.syscall())?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg:#x}")?;
        }
        write!(f, ") = {}", self.ret())
    }
}
