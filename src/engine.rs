use core::fmt;

use nix::{
    errno::Errno,
    sys::{ptrace, signal::Signal, wait::WaitStatus},
    unistd::Pid,
};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use crate::{
    control::{Control, Ptrace},
    decoder::Decoder,
    diag::{Error, Result},
    oplog::OperationLog,
    path::Scope,
    registry::{Kind, Registry, ThreadInfo},
    trace::Tracer,
};

/// Attempts at fetching registers before an id is given up.
pub const MAX_REGISTER_ATTEMPTS: u32 = 5;
/// Attempts at resuming an id before it is given up.
pub const MAX_RESUME_ATTEMPTS: u32 = 3;

const BACKOFF_BASE: Duration = Duration::from_millis(1);
const BACKOFF_CAP: Duration = Duration::from_millis(64);
const DRAIN_INTERVAL: Duration = Duration::from_millis(10);

/// Phases of the event loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Attaching,
    Running,
    ForkEvent,
    CloneEvent,
    Draining,
    Done,
}

/// Why a single id had to be given up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// The id no longer exists.
    Gone,
    /// A transient error persisted through every retry.
    Exhausted(Errno),
    /// A non-transient error.
    Failed(Errno),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gone => write!(f, "tracee vanished"),
            Self::Exhausted(errno) => write!(f, "retries exhausted: {errno}"),
            Self::Failed(errno) => write!(f, "{errno}"),
        }
    }
}

/// Everything a run produced.
#[derive(Debug)]
pub struct Session {
    registry: Registry,
    log: OperationLog,
    root: Pid,
    root_status: Option<i32>,
    fatal: Option<String>,
}

impl Session {
    fn new(root: Pid) -> Self {
        Self {
            registry: Registry::new(),
            log: OperationLog::new(),
            root,
            root_status: None,
            fatal: None,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    #[must_use]
    pub fn root(&self) -> Pid {
        self.root
    }

    #[must_use]
    /// Exit code of the root: its own code, or `128 + signo` when it was
    /// killed. `None` if its exit was never observed.
    pub fn root_status(&self) -> Option<i32> {
        self.root_status
    }

    #[must_use]
    /// The error that ended the run early, if any.
    pub fn fatal(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    #[must_use]
    /// Exit code to report for the whole run.
    pub fn exit_code(&self) -> i32 {
        match (self.fatal.as_ref(), self.root_status) {
            (None, Some(status)) => status,
            _ => 1,
        }
    }
}

#[cfg(test)]
impl Session {
    pub(crate) fn from_parts(
        registry: Registry,
        log: OperationLog,
        root: Pid,
        root_status: Option<i32>,
    ) -> Self {
        Self {
            registry,
            log,
            root,
            root_status,
            fatal: None,
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    BACKOFF_BASE
        .saturating_mul(1 << attempt.min(6))
        .min(BACKOFF_CAP)
}

/// Run `op` until it succeeds, retrying `transient` errors with exponential
/// backoff. `pid` is probed for liveness between attempts.
fn retry<T>(
    ctl: &impl Control,
    pid: Pid,
    attempts: u32,
    transient: &[Errno],
    mut op: impl FnMut() -> std::result::Result<T, Errno>,
) -> std::result::Result<T, Fault> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(Errno::ESRCH) => return Err(Fault::Gone),
            Err(errno) if transient.contains(&errno) => {
                attempt += 1;
                if attempt >= attempts {
                    return Err(Fault::Exhausted(errno));
                }
                trace!(pid = %pid, attempt, %errno, "transient error, retrying");
                ctl.sleep(backoff(attempt - 1));
                if !ctl.is_alive(pid) {
                    return Err(Fault::Gone);
                }
            }
            Err(errno) => return Err(Fault::Failed(errno)),
        }
    }
}

/// The attach/wait/resume state machine.
///
/// Owns the [`Session`] for the duration of the run. All kernel access goes
/// through `ctl`; the loop is single-threaded and processes stop events in
/// delivery order.
pub struct Engine<'a, C: Control> {
    ctl: &'a C,
    scope: &'a Scope,
    session: Session,
    state: State,
}

impl<'a, C: Control> Engine<'a, C> {
    #[must_use]
    /// # Arguments
    ///
    /// * `ctl` - Kernel access.
    /// * `scope` - Which file operations are logged.
    /// * `root` - The forked child, already requesting to be traced.
    pub fn new(ctl: &'a C, scope: &'a Scope, root: Pid) -> Self {
        Self {
            ctl,
            scope,
            session: Session::new(root),
            state: State::Attaching,
        }
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub fn into_session(self) -> Session {
        self.session
    }

    /// Trace the root and all its descendants until none are left.
    ///
    /// # Errors
    ///
    /// Returns `Err` when the root cannot be armed. Failures after that are
    /// recorded in [`Session::fatal`] and the partial session is returned.
    pub fn run(mut self) -> Result<Session> {
        self.attach()?;
        while self.state != State::Done {
            self.step();
        }
        Ok(self.session)
    }

    /// Register the root, collect its initial stop, set options and let it
    /// run to its first syscall boundary.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the root exited before stopping or cannot be resumed.
    pub fn attach(&mut self) -> Result<()> {
        let root = self.session.root;
        self.session
            .registry
            .register(self.ctl, None, root, Kind::Process);

        match self.ctl.wait_for(root) {
            Ok(WaitStatus::Stopped(..)) => {}
            Ok(WaitStatus::Exited(_, code)) => {
                return Err(self.abort_attach(code, &format!("exited with {code}")));
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                let code = 128 + signal as i32;
                return Err(self.abort_attach(code, &format!("killed by {signal:?}")));
            }
            Ok(status) => {
                return Err(self.abort_attach(-1, &format!("unexpected {status:?}")));
            }
            Err(errno) => {
                return Err(self.abort_attach(-1, &format!("wait failed: {errno}")));
            }
        }

        if let Err(errno) = self.ctl.set_options(root) {
            return Err(self.abort_attach(-1, &format!("cannot set options: {errno}")));
        }
        self.arm(root);
        if !self.session.registry.is_active(root) {
            return Err(self.abort_attach(-1, "cannot resume"));
        }

        info!(pid = %root, "attached");
        self.transition(State::Running);
        Ok(())
    }

    /// Wait for one stop event and handle it.
    pub fn step(&mut self) {
        match self.ctl.wait_any() {
            Ok(status) => {
                if self.state == State::Draining {
                    self.transition(State::Running);
                }
                self.dispatch(status);
            }
            Err(Errno::ECHILD) => self.drain(),
            Err(Errno::EINTR) => {}
            Err(errno) => self.abort(format!("wait failed: {errno}")),
        }
    }

    fn dispatch(&mut self, status: WaitStatus) {
        trace!(?status, "stop");
        match status {
            WaitStatus::Exited(pid, code) => self.exited(pid, code, code),
            WaitStatus::Signaled(pid, signal, _) => {
                self.exited(pid, -1, 128 + signal as i32);
            }
            WaitStatus::PtraceEvent(pid, _, event) => self.event(pid, event),
            WaitStatus::PtraceSyscall(pid) => self.syscall(pid),
            WaitStatus::Stopped(pid, signal) => self.stopped(pid, signal),
            WaitStatus::Continued(_) | WaitStatus::StillAlive => {}
        }
    }

    fn exited(&mut self, pid: Pid, status: i32, code: i32) {
        let ctl = self.ctl;
        let registry = &mut self.session.registry;
        registry.terminate(ctl, pid, status);

        if pid == self.session.root {
            info!(pid = %pid, code, "root exited");
            self.session.root_status = Some(code);
            registry.terminate_all(ctl, None);
        } else {
            debug!(pid = %pid, code, "exited");
        }
    }

    fn event(&mut self, pid: Pid, event: i32) {
        let fork = event == ptrace::Event::PTRACE_EVENT_FORK as i32
            || event == ptrace::Event::PTRACE_EVENT_VFORK as i32;
        let clone = event == ptrace::Event::PTRACE_EVENT_CLONE as i32;

        if fork || clone {
            self.spawned(pid, fork);
        } else {
            if event == ptrace::Event::PTRACE_EVENT_EXEC as i32 {
                self.session.registry.refresh_name(self.ctl, pid);
            }
            trace!(pid = %pid, event, "event");
            self.resume(pid, None);
        }
    }

    fn spawned(&mut self, parent: Pid, fork: bool) {
        self.transition(if fork {
            State::ForkEvent
        } else {
            State::CloneEvent
        });

        match self.ctl.event_message(parent) {
            #[allow(clippy::cast_possible_truncation)]
            Ok(message) => {
                let child = Pid::from_raw(message as i32);
                let kind = Kind::from(fork || !self.creates_thread(parent));
                debug!(pid = %parent, child = %child, ?kind, "spawned");

                let ctl = self.ctl;
                self.session
                    .registry
                    .register(ctl, Some(parent), child, kind);
                let armed = self
                    .session
                    .registry
                    .lookup(child)
                    .is_some_and(ThreadInfo::is_armed);
                if !armed {
                    self.adopt(child);
                }
            }
            Err(errno) => warn!(pid = %parent, %errno, "cannot read new id"),
        }

        self.resume(parent, None);
        self.transition(State::Running);
    }

    /// Whether the clone `pid` is stopped in shares its thread group.
    #[allow(clippy::cast_sign_loss)]
    fn creates_thread(&self, pid: Pid) -> bool {
        let ctl = self.ctl;
        let regs = match retry(ctl, pid, MAX_REGISTER_ATTEMPTS, &[Errno::EINVAL], || {
            ctl.registers(pid)
        }) {
            Ok(regs) => regs,
            Err(fault) => {
                warn!(pid = %pid, %fault, "cannot read clone flags");
                return true;
            }
        };

        let flags = match regs.syscall() {
            libc::SYS_clone3 => match ctl.read_word(pid, regs.arg(0)) {
                Ok(word) => word as u64,
                Err(errno) => {
                    warn!(pid = %pid, %errno, "cannot read clone3 arguments");
                    return true;
                }
            },
            _ => regs.arg(0),
        };
        (flags & libc::CLONE_THREAD as u64) != 0
    }

    /// Collect the initial stop of a freshly created id and let it run.
    fn adopt(&mut self, child: Pid) {
        match self.ctl.wait_for(child) {
            Ok(WaitStatus::Exited(_, code)) => {
                self.exited(child, code, code);
                return;
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                self.exited(child, -1, 128 + signal as i32);
                return;
            }
            Ok(status) => trace!(pid = %child, ?status, "initial stop"),
            Err(errno) if self.ctl.is_alive(child) => {
                debug!(pid = %child, %errno, "initial stop not collected");
            }
            Err(_) => {
                self.session.registry.terminate(self.ctl, child, -1);
                return;
            }
        }

        if let Err(errno) = self.ctl.set_options(child) {
            debug!(pid = %child, %errno, "cannot set options");
        }
        self.arm(child);
    }

    /// Mark `pid` armed and resume it.
    fn arm(&mut self, pid: Pid) {
        if let Some(entry) = self.session.registry.lookup_mut(pid) {
            entry.set_armed();
        }
        self.resume(pid, None);
    }

    fn stopped(&mut self, pid: Pid, signal: Signal) {
        let armed = self
            .session
            .registry
            .lookup(pid)
            .is_some_and(|entry| entry.is_active() && entry.is_armed());

        if signal == Signal::SIGSTOP && !armed {
            if !self.session.registry.is_active(pid) {
                let ctl = self.ctl;
                let root = self.session.root;
                self.session
                    .registry
                    .register(ctl, Some(root), pid, Kind::Thread);
            }
            debug!(pid = %pid, "stopped before its creation event");
            if let Err(errno) = self.ctl.set_options(pid) {
                debug!(pid = %pid, %errno, "cannot set options");
            }
            self.arm(pid);
            return;
        }

        let inject = match signal {
            Signal::SIGTRAP | Signal::SIGSTOP => None,
            other => Some(other),
        };
        trace!(pid = %pid, ?signal, "signal delivery");
        self.resume(pid, inject);
    }

    fn syscall(&mut self, pid: Pid) {
        let ctl = self.ctl;
        let root = self.session.root;
        let registry = &mut self.session.registry;

        match registry.lookup(pid) {
            None => {
                registry.register(ctl, Some(root), pid, Kind::Thread);
                if let Some(entry) = registry.lookup_mut(pid) {
                    entry.set_armed();
                }
            }
            Some(entry) if !entry.is_active() => {
                trace!(pid = %pid, "syscall stop of terminated id");
                ctl.detach(pid);
                return;
            }
            Some(_) => {}
        }

        if !ctl.is_alive(pid) {
            registry.terminate(ctl, pid, -1);
            return;
        }

        let regs = match retry(ctl, pid, MAX_REGISTER_ATTEMPTS, &[Errno::EINVAL], || {
            ctl.registers(pid)
        }) {
            Ok(regs) => regs,
            Err(fault) => {
                warn!(pid = %pid, %fault, "cannot read registers");
                registry.terminate(ctl, pid, -1);
                return;
            }
        };

        let entering = registry
            .lookup_mut(pid)
            .is_some_and(ThreadInfo::flip_phase);
        if entering {
            trace!(pid = %pid, %regs, "syscall entry");
            Decoder::new(self.scope, root).decode(
                ctl,
                registry,
                &mut self.session.log,
                pid,
                &regs,
            );
            if !registry.is_active(pid) {
                return;
            }
        }

        self.resume(pid, None);
    }

    fn resume(&mut self, pid: Pid, signal: Option<Signal>) {
        let ctl = self.ctl;
        if let Err(fault) = retry(
            ctl,
            pid,
            MAX_RESUME_ATTEMPTS,
            &[Errno::EINVAL, Errno::EIO],
            || ctl.resume(pid, signal),
        ) {
            if self.session.registry.is_active(pid) {
                warn!(pid = %pid, %fault, "cannot resume");
            }
            self.session.registry.terminate(ctl, pid, -1);
        }
    }

    fn drain(&mut self) {
        self.transition(State::Draining);

        let ctl = self.ctl;
        let registry = &mut self.session.registry;
        let mut alive = 0;
        for pid in registry.active_ids() {
            if ctl.is_alive(pid) {
                alive += 1;
            } else {
                registry.terminate(ctl, pid, -1);
            }
        }

        if alive > 0 {
            trace!(alive, "waiting for remaining tracees");
            ctl.sleep(DRAIN_INTERVAL);
        } else {
            self.transition(State::Done);
        }
    }

    fn abort(&mut self, message: String) {
        error!(%message, "tracing aborted");
        self.session.registry.terminate_all(self.ctl, None);
        self.session.fatal = Some(message);
        self.transition(State::Done);
    }

    fn abort_attach(&mut self, code: i32, reason: &str) -> Error {
        let root = self.session.root;
        self.session.root_status = Some(code);
        self.session.registry.terminate(self.ctl, root, -1);
        self.transition(State::Done);
        Error::from(format!("cannot trace {root}: {reason}"))
    }

    fn transition(&mut self, state: State) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "state");
            self.state = state;
        }
    }
}

/// [`Tracer`] that records file accesses of the traced command tree.
pub struct FileTracer {
    scope: Scope,
    session: Option<Session>,
}

impl FileTracer {
    #[must_use]
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            session: None,
        }
    }

    #[must_use]
    /// The session of the last completed run.
    pub fn into_session(self) -> Option<Session> {
        self.session
    }
}

impl Tracer for FileTracer {
    fn trace(&mut self, pid: Pid) -> Result<i32> {
        let ctl = Ptrace;
        let session = Engine::new(&ctl, &self.scope, pid).run()?;
        if let Some(fatal) = session.fatal() {
            warn!(fatal, "partial trace");
        }
        let code = session.exit_code();
        self.session = Some(session);
        Ok(code)
    }
}
