use nix::{sys::signal::Signal, unistd::Pid};
use serde_derive::Serialize;
use std::{collections::HashMap, time::SystemTime};
use tracing::debug;

use crate::control::Control;

/// Whether an id was created as a separate process or as a thread sharing its
/// creator's thread group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Kind {
    Process,
    Thread,
}

impl From<bool> for Kind {
    fn from(is_process: bool) -> Self {
        if is_process {
            Self::Process
        } else {
            Self::Thread
        }
    }
}

/// Registry entry for one logical process or thread.
#[derive(Clone, Debug)]
pub struct ThreadInfo {
    id: Pid,
    parent: Option<Pid>,
    name: String,
    active: bool,
    kind: Kind,
    child_processes: Vec<Pid>,
    child_threads: Vec<Pid>,
    created_at: SystemTime,
    exit_status: Option<i32>,
    in_syscall: bool,
    armed: bool,
}

impl ThreadInfo {
    fn new(id: Pid, parent: Option<Pid>, name: String, kind: Kind) -> Self {
        Self {
            id,
            parent,
            name,
            active: true,
            kind,
            child_processes: Vec::new(),
            child_threads: Vec::new(),
            created_at: SystemTime::now(),
            exit_status: None,
            in_syscall: false,
            armed: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> Pid {
        self.id
    }

    #[must_use]
    /// `None` for roots.
    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    #[must_use]
    pub fn child_processes(&self) -> &[Pid] {
        &self.child_processes
    }

    #[must_use]
    pub fn child_threads(&self) -> &[Pid] {
        &self.child_threads
    }

    #[must_use]
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    #[must_use]
    /// `None` while the entry is active.
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    #[must_use]
    /// True between a syscall-entry stop and the matching exit stop.
    pub fn in_syscall(&self) -> bool {
        self.in_syscall
    }

    /// Flip the entry/exit phase and return the phase the stop belonged to:
    /// `true` for an entry stop.
    pub fn flip_phase(&mut self) -> bool {
        let entering = !self.in_syscall;
        self.in_syscall = entering;
        entering
    }

    #[must_use]
    /// Whether trace options were set and the first resume issued.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn set_armed(&mut self) {
        self.armed = true;
    }

    fn children_mut(&mut self, kind: Kind) -> &mut Vec<Pid> {
        match kind {
            Kind::Process => &mut self.child_processes,
            Kind::Thread => &mut self.child_threads,
        }
    }
}

/// Every process and thread observed during a run.
///
/// Entries are never removed: termination only flips them inactive so the
/// whole tree stays inspectable after the run. A numeric id that shows up
/// again after its entry terminated is tracked as a new logical entity; the
/// old entry stays in the history returned by [`Registry::iter`].
///
/// The registry has a single writer, the event loop, for the duration of a
/// run.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<ThreadInfo>,
    current: HashMap<Pid, usize>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `parent` created `id`.
    ///
    /// Re-registering an active id under the same parent and kind is a no-op.
    /// An active id registered under a different parent or kind (it was seen
    /// before its creation event) is moved under `parent`. An unknown
    /// `parent` gets a synthesized root entry.
    ///
    /// # Arguments
    ///
    /// * `ctl` - Used to read the command name of new entries.
    /// * `parent` - The creator, `None` for a root.
    /// * `id` - The new process or thread.
    /// * `kind` - Process or thread.
    pub fn register(
        &mut self,
        ctl: &impl Control,
        parent: Option<Pid>,
        id: Pid,
        kind: Kind,
    ) {
        if let Some(&idx) = self.current.get(&id) {
            let entry = &self.entries[idx];
            let stale_parent = entry.parent;
            if entry.active {
                if stale_parent == parent && entry.kind == kind {
                    return;
                }
                self.unlink(stale_parent, id);
                let entry = &mut self.entries[idx];
                entry.parent = parent;
                entry.kind = kind;
                self.link(ctl, parent, id, kind);
                debug!(pid = %id, parent = ?parent, ?kind, "relinked");
                return;
            }
            self.unlink(stale_parent, id);
            debug!(pid = %id, "id reused after termination");
        }

        let info = ThreadInfo::new(id, parent, ctl.thread_name(id), kind);
        self.insert(info);
        self.link(ctl, parent, id, kind);
        debug!(pid = %id, parent = ?parent, ?kind, "registered");
    }

    /// Re-read the command name of `id`, which changes on `execve`.
    pub fn refresh_name(&mut self, ctl: &impl Control, id: Pid) {
        if let Some(entry) = self.lookup_mut(id) {
            entry.name = ctl.thread_name(id);
        }
    }

    /// Mark `id` and every active descendant inactive.
    ///
    /// `id` records `status`; descendants record `-1`. Child processes are
    /// sent `SIGTERM` first, child threads are only marked. Every terminated
    /// id is detached. Unknown or already inactive ids are ignored.
    ///
    /// The tree is walked with an explicit worklist so its depth is not
    /// bounded by the call stack.
    pub fn terminate(&mut self, ctl: &impl Control, id: Pid, status: i32) {
        let mut worklist = vec![(id, status)];
        while let Some((pid, status)) = worklist.pop() {
            let Some(entry) = self.lookup_mut(pid) else {
                continue;
            };
            if !entry.active {
                continue;
            }
            entry.active = false;
            entry.exit_status = Some(status);
            let processes = entry.child_processes.clone();
            let threads = entry.child_threads.clone();
            debug!(pid = %pid, status, "terminated");

            for child in processes {
                if self.is_child_of(child, pid) {
                    ctl.signal(child, Signal::SIGTERM);
                    worklist.push((child, -1));
                }
            }
            for child in threads {
                if self.is_child_of(child, pid) {
                    worklist.push((child, -1));
                }
            }

            ctl.detach(pid);
        }
    }

    /// Terminate every still-active id except `except`.
    pub fn terminate_all(&mut self, ctl: &impl Control, except: Option<Pid>) {
        for pid in self.active_ids() {
            if Some(pid) != except {
                self.terminate(ctl, pid, -1);
            }
        }
    }

    #[must_use]
    /// The current entry for `id`.
    pub fn lookup(&self, id: Pid) -> Option<&ThreadInfo> {
        self.current.get(&id).map(|&idx| &self.entries[idx])
    }

    pub fn lookup_mut(&mut self, id: Pid) -> Option<&mut ThreadInfo> {
        self.current.get(&id).map(|&idx| &mut self.entries[idx])
    }

    #[must_use]
    pub fn is_active(&self, id: Pid) -> bool {
        self.lookup(id).is_some_and(ThreadInfo::is_active)
    }

    #[must_use]
    /// Active ids, in registration order.
    pub fn active_ids(&self) -> Vec<Pid> {
        self.current_entries()
            .filter(|entry| entry.active)
            .map(ThreadInfo::id)
            .collect()
    }

    /// Every entry ever registered, including superseded ones, in
    /// registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ThreadInfo> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn current_entries(&self) -> impl Iterator<Item = &ThreadInfo> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(idx, entry)| self.current.get(&entry.id) == Some(idx))
            .map(|(_, entry)| entry)
    }

    fn is_child_of(&self, child: Pid, parent: Pid) -> bool {
        self.lookup(child)
            .is_some_and(|entry| entry.active && entry.parent == Some(parent))
    }

    fn insert(&mut self, info: ThreadInfo) {
        self.current.insert(info.id, self.entries.len());
        self.entries.push(info);
    }

    fn link(&mut self, ctl: &impl Control, parent: Option<Pid>, id: Pid, kind: Kind) {
        let Some(parent) = parent else {
            return;
        };
        if let Some(entry) = self.lookup_mut(parent) {
            let children = entry.children_mut(kind);
            if !children.contains(&id) {
                children.push(id);
            }
            return;
        }

        let mut info =
            ThreadInfo::new(parent, None, ctl.thread_name(parent), Kind::Process);
        info.children_mut(kind).push(id);
        self.insert(info);
        debug!(pid = %parent, "synthesized parent");
    }

    fn unlink(&mut self, parent: Option<Pid>, id: Pid) {
        if let Some(entry) = parent.and_then(|parent| self.lookup_mut(parent)) {
            entry.child_processes.retain(|&child| child != id);
            entry.child_threads.retain(|&child| child != id);
        }
    }
}
