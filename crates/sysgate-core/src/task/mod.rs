//! Per-task policy state and the thread-group model.
//!
//! A [`Task`] is one kernel-equivalent thread. Its policy state is a
//! monotonic mode plus a reference to the leaf of its filter chain; a
//! [`ThreadGroup`] ties sibling threads together and owns the two locks
//! the install protocol needs (the group-wide signal lock and the
//! exec/credential guard) along with the listener descriptor table.
//!
//! # Invariants
//!
//! - The mode moves `Disabled -> Strict` or `Disabled -> Filter` exactly
//!   once, through a compare-and-swap transition function; there is no
//!   setter. Re-assigning the current mode is legal (filter layering).
//! - The leaf reference is published with release ordering and read with
//!   acquire ordering, so evaluation sees a concurrent install fully or
//!   not at all.
//! - `no_new_privs` is one-way: it can be set, never cleared.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};

use crate::chain::NodeId;
use crate::listener::{Listener, ListenerFd, ListenerTable};
use crate::notify::InterruptFlag;

/// Thread (or thread-group) identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Pid(pub u32);

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A task's secure-computing mode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Mode {
    /// No policy applies.
    Disabled = 0,
    /// Fixed allowlist of four syscalls.
    Strict = 1,
    /// Chain of installed filter programs.
    Filter = 2,
}

impl Mode {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Strict,
            2 => Self::Filter,
            _ => Self::Disabled,
        }
    }
}

/// Static credentials a task is created with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Holds the administrative capability for its user namespace.
    pub admin: bool,
}

impl Credentials {
    /// Credentials with no capabilities.
    #[must_use]
    pub const fn unprivileged() -> Self {
        Self { admin: false }
    }

    /// Credentials holding the administrative capability.
    #[must_use]
    pub const fn admin() -> Self {
        Self { admin: true }
    }
}

/// One thread and its policy state.
pub struct Task {
    tid: Pid,
    group: Arc<ThreadGroup>,
    mode: AtomicU8,
    /// Leaf handle, biased by one so zero means "no filter".
    leaf: AtomicUsize,
    no_new_privs: AtomicBool,
    admin: bool,
    spec_mitigated: AtomicBool,
    interrupt: InterruptFlag,
}

impl Task {
    pub(crate) fn new(tid: Pid, group: Arc<ThreadGroup>, creds: Credentials) -> Self {
        Self {
            tid,
            group,
            mode: AtomicU8::new(Mode::Disabled as u8),
            leaf: AtomicUsize::new(0),
            no_new_privs: AtomicBool::new(false),
            admin: creds.admin,
            spec_mitigated: AtomicBool::new(false),
            interrupt: InterruptFlag::new(),
        }
    }

    /// This task's thread id.
    #[must_use]
    pub fn tid(&self) -> Pid {
        self.tid
    }

    /// The thread group this task belongs to.
    #[must_use]
    pub fn group(&self) -> &Arc<ThreadGroup> {
        &self.group
    }

    /// Current secure-computing mode.
    #[must_use]
    pub fn mode(&self) -> Mode {
        Mode::from_raw(self.mode.load(Ordering::Acquire))
    }

    /// Whether a transition to `new` would be legal right now.
    pub(crate) fn mode_assignable(&self, new: Mode) -> bool {
        let current = self.mode();
        current == Mode::Disabled || current == new
    }

    /// Monotonic mode transition. The only way the mode ever changes.
    ///
    /// # Errors
    ///
    /// The conflicting current mode, when the task already committed to a
    /// different one.
    pub(crate) fn try_assign_mode(&self, new: Mode) -> Result<(), Mode> {
        loop {
            let current = self.mode.load(Ordering::Acquire);
            if current != Mode::Disabled as u8 && current != new as u8 {
                return Err(Mode::from_raw(current));
            }
            if self
                .mode
                .compare_exchange(current, new as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Acquire-ordered read of the current leaf reference.
    pub(crate) fn leaf(&self) -> Option<NodeId> {
        match self.leaf.load(Ordering::Acquire) {
            0 => None,
            biased => Some(NodeId((biased - 1) as u32)),
        }
    }

    /// Release-ordered publish of a new leaf reference. Callers hold the
    /// group signal lock; the reference accounting is theirs to manage.
    pub(crate) fn set_leaf(&self, leaf: Option<NodeId>) {
        let biased = leaf.map_or(0, |id| id.0 as usize + 1);
        self.leaf.store(biased, Ordering::Release);
    }

    /// Whether the irrevocable no-new-privileges attribute is set.
    #[must_use]
    pub fn no_new_privs(&self) -> bool {
        self.no_new_privs.load(Ordering::Acquire)
    }

    /// Sets the no-new-privileges attribute. One-way.
    pub fn set_no_new_privs(&self) {
        self.no_new_privs.store(true, Ordering::Release);
    }

    /// Whether the task holds the administrative capability.
    #[must_use]
    pub fn has_admin_capability(&self) -> bool {
        self.admin
    }

    /// Whether speculative-execution mitigation was applied on install.
    #[must_use]
    pub fn spec_mitigated(&self) -> bool {
        self.spec_mitigated.load(Ordering::Acquire)
    }

    pub(crate) fn set_spec_mitigated(&self) {
        self.spec_mitigated.store(true, Ordering::Release);
    }

    /// The interruption flag that wakes this task's blocked waits.
    #[must_use]
    pub fn interrupt(&self) -> &InterruptFlag {
        &self.interrupt
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("tid", &self.tid)
            .field("mode", &self.mode())
            .field("leaf", &self.leaf())
            .field("no_new_privs", &self.no_new_privs())
            .finish_non_exhaustive()
    }
}

/// A group of sibling threads sharing policy-installation state.
pub struct ThreadGroup {
    tgid: Pid,
    /// Serializes every mode/leaf mutation inside the group.
    pub(crate) siglock: Mutex<()>,
    /// Held across thread-sync so no sibling races an exec-time
    /// credential change.
    pub(crate) cred_guard: Mutex<()>,
    threads: Mutex<Vec<Weak<Task>>>,
    pub(crate) listeners: Mutex<ListenerTable>,
}

impl ThreadGroup {
    pub(crate) fn new(tgid: Pid, listener_limit: usize) -> Self {
        Self {
            tgid,
            siglock: Mutex::new(()),
            cred_guard: Mutex::new(()),
            threads: Mutex::new(Vec::new()),
            listeners: Mutex::new(ListenerTable::new(listener_limit)),
        }
    }

    /// The group id.
    #[must_use]
    pub fn tgid(&self) -> Pid {
        self.tgid
    }

    fn lock_threads(&self) -> MutexGuard<'_, Vec<Weak<Task>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_listeners(&self) -> MutexGuard<'_, ListenerTable> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add_thread(&self, task: &Arc<Task>) {
        self.lock_threads().push(Arc::downgrade(task));
    }

    pub(crate) fn forget_thread(&self, tid: Pid) {
        self.lock_threads()
            .retain(|weak| weak.upgrade().is_some_and(|t| t.tid() != tid));
    }

    /// Live threads in the group, in registration order.
    #[must_use]
    pub fn threads(&self) -> Vec<Arc<Task>> {
        self.lock_threads()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Number of live threads.
    #[must_use]
    pub fn live_threads(&self) -> usize {
        self.lock_threads()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Looks up an open listener descriptor.
    #[must_use]
    pub fn listener(&self, fd: ListenerFd) -> Option<Arc<Listener>> {
        self.lock_listeners().get(fd)
    }

    /// Closes a listener descriptor, tearing its channel down. Returns
    /// whether the descriptor was open.
    pub fn close_listener(&self, fd: ListenerFd) -> bool {
        // Release the table lock before teardown wakes blocked callers.
        let listener = self.lock_listeners().take(fd);
        match listener {
            Some(listener) => {
                listener.close();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for ThreadGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadGroup")
            .field("tgid", &self.tgid)
            .field("live_threads", &self.live_threads())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        let group = Arc::new(ThreadGroup::new(Pid(100), 8));
        Task::new(Pid(100), group, Credentials::unprivileged())
    }

    #[test]
    fn mode_starts_disabled() {
        assert_eq!(task().mode(), Mode::Disabled);
    }

    #[test]
    fn mode_transition_is_monotonic() {
        let t = task();
        assert!(t.try_assign_mode(Mode::Filter).is_ok());
        assert_eq!(t.mode(), Mode::Filter);

        // Layering: same mode again is fine.
        assert!(t.try_assign_mode(Mode::Filter).is_ok());

        // Conflicting mode is rejected and reports the committed one.
        assert_eq!(t.try_assign_mode(Mode::Strict), Err(Mode::Filter));
        assert_eq!(t.mode(), Mode::Filter);
    }

    #[test]
    fn strict_blocks_later_filter() {
        let t = task();
        assert!(t.try_assign_mode(Mode::Strict).is_ok());
        assert_eq!(t.try_assign_mode(Mode::Filter), Err(Mode::Strict));
    }

    #[test]
    fn no_new_privs_is_one_way() {
        let t = task();
        assert!(!t.no_new_privs());
        t.set_no_new_privs();
        assert!(t.no_new_privs());
    }

    #[test]
    fn leaf_reference_round_trips_through_bias() {
        let t = task();
        assert_eq!(t.leaf(), None);
        t.set_leaf(Some(NodeId(0)));
        assert_eq!(t.leaf(), Some(NodeId(0)));
        t.set_leaf(Some(NodeId(41)));
        assert_eq!(t.leaf(), Some(NodeId(41)));
        t.set_leaf(None);
        assert_eq!(t.leaf(), None);
    }

    #[test]
    fn group_tracks_live_threads() {
        let group = Arc::new(ThreadGroup::new(Pid(7), 8));
        let t1 = Arc::new(Task::new(Pid(7), Arc::clone(&group), Credentials::default()));
        let t2 = Arc::new(Task::new(Pid(8), Arc::clone(&group), Credentials::default()));
        group.add_thread(&t1);
        group.add_thread(&t2);
        assert_eq!(group.live_threads(), 2);

        drop(t2);
        assert_eq!(group.live_threads(), 1);
        assert_eq!(group.threads().len(), 1);
    }
}
