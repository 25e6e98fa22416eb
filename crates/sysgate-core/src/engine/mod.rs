//! Evaluation engine and action dispatch.
//!
//! This is the per-syscall path: read the calling task's chain, evaluate
//! every node's program against the record, resolve one action by the
//! restrictiveness order, and turn it into a [`SyscallFate`] the embedder
//! acts on. Signal delivery, tracer hand-off, and actually skipping or
//! running the syscall stay with the embedder; the engine decides, it does
//! not execute.
//!
//! # Fail-closed
//!
//! A task in filter mode with no chain is an invariant violation. The
//! engine resolves it as kill-process rather than allowing the call
//! through; failing open on internal corruption is the one outcome this
//! subsystem must never produce.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::action::{Action, RawVerdict, RET_ALLOW, RET_KILL_PROCESS};
use crate::chain::{FilterArena, NodeId, MAX_INSNS_PER_PATH};
use crate::listener::TEARDOWN_ERRNO;
use crate::notify::{NotifyError, WaitTarget};
use crate::program::ProgramCompiler;
use crate::record::SyscallRecord;
use crate::task::{Credentials, Mode, Pid, Task, ThreadGroup};

/// Largest errno an errno-action verdict may carry; higher data is capped.
pub const MAX_ERRNO: u16 = 4095;

/// Syscall numbers strict mode allows.
const STRICT_MODE_SYSCALLS: [i64; 4] = [
    libc::SYS_read,
    libc::SYS_write,
    libc::SYS_exit,
    libc::SYS_rt_sigreturn,
];

// Default set of actions that produce an audit record. Everything except
// allow; per-node opt-in still gates the skip-style actions.
const LOG_KILL_PROCESS: u32 = 1 << 0;
const LOG_KILL_THREAD: u32 = 1 << 1;
const LOG_TRAP: u32 = 1 << 2;
const LOG_ERRNO: u32 = 1 << 3;
const LOG_TRACE: u32 = 1 << 4;
const LOG_LOG: u32 = 1 << 5;
const LOG_USER_NOTIF: u32 = 1 << 7;

const DEFAULT_ACTIONS_LOGGED: u32 = LOG_KILL_PROCESS
    | LOG_KILL_THREAD
    | LOG_TRAP
    | LOG_ERRNO
    | LOG_USER_NOTIF
    | LOG_TRACE
    | LOG_LOG;

/// Diagnostic record emitted with the terminal outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Signal the embedder should deliver.
    pub signal: i32,
    /// Filter-supplied reason code (the verdict's data bits).
    pub reason: i32,
    /// Syscall number that triggered the outcome.
    pub syscall: i32,
    /// Architecture tag from the record.
    pub arch: u32,
    /// Instruction pointer at the call site.
    pub instruction_pointer: u64,
    /// Whether a core dump should accompany the termination.
    pub dump_core: bool,
}

impl Diagnostic {
    fn new(signal: i32, reason: i32, record: &SyscallRecord, dump_core: bool) -> Self {
        Self {
            signal,
            reason,
            syscall: record.nr,
            arch: record.arch,
            instruction_pointer: record.instruction_pointer,
            dump_core,
        }
    }
}

/// The resolved outcome of one syscall attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyscallFate {
    /// Run the syscall.
    Allow,
    /// Skip the syscall and fail it with this errno.
    Errno(i32),
    /// Skip the syscall and return this emulated result (supervisor
    /// disposition, or the function-not-implemented fallback).
    Emulate {
        /// Error to fail with, zero for success.
        error: i32,
        /// Return value when `error` is zero.
        val: i64,
    },
    /// Deliver a trap signal to the caller and skip the syscall.
    Trap {
        /// The verdict's 16-bit reason code.
        reason: u16,
        /// Signal diagnostic to deliver.
        diagnostic: Diagnostic,
    },
    /// Hand the call to an attached tracer; re-enter with
    /// `recheck_after_trace` if the tracer lets it proceed.
    Trace {
        /// The verdict's 16-bit tracer message.
        message: u16,
    },
    /// The caller's wait was interrupted; re-evaluate or abandon the call.
    Interrupted,
    /// Terminate the calling thread.
    KillThread {
        /// Termination diagnostic.
        diagnostic: Diagnostic,
    },
    /// Terminate the whole thread group.
    KillProcess {
        /// Termination diagnostic.
        diagnostic: Diagnostic,
    },
}

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Instruction-budget ceiling for any leaf-to-root path.
    pub max_insns_per_path: u64,
    /// Listener descriptors available per process.
    pub listeners_per_process: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_insns_per_path: MAX_INSNS_PER_PATH,
            listeners_per_process: 32,
        }
    }
}

/// Shared engine internals: the arena, the compiler, id allocation.
pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    arena: RwLock<FilterArena>,
    pub(crate) compiler: Arc<dyn ProgramCompiler>,
    next_pid: AtomicU32,
}

impl EngineShared {
    pub(crate) fn read_arena(&self) -> RwLockReadGuard<'_, FilterArena> {
        self.arena.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_arena(&self) -> RwLockWriteGuard<'_, FilterArena> {
        self.arena.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn alloc_pid(&self) -> Pid {
        Pid(self.next_pid.fetch_add(1, Ordering::Relaxed))
    }

    /// Takes one more reference to a node.
    pub(crate) fn bump_node(&self, id: NodeId) {
        if let Some(node) = self.read_arena().get(id) {
            node.bump();
        }
    }

    /// Drops one reference, freeing the node and walking `prev` for as
    /// long as counts keep reaching zero. Iterative on purpose: chains
    /// can be deep and this path must not recurse.
    pub(crate) fn release_node(&self, id: NodeId) {
        let mut cursor = Some(id);
        while let Some(id) = cursor {
            let was_last = {
                let arena = self.read_arena();
                match arena.get(id) {
                    Some(node) => node.unref(),
                    None => {
                        tracing::error!(node = id.0, "release of unknown filter node");
                        return;
                    }
                }
            };
            if !was_last {
                return;
            }
            std::sync::atomic::fence(Ordering::Acquire);
            cursor = self
                .write_arena()
                .remove(id)
                .and_then(|node| node.prev);
        }
    }
}

/// The syscall-filtering policy engine.
///
/// One engine instance owns the filter arena shared by every process it
/// manages. Tasks are created through the engine so chain inheritance and
/// reference accounting stay inside it.
pub struct PolicyEngine {
    pub(crate) shared: Arc<EngineShared>,
}

impl PolicyEngine {
    /// Engine with default tunables.
    #[must_use]
    pub fn new(compiler: Arc<dyn ProgramCompiler>) -> Self {
        Self::with_config(EngineConfig::default(), compiler)
    }

    /// Engine with explicit tunables.
    #[must_use]
    pub fn with_config(config: EngineConfig, compiler: Arc<dyn ProgramCompiler>) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                config,
                arena: RwLock::new(FilterArena::new()),
                compiler,
                next_pid: AtomicU32::new(1),
            }),
        }
    }

    /// Creates a new single-threaded process with no policy.
    pub fn spawn_process(&self, creds: Credentials) -> Arc<Task> {
        let pid = self.shared.alloc_pid();
        let group = Arc::new(ThreadGroup::new(
            pid,
            self.shared.config.listeners_per_process,
        ));
        let task = Arc::new(Task::new(pid, Arc::clone(&group), creds));
        group.add_thread(&task);
        task
    }

    /// Creates a sibling thread in the caller's group, inheriting the
    /// caller's policy state.
    pub fn spawn_thread(&self, caller: &Arc<Task>) -> Arc<Task> {
        let tid = self.shared.alloc_pid();
        let group = Arc::clone(caller.group());
        let creds = Credentials { admin: caller.has_admin_capability() };
        let task = Arc::new(Task::new(tid, Arc::clone(&group), creds));
        self.inherit(caller, &task);
        group.add_thread(&task);
        task
    }

    /// Forks a new single-threaded process sharing the caller's chain.
    pub fn fork(&self, caller: &Arc<Task>) -> Arc<Task> {
        let pid = self.shared.alloc_pid();
        let group = Arc::new(ThreadGroup::new(
            pid,
            self.shared.config.listeners_per_process,
        ));
        let creds = Credentials { admin: caller.has_admin_capability() };
        let task = Arc::new(Task::new(pid, Arc::clone(&group), creds));
        self.inherit(caller, &task);
        group.add_thread(&task);
        task
    }

    /// Copies policy state parent to child under the parent group's
    /// signal lock: the child shares the leaf (one more reference), the
    /// mode, and the irrevocable attributes.
    fn inherit(&self, parent: &Arc<Task>, child: &Arc<Task>) {
        let _sig = lock_unit(&parent.group().siglock);
        let leaf = parent.leaf();
        if let Some(id) = leaf {
            self.shared.bump_node(id);
        }
        child.set_leaf(leaf);
        match parent.mode() {
            Mode::Disabled => {}
            mode => {
                // From Disabled this cannot conflict.
                let _ = child.try_assign_mode(mode);
            }
        }
        if parent.no_new_privs() {
            child.set_no_new_privs();
        }
        if parent.spec_mitigated() {
            child.set_spec_mitigated();
        }
    }

    /// Drops a task's policy references at thread exit.
    pub fn release_task(&self, task: &Arc<Task>) {
        let leaf = {
            let _sig = lock_unit(&task.group().siglock);
            let leaf = task.leaf();
            task.set_leaf(None);
            leaf
        };
        if let Some(id) = leaf {
            self.shared.release_node(id);
        }
        task.group().forget_thread(task.tid());
    }

    /// Full secure-computing entry: dispatch on the task's mode.
    pub fn secure_computing(&self, task: &Arc<Task>, record: &SyscallRecord) -> SyscallFate {
        match task.mode() {
            Mode::Disabled => SyscallFate::Allow,
            Mode::Strict => self.strict_computing(record),
            Mode::Filter => self.filter_syscall(task, record, false),
        }
    }

    fn strict_computing(&self, record: &SyscallRecord) -> SyscallFate {
        if STRICT_MODE_SYSCALLS.contains(&i64::from(record.nr)) {
            return SyscallFate::Allow;
        }
        audit(record, libc::SIGKILL, Action::KillThread, true);
        SyscallFate::KillThread {
            diagnostic: Diagnostic::new(libc::SIGKILL, 0, record, false),
        }
    }

    /// Evaluates the chain and dispatches the resolved action.
    ///
    /// `recheck_after_trace` marks the re-entry after a tracer modified
    /// the call; a trace verdict then lets the call proceed instead of
    /// looping back to the tracer.
    pub fn filter_syscall(
        &self,
        task: &Arc<Task>,
        record: &SyscallRecord,
        recheck_after_trace: bool,
    ) -> SyscallFate {
        let Some(leaf) = task.leaf() else {
            // Filter mode with no chain: invariant violation, fail closed.
            tracing::error!(
                tid = task.tid().0,
                syscall = record.nr,
                "task in filter mode has no filter chain"
            );
            audit(record, libc::SIGSYS, Action::KillProcess, true);
            return SyscallFate::KillProcess {
                diagnostic: Diagnostic::new(libc::SIGSYS, 0, record, true),
            };
        };

        let (verdict, matched) = self.run_filters(leaf, record);
        let action = verdict.action();
        let data = verdict.data();
        let requested = matched.is_some_and(|id| {
            self.shared
                .read_arena()
                .get(id)
                .is_some_and(|node| node.log.load(Ordering::Acquire))
        });

        match action {
            Action::Errno => {
                let errno = i32::from(data.min(MAX_ERRNO));
                audit(record, 0, action, requested);
                SyscallFate::Errno(errno)
            }
            Action::Trap => {
                audit(record, 0, action, requested);
                SyscallFate::Trap {
                    reason: data,
                    diagnostic: Diagnostic::new(libc::SIGSYS, i32::from(data), record, false),
                }
            }
            Action::Trace => {
                if recheck_after_trace {
                    return SyscallFate::Allow;
                }
                audit(record, 0, action, requested);
                SyscallFate::Trace { message: data }
            }
            Action::UserNotify => {
                let fate = self.user_notification(task, matched, record);
                audit(record, 0, action, requested);
                fate
            }
            Action::Log => {
                audit(record, 0, action, true);
                SyscallFate::Allow
            }
            Action::Allow => SyscallFate::Allow,
            Action::KillThread => {
                audit(record, libc::SIGSYS, action, true);
                let dump_core = task.group().live_threads() == 1;
                SyscallFate::KillThread {
                    diagnostic: Diagnostic::new(libc::SIGSYS, i32::from(data), record, dump_core),
                }
            }
            Action::KillProcess => {
                audit(record, libc::SIGSYS, action, true);
                SyscallFate::KillProcess {
                    diagnostic: Diagnostic::new(libc::SIGSYS, i32::from(data), record, true),
                }
            }
        }
    }

    /// Leaf-to-root walk keeping the strictly most restrictive verdict;
    /// on ties the node closest to the leaf (newest) wins.
    fn run_filters(&self, leaf: NodeId, record: &SyscallRecord) -> (RawVerdict, Option<NodeId>) {
        let arena = self.shared.read_arena();
        let mut best = RawVerdict(RET_ALLOW);
        let mut matched = None;
        let mut cursor = Some(leaf);
        while let Some(id) = cursor {
            let Some(node) = arena.get(id) else {
                tracing::error!(node = id.0, "filter chain references a freed node");
                return (RawVerdict(RET_KILL_PROCESS), None);
            };
            let verdict = node.program.evaluate(record);
            if verdict.action() < best.action() {
                best = verdict;
                matched = Some(id);
            }
            cursor = node.prev;
        }
        (best, matched)
    }

    /// The defer-to-supervisor path: queue, block, consume the reply.
    fn user_notification(
        &self,
        task: &Arc<Task>,
        matched: Option<NodeId>,
        record: &SyscallRecord,
    ) -> SyscallFate {
        let channel = matched.and_then(|id| {
            self.shared
                .read_arena()
                .get(id)
                .and_then(|node| node.notify.as_ref().map(Arc::clone))
        });
        // A user-notify verdict without a live listener resolves as
        // function-not-implemented rather than blocking forever.
        let Some(channel) = channel else {
            return SyscallFate::Emulate { error: TEARDOWN_ERRNO, val: 0 };
        };
        let id = match channel.deliver(task.tid(), *record) {
            Ok(id) => id,
            Err(_) => return SyscallFate::Emulate { error: TEARDOWN_ERRNO, val: 0 },
        };
        let _wait = task
            .interrupt()
            .register(WaitTarget::Reply(Arc::clone(&channel)));
        match channel.wait_reply(id, task.interrupt()) {
            Ok(disposition) => SyscallFate::Emulate {
                error: disposition.error,
                val: disposition.val,
            },
            Err(NotifyError::Interrupted) => match channel.withdraw(id) {
                // The reply landed while we were waking up; it wins.
                Some(disposition) => SyscallFate::Emulate {
                    error: disposition.error,
                    val: disposition.val,
                },
                None => SyscallFate::Interrupted,
            },
            Err(_) => SyscallFate::Emulate { error: TEARDOWN_ERRNO, val: 0 },
        }
    }

    /// Chain length of a task's filter chain; diagnostic.
    #[must_use]
    pub fn chain_len(&self, task: &Arc<Task>) -> usize {
        self.shared.read_arena().chain_len(task.leaf())
    }

    /// A task's current leaf handle; diagnostic.
    #[must_use]
    pub fn leaf_node(&self, task: &Arc<Task>) -> Option<NodeId> {
        task.leaf()
    }

    /// Usage count of a node; diagnostic, racy by nature.
    #[must_use]
    pub fn node_usage(&self, id: NodeId) -> Option<usize> {
        self.shared.read_arena().get(id).map(|node| node.usage())
    }

    /// Number of live filter nodes in the arena; diagnostic.
    #[must_use]
    pub fn live_filters(&self) -> usize {
        self.shared.read_arena().live_nodes()
    }
}

pub(crate) fn lock_unit(mutex: &Mutex<()>) -> MutexGuard<'_, ()> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Emits the audit record for a resolved action, honoring the default
/// logged-action set and, for the skip-style actions, the matched node's
/// log request.
fn audit(record: &SyscallRecord, signal: i32, action: Action, requested: bool) {
    let log = match action {
        Action::Allow => false,
        Action::Trap => requested && DEFAULT_ACTIONS_LOGGED & LOG_TRAP != 0,
        Action::Errno => requested && DEFAULT_ACTIONS_LOGGED & LOG_ERRNO != 0,
        Action::Trace => requested && DEFAULT_ACTIONS_LOGGED & LOG_TRACE != 0,
        Action::UserNotify => requested && DEFAULT_ACTIONS_LOGGED & LOG_USER_NOTIF != 0,
        Action::Log => DEFAULT_ACTIONS_LOGGED & LOG_LOG != 0,
        Action::KillThread => DEFAULT_ACTIONS_LOGGED & LOG_KILL_THREAD != 0,
        Action::KillProcess => DEFAULT_ACTIONS_LOGGED & LOG_KILL_PROCESS != 0,
    };
    if !log {
        return;
    }
    match action {
        Action::KillProcess | Action::KillThread => {
            tracing::warn!(
                syscall = record.nr,
                arch = record.arch,
                signal,
                action = action.name(),
                "syscall terminated by filter"
            );
        }
        _ => {
            tracing::info!(
                syscall = record.nr,
                arch = record.arch,
                signal,
                action = action.name(),
                "syscall restricted by filter"
            );
        }
    }
}
