//! Mode assignment and the attach/thread-sync protocol.
//!
//! Everything that changes a task's policy state funnels through here:
//! the strict-mode switch, filter installation with its flag surface, the
//! duplicate-listener rule, and the all-or-nothing thread synchronization
//! pass.
//!
//! # Protocol shape
//!
//! The expensive, fallible work (program decode, subset check,
//! compilation, listener allocation) happens before any lock is taken, so
//! failure paths never hold partially initialized state. The critical
//! section then runs under the group's signal lock (plus the credential
//! guard when synchronizing threads): validate mode, validate siblings,
//! install the leaf, propagate. Every early return before the leaf is
//! published leaves all threads exactly as they were.
//!
//! # Invariants
//!
//! - A process never has two notification-bearing nodes reachable on one
//!   active chain.
//! - Thread-sync either installs the caller's new leaf on every sibling
//!   or on none, and reports the first incompatible thread.
//! - The no-new-privileges attribute propagates to synchronized siblings
//!   so a thread cannot launder privilege through a dying installer.

mod error;

pub use error::InstallError;

use std::sync::Arc;

use bitflags::bitflags;

use crate::action;
use crate::chain::{FilterNode, NodeId};
use crate::engine::{lock_unit, PolicyEngine};
use crate::listener::{notify_sizes, Listener, ListenerFd, NotifySizes};
use crate::notify::NotificationChannel;
use crate::program;
use crate::task::{Mode, Task};

bitflags! {
    /// Behavior flags for filter installation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FilterFlags: u32 {
        /// Synchronize every thread in the group onto the new chain.
        const TSYNC = 1 << 0;
        /// Request logging for this node's non-allow outcomes.
        const LOG = 1 << 1;
        /// Skip the speculative-execution mitigation normally applied.
        const SPEC_ALLOW = 1 << 2;
        /// Allocate a notification listener for this node.
        const NEW_LISTENER = 1 << 3;
    }
}

/// The multiplexed install/query surface.
#[derive(Debug, Clone, Copy)]
pub enum SandboxOp<'a> {
    /// Switch the task to the fixed strict allowlist.
    SetModeStrict,
    /// Install a filter program; `flags` is the raw flag word.
    SetModeFilter {
        /// Raw behavior flags, validated against [`FilterFlags`].
        flags: u32,
        /// Encoded filter program.
        program: &'a [u8],
    },
    /// Ask whether an action value is enforceable.
    GetActionAvailable {
        /// Raw action value to test.
        action: u32,
    },
    /// Report the wire-record sizes for supervisor buffers.
    GetNotifySizes,
}

/// Successful result of a [`SandboxOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    /// The operation completed with nothing to return.
    Done,
    /// A listener was created on this descriptor.
    Listener(ListenerFd),
    /// Answer to the action-availability query.
    ActionAvailable(bool),
    /// Answer to the sizes query.
    NotifySizes(NotifySizes),
}

impl PolicyEngine {
    /// Entry point for the multiplexed operation surface.
    ///
    /// # Errors
    ///
    /// `InvalidFlags` for undefined flag bits; otherwise whatever the
    /// underlying operation reports.
    pub fn submit(&self, task: &Arc<Task>, op: SandboxOp<'_>) -> Result<OpOutcome, InstallError> {
        match op {
            SandboxOp::SetModeStrict => {
                self.set_mode_strict(task)?;
                Ok(OpOutcome::Done)
            }
            SandboxOp::SetModeFilter { flags, program } => {
                let flags = FilterFlags::from_bits(flags)
                    .ok_or(InstallError::InvalidFlags { flags })?;
                Ok(match self.set_mode_filter(task, flags, program)? {
                    Some(fd) => OpOutcome::Listener(fd),
                    None => OpOutcome::Done,
                })
            }
            SandboxOp::GetActionAvailable { action } => {
                Ok(OpOutcome::ActionAvailable(action::action_available(action)))
            }
            SandboxOp::GetNotifySizes => Ok(OpOutcome::NotifySizes(notify_sizes())),
        }
    }

    /// Switches the task to strict mode.
    ///
    /// # Errors
    ///
    /// `ModeConflict` when the task already committed to filter mode.
    pub fn set_mode_strict(&self, task: &Arc<Task>) -> Result<(), InstallError> {
        let _sig = lock_unit(&task.group().siglock);
        task.try_assign_mode(Mode::Strict)
            .map_err(|current| InstallError::ModeConflict { current })?;
        task.set_spec_mitigated();
        tracing::debug!(tid = task.tid().0, "strict mode enabled");
        Ok(())
    }

    /// Installs a filter program on the calling task, optionally
    /// synchronizing the whole thread group or creating a listener.
    ///
    /// Returns the listener descriptor when one was requested.
    ///
    /// # Errors
    ///
    /// See [`InstallError`]; all failures are transactional.
    pub fn set_mode_filter(
        &self,
        task: &Arc<Task>,
        flags: FilterFlags,
        program_bytes: &[u8],
    ) -> Result<Option<ListenerFd>, InstallError> {
        if flags.contains(FilterFlags::TSYNC | FilterFlags::NEW_LISTENER) {
            return Err(InstallError::ConflictingFlags);
        }
        if !task.no_new_privs() && !task.has_admin_capability() {
            return Err(InstallError::PermissionDenied);
        }

        // Compile and verify before taking any lock.
        let program = program::prepare(self.shared.compiler.as_ref(), program_bytes)?;

        // Listener resources are allocated up front as well; the slot is
        // released again on any failure below.
        let listener_setup = if flags.contains(FilterFlags::NEW_LISTENER) {
            let fd = task
                .group()
                .lock_listeners()
                .reserve()
                .ok_or(InstallError::NoListenerSlot {
                    limit: self.shared.config.listeners_per_process,
                })?;
            Some((fd, Arc::new(NotificationChannel::new())))
        } else {
            None
        };

        let channel = listener_setup.as_ref().map(|(_, channel)| Arc::clone(channel));
        match self.attach_filter(task, flags, program, channel) {
            Ok(node) => Ok(listener_setup.map(|(fd, channel)| {
                // The listener holds its own reference to the node it
                // serves, exactly like the task does.
                self.shared.bump_node(node);
                let listener = Arc::new(Listener::new(
                    Arc::clone(&self.shared),
                    node,
                    channel,
                ));
                task.group().lock_listeners().bind(fd, listener);
                tracing::debug!(tid = task.tid().0, fd = fd.0, "notification listener created");
                fd
            })),
            Err(err) => {
                if let Some((fd, _)) = listener_setup {
                    task.group().lock_listeners().abort(fd);
                }
                Err(err)
            }
        }
    }

    /// The locked validate-then-install section.
    fn attach_filter(
        &self,
        task: &Arc<Task>,
        flags: FilterFlags,
        program: Box<dyn crate::program::CompiledProgram>,
        channel: Option<Arc<NotificationChannel>>,
    ) -> Result<NodeId, InstallError> {
        let group = task.group();

        // Thread-sync must not race an exec-time credential change.
        let _cred = flags
            .contains(FilterFlags::TSYNC)
            .then(|| lock_unit(&group.cred_guard));
        let _sig = lock_unit(&group.siglock);

        if !task.mode_assignable(Mode::Filter) {
            return Err(InstallError::ModeConflict { current: task.mode() });
        }

        if channel.is_some() && self.shared.read_arena().chain_has_listener(task.leaf()) {
            return Err(InstallError::ListenerExists);
        }

        let limit = self.shared.config.max_insns_per_path;
        let total = {
            let arena = self.shared.read_arena();
            program.instruction_count() as u64 + arena.path_instruction_total(task.leaf())
        };
        if total > limit {
            return Err(InstallError::TooManyInstructions { total, limit });
        }

        if flags.contains(FilterFlags::TSYNC) {
            self.can_sync_threads(task)?;
        }

        let node = self.shared.write_arena().insert(FilterNode::new(
            program,
            flags.contains(FilterFlags::LOG),
            task.leaf(),
            channel,
        ));
        // The new node takes over the task's reference to the old leaf.
        task.set_leaf(Some(node));

        if flags.contains(FilterFlags::TSYNC) {
            self.sync_threads(task, flags, node);
        }

        task.try_assign_mode(Mode::Filter)
            .map_err(|current| InstallError::ModeConflict { current })?;
        if !flags.contains(FilterFlags::SPEC_ALLOW) {
            task.set_spec_mitigated();
        }

        tracing::debug!(
            tid = task.tid().0,
            node = node.0,
            chain_len = self.shared.read_arena().chain_len(Some(node)),
            "filter installed"
        );
        Ok(node)
    }

    /// Validates that every sibling can adopt the caller's chain: a
    /// sibling must either still be disabled or sit on an ancestral chain
    /// of the caller's current one.
    ///
    /// # Errors
    ///
    /// `ThreadSyncFailed` naming the first sibling that has diverged.
    fn can_sync_threads(&self, caller: &Arc<Task>) -> Result<(), InstallError> {
        let arena = self.shared.read_arena();
        for thread in caller.group().threads() {
            if thread.tid() == caller.tid() {
                continue;
            }
            let compatible = match thread.mode() {
                Mode::Disabled => true,
                Mode::Filter => arena.is_ancestor(thread.leaf(), caller.leaf()),
                Mode::Strict => false,
            };
            if !compatible {
                return Err(InstallError::ThreadSyncFailed { thread: thread.tid() });
            }
        }
        Ok(())
    }

    /// Adopts the caller's new leaf on every sibling. Runs only after
    /// [`can_sync_threads`](Self::can_sync_threads) passed under the same
    /// locks.
    fn sync_threads(&self, caller: &Arc<Task>, flags: FilterFlags, new_leaf: NodeId) {
        for thread in caller.group().threads() {
            if thread.tid() == caller.tid() {
                continue;
            }
            self.shared.bump_node(new_leaf);
            let old = thread.leaf();
            thread.set_leaf(Some(new_leaf));
            if let Some(old) = old {
                self.shared.release_node(old);
            }

            // A sibling must not escape no-new-privileges by letting the
            // installing thread die.
            if caller.no_new_privs() {
                thread.set_no_new_privs();
            }

            if thread.mode() == Mode::Disabled {
                // From Disabled this cannot conflict.
                let _ = thread.try_assign_mode(Mode::Filter);
                if !flags.contains(FilterFlags::SPEC_ALLOW) {
                    thread.set_spec_mitigated();
                }
            }
        }
        tracing::debug!(tgid = caller.group().tgid().0, "thread group synchronized");
    }
}
