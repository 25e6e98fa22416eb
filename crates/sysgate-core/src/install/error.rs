//! Install-protocol error types.

use thiserror::Error;

use crate::program::ProgramError;
use crate::task::{Mode, Pid};

/// Errors from mode assignment and filter installation.
///
/// Every failure is transactional: when any variant is returned, no node
/// was installed on any thread and no reserved descriptor stays claimed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InstallError {
    /// The flag word carries bits this engine does not define.
    #[error("unknown filter flags {flags:#x}")]
    InvalidFlags {
        /// The rejected flag word.
        flags: u32,
    },

    /// Thread-sync and new-listener were requested together. Their
    /// result channels are incompatible: one reports an offending thread
    /// id on failure, the other a descriptor on success, and a combined
    /// return cannot be told apart.
    #[error("thread-sync and new-listener cannot be combined")]
    ConflictingFlags,

    /// The filter program failed decode, subset checking, or compilation.
    #[error(transparent)]
    InvalidProgram(#[from] ProgramError),

    /// Installing the program would push the chain past the instruction
    /// budget.
    #[error("chain would hold {total} budgeted instructions, ceiling is {limit}")]
    TooManyInstructions {
        /// Budgeted total the install would have produced.
        total: u64,
        /// The configured ceiling.
        limit: u64,
    },

    /// The caller has neither the no-new-privileges attribute nor the
    /// administrative capability.
    #[error("installing a filter requires no-new-privileges or the admin capability")]
    PermissionDenied,

    /// The task already committed to an incompatible mode.
    #[error("task is already in {current:?} mode")]
    ModeConflict {
        /// The mode the task committed to.
        current: Mode,
    },

    /// A notification listener is already reachable on the chain.
    #[error("a listener already exists on this filter chain")]
    ListenerExists,

    /// A sibling thread is on an incompatible chain; nothing was
    /// installed anywhere.
    #[error("thread {thread} cannot be synchronized")]
    ThreadSyncFailed {
        /// The first offending thread.
        thread: Pid,
    },

    /// The process is out of listener descriptors.
    #[error("listener descriptor table is full ({limit} slots)")]
    NoListenerSlot {
        /// The configured table size.
        limit: usize,
    },
}
