//! Filter verdict vocabulary.
//!
//! Every filter program evaluates to a raw 32-bit verdict: an action in the
//! high bits (under [`ACTION_MASK`]) and 16 bits of auxiliary data in the low
//! half. The action values are an external ABI shared with existing policy
//! compilers and must not be renumbered.
//!
//! # Restrictiveness
//!
//! When several filters on a chain disagree, the most restrictive action
//! wins. "Most restrictive" is a policy invariant, not an accident of the
//! numeric encoding, so it is spelled out as the named [`RESTRICTIVENESS`]
//! order and [`Action`]'s derived `Ord` is pinned to it by test. The raw
//! encoding was chosen so that comparing the masked action bits as a signed
//! integer yields the same order; that agreement is also pinned by test.

use serde::{Deserialize, Serialize};

/// Mask selecting the action half of a raw verdict.
pub const ACTION_MASK: u32 = 0xffff_0000;

/// Mask selecting the auxiliary-data half of a raw verdict.
pub const DATA_MASK: u32 = 0x0000_ffff;

/// Kill the whole thread group.
pub const RET_KILL_PROCESS: u32 = 0x8000_0000;
/// Kill only the calling thread.
pub const RET_KILL_THREAD: u32 = 0x0000_0000;
/// Raise a trap signal carrying the data bits as a reason code.
pub const RET_TRAP: u32 = 0x0003_0000;
/// Fail the syscall with the errno in the data bits.
pub const RET_ERRNO: u32 = 0x0005_0000;
/// Suspend the caller and defer the decision to a supervisor.
pub const RET_USER_NOTIF: u32 = 0x7fc0_0000;
/// Hand the call to an attached tracer, passing the data bits along.
pub const RET_TRACE: u32 = 0x7ff0_0000;
/// Log the call, then allow it.
pub const RET_LOG: u32 = 0x7ffc_0000;
/// Allow the call.
pub const RET_ALLOW: u32 = 0x7fff_0000;

/// The outcome category of evaluating one filter program.
///
/// Declaration order is the restrictiveness order, most restrictive first;
/// the derived `Ord` therefore makes `min` pick the winning action.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Terminate the whole thread group.
    KillProcess,
    /// Terminate the calling thread.
    KillThread,
    /// Raise a trap signal in the caller.
    Trap,
    /// Fail the syscall with a filter-supplied errno.
    Errno,
    /// Defer to a supervisor over the notification channel.
    UserNotify,
    /// Defer to an attached tracer.
    Trace,
    /// Log and allow.
    Log,
    /// Allow.
    Allow,
}

/// The eight actions from most to least restrictive.
pub const RESTRICTIVENESS: [Action; 8] = [
    Action::KillProcess,
    Action::KillThread,
    Action::Trap,
    Action::Errno,
    Action::UserNotify,
    Action::Trace,
    Action::Log,
    Action::Allow,
];

impl Action {
    /// Decodes the action half of a raw verdict.
    ///
    /// Action values outside the known eight normalize to `KillProcess`:
    /// an unrecognized action must fail closed, and normalizing at decode
    /// keeps comparison and dispatch consistent.
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        match raw & ACTION_MASK {
            RET_KILL_THREAD => Self::KillThread,
            RET_TRAP => Self::Trap,
            RET_ERRNO => Self::Errno,
            RET_USER_NOTIF => Self::UserNotify,
            RET_TRACE => Self::Trace,
            RET_LOG => Self::Log,
            RET_ALLOW => Self::Allow,
            _ => Self::KillProcess,
        }
    }

    /// The canonical raw encoding of this action (data bits zero).
    #[must_use]
    pub const fn raw(self) -> u32 {
        match self {
            Self::KillProcess => RET_KILL_PROCESS,
            Self::KillThread => RET_KILL_THREAD,
            Self::Trap => RET_TRAP,
            Self::Errno => RET_ERRNO,
            Self::UserNotify => RET_USER_NOTIF,
            Self::Trace => RET_TRACE,
            Self::Log => RET_LOG,
            Self::Allow => RET_ALLOW,
        }
    }

    /// Short stable name for log records.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::KillProcess => "kill_process",
            Self::KillThread => "kill_thread",
            Self::Trap => "trap",
            Self::Errno => "errno",
            Self::UserNotify => "user_notif",
            Self::Trace => "trace",
            Self::Log => "log",
            Self::Allow => "allow",
        }
    }
}

/// A raw 32-bit verdict as returned by a filter program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawVerdict(pub u32);

impl RawVerdict {
    /// Builds a verdict from an action and auxiliary data.
    #[must_use]
    pub const fn new(action: Action, data: u16) -> Self {
        Self(action.raw() | data as u32)
    }

    /// The action half, normalized per [`Action::from_raw`].
    #[must_use]
    pub fn action(self) -> Action {
        Action::from_raw(self.0)
    }

    /// The auxiliary-data half.
    #[must_use]
    pub const fn data(self) -> u16 {
        (self.0 & DATA_MASK) as u16
    }
}

/// Whether a raw action value is one this engine can enforce.
///
/// The value must be an exact canonical action constant; data bits make it
/// unrecognizable, matching the install-time query semantics.
#[must_use]
pub fn action_available(action: u32) -> bool {
    matches!(
        action,
        RET_KILL_PROCESS
            | RET_KILL_THREAD
            | RET_TRAP
            | RET_ERRNO
            | RET_USER_NOTIF
            | RET_TRACE
            | RET_LOG
            | RET_ALLOW
    )
}
