//! Notification-protocol error types.

use thiserror::Error;

use super::RequestState;

/// Errors surfaced by the rendezvous protocol.
///
/// The supervisor-side failures (`NotFound`, `WrongState`,
/// `NoPendingRequest`) are expected under races and recoverable by
/// retrying; `Interrupted` is the caller-side wakeup status; `Disconnected`
/// means the channel was torn down and no further traffic is possible.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NotifyError {
    /// No request with this cookie exists on the channel.
    #[error("no notification request with id {id}")]
    NotFound {
        /// The unknown cookie.
        id: u64,
    },

    /// The request exists but is not in the state the operation needs.
    #[error("notification request {id} is in state {state:?}, reply not permitted")]
    WrongState {
        /// The request cookie.
        id: u64,
        /// The state the request was actually in.
        state: RequestState,
    },

    /// A receive woke up but every queued request was already taken or
    /// withdrawn; the supervisor is expected to retry.
    #[error("no request awaiting delivery")]
    NoPendingRequest,

    /// The waiting side was interrupted by an asynchronous signal.
    #[error("wait interrupted")]
    Interrupted,

    /// The channel was torn down (listener closed or never present).
    #[error("notification channel is down")]
    Disconnected,

    /// A response carried non-zero flag bits, which this protocol
    /// revision does not define.
    #[error("unsupported response flags {flags:#x}")]
    NonZeroFlags {
        /// The rejected flag bits.
        flags: u32,
    },
}
