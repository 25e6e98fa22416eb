//! The suspend/rendezvous protocol behind the defer-to-supervisor action.
//!
//! A filter installed with listener semantics owns one
//! [`NotificationChannel`]. When evaluation resolves to the user-notify
//! action, the calling thread queues a request on that channel and blocks
//! until a supervisor drains the request and replies with a disposition, or
//! the channel is torn down, or the caller is interrupted.
//!
//! # State machine
//!
//! ```text
//! deliver --> Init --receive--> Sent --send--> Replied (terminal)
//!              ^                  |
//!              +---interrupted----+        teardown: * --> Replied(error)
//! ```
//!
//! # Locking
//!
//! One mutex guards the queue and every request's state; the doorbell is a
//! separate counting primitive so a supervisor can block on it without
//! holding the mutex. The reply condvar pairs with the state mutex.
//!
//! # Invariants
//!
//! - Request cookies are allocated from a randomly seeded wrapping counter
//!   and never reused within a channel's lifetime.
//! - At most one reply per request: only `Sent` accepts a disposition.
//! - A request leaves the queue only when the blocked caller consumes the
//!   result or withdraws; teardown force-replies but does not remove.
//! - An interrupted caller never strands a request in `Sent`: the request
//!   is reset to `Init` and the doorbell re-rung before the wait returns.

mod error;

pub use error::NotifyError;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::record::SyscallRecord;
use crate::task::Pid;

/// A request's position in the rendezvous protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Queued, not yet seen by a supervisor.
    Init,
    /// Delivered to a supervisor, awaiting its reply.
    Sent,
    /// A disposition has been recorded; terminal.
    Replied,
}

/// The supervisor's answer for one suspended syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Disposition {
    /// Error to fail the syscall with (zero for success).
    pub error: i32,
    /// Return value when `error` is zero.
    pub val: i64,
}

/// Channel readiness, as exposed through polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    /// A request is queued and not yet delivered.
    pub readable: bool,
    /// A delivered request is awaiting its reply.
    pub writable: bool,
}

/// A request as handed to the supervisor by a receive.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReceivedRequest {
    pub(crate) id: u64,
    pub(crate) pid: Pid,
    pub(crate) record: SyscallRecord,
}

struct RequestSlot {
    id: u64,
    requester: Pid,
    record: SyscallRecord,
    state: RequestState,
    error: i32,
    val: i64,
}

struct ChannelInner {
    next_id: u64,
    alive: bool,
    pending: VecDeque<RequestSlot>,
}

/// Rendezvous channel owned by one listener-bearing filter node.
pub(crate) struct NotificationChannel {
    inner: Mutex<ChannelInner>,
    replied: Condvar,
    doorbell: Doorbell,
}

impl NotificationChannel {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(ChannelInner {
                next_id: rand::random(),
                alive: true,
                pending: VecDeque::new(),
            }),
            replied: Condvar::new(),
            doorbell: Doorbell::new(),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a request and rings the doorbell; returns the cookie the
    /// caller must wait on.
    ///
    /// # Errors
    ///
    /// `Disconnected` when the channel has been torn down.
    pub(crate) fn deliver(
        &self,
        requester: Pid,
        record: SyscallRecord,
    ) -> Result<u64, NotifyError> {
        let mut inner = self.lock_inner();
        if !inner.alive {
            return Err(NotifyError::Disconnected);
        }
        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1);
        inner.pending.push_back(RequestSlot {
            id,
            requester,
            record,
            state: RequestState::Init,
            error: 0,
            val: 0,
        });
        drop(inner);
        self.doorbell.ring();
        tracing::trace!(id, pid = requester.0, "queued notification request");
        Ok(id)
    }

    /// Blocks the caller until its request reaches `Replied`, consuming
    /// and returning the disposition.
    ///
    /// On interruption a request the supervisor had already taken is reset
    /// to `Init` and re-announced so it is never orphaned; the request
    /// itself stays queued and the caller decides whether to retry the
    /// wait or [`withdraw`](Self::withdraw).
    ///
    /// For the interrupt to deliver a wakeup, the caller must hold a
    /// [`WaitTarget::Reply`] registration on its flag while blocked here.
    ///
    /// # Errors
    ///
    /// `Interrupted` when the caller's interrupt flag is raised;
    /// `NotFound` if the request is no longer queued.
    pub(crate) fn wait_reply(
        &self,
        id: u64,
        interrupt: &InterruptFlag,
    ) -> Result<Disposition, NotifyError> {
        let mut inner = self.lock_inner();
        loop {
            let Some(pos) = inner.pending.iter().position(|slot| slot.id == id) else {
                return Err(NotifyError::NotFound { id });
            };
            if inner.pending[pos].state == RequestState::Replied {
                return match inner.pending.remove(pos) {
                    Some(slot) => Ok(Disposition { error: slot.error, val: slot.val }),
                    None => Err(NotifyError::NotFound { id }),
                };
            }
            if interrupt.raised() {
                if inner.pending[pos].state == RequestState::Sent {
                    inner.pending[pos].state = RequestState::Init;
                    drop(inner);
                    self.doorbell.ring();
                }
                return Err(NotifyError::Interrupted);
            }
            inner = self
                .replied
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Removes the caller's request from the queue.
    ///
    /// If a reply landed between the caller's wakeup and the withdrawal,
    /// the disposition is returned instead of being discarded.
    pub(crate) fn withdraw(&self, id: u64) -> Option<Disposition> {
        let mut inner = self.lock_inner();
        let pos = inner.pending.iter().position(|slot| slot.id == id)?;
        let slot = inner.pending.remove(pos)?;
        if slot.state == RequestState::Replied {
            Some(Disposition { error: slot.error, val: slot.val })
        } else {
            None
        }
    }

    /// Supervisor side: waits for a queued request, marks it `Sent`, and
    /// returns a read-only view of it.
    ///
    /// For the interrupt to deliver a wakeup, the caller must hold a
    /// [`WaitTarget::Doorbell`] registration on its flag while blocked
    /// here.
    ///
    /// # Errors
    ///
    /// `NoPendingRequest` when the doorbell fired but the request was
    /// withdrawn before this receive could claim it (retry);
    /// `Interrupted` / `Disconnected` from the doorbell wait.
    pub(crate) fn receive(
        &self,
        interrupt: &InterruptFlag,
    ) -> Result<ReceivedRequest, NotifyError> {
        self.doorbell.wait(interrupt)?;
        let mut inner = self.lock_inner();
        if !inner.alive {
            return Err(NotifyError::Disconnected);
        }
        for slot in inner.pending.iter_mut() {
            if slot.state == RequestState::Init {
                slot.state = RequestState::Sent;
                return Ok(ReceivedRequest {
                    id: slot.id,
                    pid: slot.requester,
                    record: slot.record,
                });
            }
        }
        Err(NotifyError::NoPendingRequest)
    }

    /// Supervisor side: records the disposition for a `Sent` request and
    /// wakes its caller. Exactly one reply is permitted per request.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown cookie, `WrongState` when the request was
    /// never delivered or already answered.
    pub(crate) fn send(&self, id: u64, disposition: Disposition) -> Result<(), NotifyError> {
        let mut inner = self.lock_inner();
        let Some(slot) = inner.pending.iter_mut().find(|slot| slot.id == id) else {
            return Err(NotifyError::NotFound { id });
        };
        if slot.state != RequestState::Sent {
            return Err(NotifyError::WrongState { id, state: slot.state });
        }
        slot.state = RequestState::Replied;
        slot.error = disposition.error;
        slot.val = disposition.val;
        self.replied.notify_all();
        Ok(())
    }

    /// Supervisor side: whether `id` names a request still awaiting this
    /// supervisor's reply.
    pub(crate) fn id_valid(&self, id: u64) -> bool {
        let inner = self.lock_inner();
        inner
            .pending
            .iter()
            .any(|slot| slot.id == id && slot.state == RequestState::Sent)
    }

    /// Force-replies every outstanding request with `reason` and closes
    /// the channel, guaranteeing no caller stays blocked.
    pub(crate) fn teardown(&self, reason: i32) {
        let mut inner = self.lock_inner();
        inner.alive = false;
        let mut forced = 0usize;
        for slot in inner.pending.iter_mut() {
            if slot.state != RequestState::Replied {
                slot.state = RequestState::Replied;
                slot.error = reason;
                slot.val = 0;
                forced += 1;
            }
        }
        self.replied.notify_all();
        drop(inner);
        self.doorbell.close();
        tracing::debug!(forced, reason, "notification channel torn down");
    }

    /// Whether the channel still accepts traffic.
    pub(crate) fn is_alive(&self) -> bool {
        self.lock_inner().alive
    }

    /// Poll view: readable while an `Init` request exists, writable while
    /// a `Sent` one does.
    pub(crate) fn readiness(&self) -> Readiness {
        let inner = self.lock_inner();
        let mut ready = Readiness::default();
        for slot in &inner.pending {
            match slot.state {
                RequestState::Init => ready.readable = true,
                RequestState::Sent => ready.writable = true,
                RequestState::Replied => {}
            }
            if ready.readable && ready.writable {
                break;
            }
        }
        ready
    }

    fn wake_reply_waiters(&self) {
        let _guard = self.lock_inner();
        self.replied.notify_all();
    }
}

struct DoorbellState {
    available: u64,
    closed: bool,
}

/// Counting wakeup primitive: one ring per queued request, one consumed
/// per successful wait. Lives outside the channel mutex.
struct Doorbell {
    state: Mutex<DoorbellState>,
    bell: Condvar,
}

impl Doorbell {
    fn new() -> Self {
        Self {
            state: Mutex::new(DoorbellState { available: 0, closed: false }),
            bell: Condvar::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, DoorbellState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ring(&self) {
        let mut state = self.lock_state();
        state.available += 1;
        drop(state);
        self.bell.notify_one();
    }

    fn close(&self) {
        let mut state = self.lock_state();
        state.closed = true;
        drop(state);
        self.bell.notify_all();
    }

    fn wake_all(&self) {
        let _guard = self.lock_state();
        self.bell.notify_all();
    }

    fn wait(&self, interrupt: &InterruptFlag) -> Result<(), NotifyError> {
        let mut state = self.lock_state();
        loop {
            if state.closed {
                return Err(NotifyError::Disconnected);
            }
            if state.available > 0 {
                state.available -= 1;
                return Ok(());
            }
            if interrupt.raised() {
                return Err(NotifyError::Interrupted);
            }
            state = self
                .bell
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Where an interrupt has to deliver its wakeup.
#[derive(Clone)]
pub(crate) enum WaitTarget {
    /// Blocked in a reply wait on this channel.
    Reply(Arc<NotificationChannel>),
    /// Blocked on this channel's doorbell.
    Doorbell(Arc<NotificationChannel>),
}

/// Per-task interruption flag for asynchronous termination signals.
///
/// Raising the flag is sticky until [`clear`](Self::clear); if the owning
/// task is blocked in a notification wait the raise also delivers the
/// wakeup, which is what makes those waits interruptible.
pub struct InterruptFlag {
    raised: AtomicBool,
    target: Mutex<Option<WaitTarget>>,
}

impl InterruptFlag {
    /// A lowered flag.
    #[must_use]
    pub fn new() -> Self {
        Self {
            raised: AtomicBool::new(false),
            target: Mutex::new(None),
        }
    }

    /// Raises the flag and wakes any registered wait.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
        let target = self
            .target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match target {
            Some(WaitTarget::Reply(channel)) => channel.wake_reply_waiters(),
            Some(WaitTarget::Doorbell(channel)) => channel.doorbell.wake_all(),
            None => {}
        }
    }

    /// Lowers the flag again (the embedder's signal handling decides when).
    pub fn clear(&self) {
        self.raised.store(false, Ordering::SeqCst);
    }

    /// Whether the flag is raised.
    #[must_use]
    pub fn raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    pub(crate) fn register(&self, target: WaitTarget) -> WaitRegistration<'_> {
        *self.target.lock().unwrap_or_else(PoisonError::into_inner) = Some(target);
        WaitRegistration { flag: self }
    }
}

impl Default for InterruptFlag {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct WaitRegistration<'a> {
    flag: &'a InterruptFlag,
}

impl Drop for WaitRegistration<'_> {
    fn drop(&mut self) {
        *self
            .flag
            .target
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}
