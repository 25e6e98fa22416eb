//! Supervisor-facing listener descriptors and their wire records.
//!
//! Installing a filter with listener semantics yields a small non-negative
//! descriptor in the installing process. The descriptor resolves to a
//! [`Listener`] handle carrying the receive/send/check operations of the
//! rendezvous protocol, plus poll-style readiness. The request and
//! response records exchanged over the handle have fixed native-endian
//! layouts that existing supervisors depend on byte-for-byte.
//!
//! Closing the descriptor tears the channel down with the
//! function-not-implemented disposition, so no suspended caller outlives
//! its supervisor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::chain::NodeId;
use crate::engine::EngineShared;
use crate::notify::{
    Disposition, InterruptFlag, NotificationChannel, NotifyError, Readiness, WaitTarget,
};
use crate::record::{SyscallRecord, RECORD_SIZE};

/// Size of the encoded request record in bytes.
pub const NOTIF_REQUEST_SIZE: usize = 80;

/// Size of the encoded response record in bytes.
pub const NOTIF_RESPONSE_SIZE: usize = 24;

/// Disposition forced onto outstanding requests when a listener closes.
pub const TEARDOWN_ERRNO: i32 = -libc::ENOSYS;

/// Listener descriptor, local to the installing process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerFd(pub i32);

/// ABI sizes reported to supervisors for buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NotifySizes {
    /// Encoded request record size.
    pub request: u16,
    /// Encoded response record size.
    pub response: u16,
    /// Encoded syscall record size.
    pub record: u16,
}

/// The GetNotifySizes query.
#[must_use]
pub const fn notify_sizes() -> NotifySizes {
    NotifySizes {
        request: NOTIF_REQUEST_SIZE as u16,
        response: NOTIF_RESPONSE_SIZE as u16,
        record: RECORD_SIZE as u16,
    }
}

/// A wire record failed to decode.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WireError {
    /// The buffer is not the exact record size.
    #[error("wire record is {got} bytes, expected {expected}")]
    WrongLength {
        /// Required length.
        expected: usize,
        /// Length actually supplied.
        got: usize,
    },
}

/// One suspended syscall, as read by a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifRequestWire {
    /// Request cookie; echo it back in the response.
    pub id: u64,
    /// Thread id of the blocked caller (reporting only).
    pub pid: u32,
    /// Reserved, currently always zero.
    pub flags: u32,
    /// The syscall record under adjudication.
    pub record: SyscallRecord,
}

impl NotifRequestWire {
    /// Encodes into the fixed 80-byte image.
    #[must_use]
    pub fn encode(&self) -> [u8; NOTIF_REQUEST_SIZE] {
        let mut buf = [0u8; NOTIF_REQUEST_SIZE];
        buf[0..8].copy_from_slice(&self.id.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.pid.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_ne_bytes());
        buf[16..16 + RECORD_SIZE].copy_from_slice(&self.record.encode());
        buf
    }

    /// Decodes from the fixed 80-byte image.
    ///
    /// # Errors
    ///
    /// `WrongLength` unless the buffer is exactly the record size.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != NOTIF_REQUEST_SIZE {
            return Err(WireError::WrongLength {
                expected: NOTIF_REQUEST_SIZE,
                got: buf.len(),
            });
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[0..8]);
        let mut pid = [0u8; 4];
        pid.copy_from_slice(&buf[8..12]);
        let mut flags = [0u8; 4];
        flags.copy_from_slice(&buf[12..16]);
        let mut record = [0u8; RECORD_SIZE];
        record.copy_from_slice(&buf[16..16 + RECORD_SIZE]);
        Ok(Self {
            id: u64::from_ne_bytes(id),
            pid: u32::from_ne_bytes(pid),
            flags: u32::from_ne_bytes(flags),
            record: SyscallRecord::decode(&record),
        })
    }
}

/// A supervisor's disposition for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifResponseWire {
    /// Cookie of the request being answered.
    pub id: u64,
    /// Return value when `error` is zero.
    pub val: i64,
    /// Error to fail the syscall with (zero for success).
    pub error: i32,
    /// Reserved, must be zero.
    pub flags: u32,
}

impl NotifResponseWire {
    /// Encodes into the fixed 24-byte image.
    #[must_use]
    pub fn encode(&self) -> [u8; NOTIF_RESPONSE_SIZE] {
        let mut buf = [0u8; NOTIF_RESPONSE_SIZE];
        buf[0..8].copy_from_slice(&self.id.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.val.to_ne_bytes());
        buf[16..20].copy_from_slice(&self.error.to_ne_bytes());
        buf[20..24].copy_from_slice(&self.flags.to_ne_bytes());
        buf
    }

    /// Decodes from the fixed 24-byte image.
    ///
    /// # Errors
    ///
    /// `WrongLength` unless the buffer is exactly the record size.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != NOTIF_RESPONSE_SIZE {
            return Err(WireError::WrongLength {
                expected: NOTIF_RESPONSE_SIZE,
                got: buf.len(),
            });
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[0..8]);
        let mut val = [0u8; 8];
        val.copy_from_slice(&buf[8..16]);
        let mut error = [0u8; 4];
        error.copy_from_slice(&buf[16..20]);
        let mut flags = [0u8; 4];
        flags.copy_from_slice(&buf[20..24]);
        Ok(Self {
            id: u64::from_ne_bytes(id),
            val: i64::from_ne_bytes(val),
            error: i32::from_ne_bytes(error),
            flags: u32::from_ne_bytes(flags),
        })
    }
}

/// An open listener: the supervisor's end of one notification channel.
pub struct Listener {
    engine: Arc<EngineShared>,
    node: NodeId,
    channel: Arc<NotificationChannel>,
    closed: AtomicBool,
}

impl Listener {
    pub(crate) fn new(
        engine: Arc<EngineShared>,
        node: NodeId,
        channel: Arc<NotificationChannel>,
    ) -> Self {
        Self {
            engine,
            node,
            channel,
            closed: AtomicBool::new(false),
        }
    }

    /// Blocks for the next undelivered request and marks it delivered.
    ///
    /// # Errors
    ///
    /// `NoPendingRequest` after losing a race with a withdrawing caller
    /// (retry), `Interrupted` when the supplied flag is raised,
    /// `Disconnected` once the listener is closed.
    pub fn recv(&self, interrupt: &InterruptFlag) -> Result<NotifRequestWire, NotifyError> {
        let _wait = interrupt.register(WaitTarget::Doorbell(Arc::clone(&self.channel)));
        let request = self.channel.receive(interrupt)?;
        Ok(NotifRequestWire {
            id: request.id,
            pid: request.pid.0,
            flags: 0,
            record: request.record,
        })
    }

    /// Records the disposition for a delivered request and wakes its
    /// caller.
    ///
    /// # Errors
    ///
    /// `NonZeroFlags` for undefined flag bits, `NotFound` for an unknown
    /// cookie, `WrongState` when the request was never delivered or is
    /// already answered.
    pub fn send(&self, response: &NotifResponseWire) -> Result<(), NotifyError> {
        if response.flags != 0 {
            return Err(NotifyError::NonZeroFlags { flags: response.flags });
        }
        self.channel.send(
            response.id,
            Disposition { error: response.error, val: response.val },
        )
    }

    /// Whether `id` names a request still awaiting this supervisor's
    /// reply.
    #[must_use]
    pub fn id_valid(&self, id: u64) -> bool {
        self.channel.id_valid(id)
    }

    /// Poll view of the channel.
    #[must_use]
    pub fn readiness(&self) -> Readiness {
        self.channel.readiness()
    }

    /// Tears the channel down and drops the filter reference. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.channel.teardown(TEARDOWN_ERRNO);
            self.engine.release_node(self.node);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("node", &self.node)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

enum Slot {
    Reserved,
    Bound(Arc<Listener>),
}

/// Per-process descriptor table for listeners.
///
/// Slots are reserved before the install takes any lock and either bound
/// on success or released on failure, keeping installs transactional.
pub(crate) struct ListenerTable {
    slots: Vec<Option<Slot>>,
    limit: usize,
}

impl ListenerTable {
    pub(crate) fn new(limit: usize) -> Self {
        Self { slots: Vec::new(), limit }
    }

    /// Claims the lowest free descriptor, or `None` at the table limit.
    pub(crate) fn reserve(&mut self) -> Option<ListenerFd> {
        if let Some(free) = self.slots.iter().position(Option::is_none) {
            self.slots[free] = Some(Slot::Reserved);
            return Some(ListenerFd(free as i32));
        }
        if self.slots.len() >= self.limit {
            return None;
        }
        self.slots.push(Some(Slot::Reserved));
        Some(ListenerFd((self.slots.len() - 1) as i32))
    }

    /// Binds a reserved descriptor to its listener.
    pub(crate) fn bind(&mut self, fd: ListenerFd, listener: Arc<Listener>) {
        if let Some(slot) = self.slots.get_mut(fd.0 as usize) {
            *slot = Some(Slot::Bound(listener));
        }
    }

    /// Releases a reserved descriptor after a failed install.
    pub(crate) fn abort(&mut self, fd: ListenerFd) {
        if let Some(slot) = self.slots.get_mut(fd.0 as usize) {
            *slot = None;
        }
    }

    pub(crate) fn get(&self, fd: ListenerFd) -> Option<Arc<Listener>> {
        match self.slots.get(fd.0 as usize)? {
            Some(Slot::Bound(listener)) => Some(Arc::clone(listener)),
            _ => None,
        }
    }

    /// Removes and returns a bound listener, freeing the descriptor.
    pub(crate) fn take(&mut self, fd: ListenerFd) -> Option<Arc<Listener>> {
        let slot = self.slots.get_mut(fd.0 as usize)?;
        match slot.take() {
            Some(Slot::Bound(listener)) => Some(listener),
            other => {
                *slot = other;
                None
            }
        }
    }
}
