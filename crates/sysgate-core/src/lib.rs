//! sysgate-core - Syscall-Filtering Policy Engine
//!
//! This library evaluates every system call a managed task attempts
//! against a chain of installed bytecode policies and decides whether the
//! call is allowed, denied, rewritten, or handed to a supervising process
//! for adjudication.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                PolicyEngine                  │
//! │  ┌──────────┐  ┌───────────┐  ┌──────────┐  │
//! │  │  install  │→│   chain   │←│  engine  │  │   evaluation
//! │  └──────────┘  └───────────┘  └────┬─────┘  │
//! │        │              ▲            │        │
//! │  ┌─────▼─────┐  ┌─────┴─────┐ ┌────▼─────┐  │
//! │  │  program  │  │   task    │ │  notify  │  │   rendezvous
//! │  └───────────┘  └───────────┘ └────┬─────┘  │
//! │                               ┌────▼─────┐  │
//! │                               │ listener │  │   supervisor side
//! │                               └──────────┘  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! A syscall flows in as a [`SyscallRecord`], the engine walks the calling
//! task's filter chain (newest node first), resolves the most restrictive
//! verdict, and returns a [`SyscallFate`] for the embedder to act on. The
//! user-notify fate suspends the caller inside the engine until a
//! supervisor, holding the [`Listener`] for that filter, replies.
//!
//! # Modules
//!
//! - [`action`]: verdict vocabulary and the restrictiveness order
//! - [`record`]: the fixed 64-byte syscall record
//! - [`program`]: instruction encoding, safe-subset checking, and the
//!   compiler boundary
//! - [`chain`]: the shared, reference-counted filter chain arena
//! - [`task`]: per-task policy state and thread groups
//! - [`engine`]: evaluation, dispatch, and audit logging
//! - [`install`]: mode assignment, attach, and thread synchronization
//! - [`notify`]: the suspend/rendezvous protocol
//! - [`listener`]: supervisor descriptors and wire records
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use sysgate_core::program::testing::{ret_program, StubCompiler};
//! use sysgate_core::{
//!     Credentials, FilterFlags, PolicyEngine, SyscallFate, SyscallRecord, RET_ERRNO,
//! };
//!
//! let engine = PolicyEngine::new(Arc::new(StubCompiler::new()));
//! let task = engine.spawn_process(Credentials::unprivileged());
//! task.set_no_new_privs();
//!
//! engine
//!     .set_mode_filter(&task, FilterFlags::empty(), &ret_program(RET_ERRNO | 5))
//!     .unwrap();
//!
//! let record = SyscallRecord { nr: 2, ..Default::default() };
//! assert_eq!(engine.secure_computing(&task, &record), SyscallFate::Errno(5));
//! ```

pub mod action;
pub mod chain;
pub mod engine;
pub mod install;
pub mod listener;
pub mod notify;
pub mod program;
pub mod record;
pub mod task;

pub use action::{
    action_available, Action, RawVerdict, ACTION_MASK, DATA_MASK, RESTRICTIVENESS,
    RET_ALLOW, RET_ERRNO, RET_KILL_PROCESS, RET_KILL_THREAD, RET_LOG, RET_TRACE,
    RET_TRAP, RET_USER_NOTIF,
};
pub use chain::{NodeId, LAYER_OVERHEAD_INSNS, MAX_INSNS_PER_PATH};
pub use engine::{Diagnostic, EngineConfig, PolicyEngine, SyscallFate, MAX_ERRNO};
pub use install::{FilterFlags, InstallError, OpOutcome, SandboxOp};
pub use listener::{
    notify_sizes, Listener, ListenerFd, NotifRequestWire, NotifResponseWire, NotifySizes,
    WireError, NOTIF_REQUEST_SIZE, NOTIF_RESPONSE_SIZE, TEARDOWN_ERRNO,
};
pub use notify::{Disposition, InterruptFlag, NotifyError, Readiness, RequestState};
pub use program::{CompiledProgram, ProgramCompiler, ProgramError, RawInstruction};
pub use record::{SyscallRecord, RECORD_SIZE};
pub use task::{Credentials, Mode, Pid, Task, ThreadGroup};
