//! Multi-thread caller/supervisor rendezvous behavior.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sysgate_core::program::testing::{ret_program, StubCompiler};
use sysgate_core::{
    Credentials, FilterFlags, Listener, ListenerFd, NotifResponseWire, NotifyError,
    PolicyEngine, SyscallFate, SyscallRecord, Task, InterruptFlag, RET_USER_NOTIF,
    TEARDOWN_ERRNO,
};

fn notifying_setup() -> (Arc<PolicyEngine>, Arc<Task>, Arc<Listener>, ListenerFd) {
    let engine = Arc::new(PolicyEngine::new(Arc::new(StubCompiler::new())));
    let task = engine.spawn_process(Credentials::unprivileged());
    task.set_no_new_privs();
    let fd = engine
        .set_mode_filter(&task, FilterFlags::NEW_LISTENER, &ret_program(RET_USER_NOTIF))
        .unwrap()
        .expect("listener descriptor");
    let listener = task.group().listener(fd).expect("bound listener");
    (engine, task, listener, fd)
}

fn record(nr: i32) -> SyscallRecord {
    SyscallRecord {
        nr,
        arch: 0xc000_003e,
        instruction_pointer: 0x1000,
        args: [11, 22, 33, 44, 55, 66],
    }
}

/// Receives, retrying the expected race where a doorbell ring outlives a
/// withdrawn request.
fn recv_retry(
    listener: &Listener,
    interrupt: &InterruptFlag,
) -> sysgate_core::NotifRequestWire {
    loop {
        match listener.recv(interrupt) {
            Ok(request) => return request,
            Err(NotifyError::NoPendingRequest) => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(other) => panic!("unexpected receive failure: {other}"),
        }
    }
}

fn spawn_caller(
    engine: &Arc<PolicyEngine>,
    task: &Arc<Task>,
    nr: i32,
) -> thread::JoinHandle<SyscallFate> {
    let engine = Arc::clone(engine);
    let task = Arc::clone(task);
    thread::spawn(move || engine.secure_computing(&task, &record(nr)))
}

#[test]
fn round_trip_resolves_the_callers_syscall() {
    let (engine, task, listener, _fd) = notifying_setup();
    let caller = spawn_caller(&engine, &task, 89);

    let interrupt = InterruptFlag::new();
    let request = listener.recv(&interrupt).unwrap();
    assert_eq!(request.pid, task.tid().0);
    assert_eq!(request.record, record(89));
    assert!(listener.id_valid(request.id));

    listener
        .send(&NotifResponseWire { id: request.id, val: 42, error: 0, flags: 0 })
        .unwrap();

    assert_eq!(
        caller.join().unwrap(),
        SyscallFate::Emulate { error: 0, val: 42 }
    );

    // Exactly one reply per request: the cookie is gone once consumed.
    assert!(matches!(
        listener.send(&NotifResponseWire { id: request.id, val: 0, error: 0, flags: 0 }),
        Err(NotifyError::NotFound { .. })
    ));
}

#[test]
fn a_second_reply_before_consumption_is_rejected() {
    let (engine, task, listener, _fd) = notifying_setup();

    // Park the caller's reply so the request stays queued after Replied.
    let caller = spawn_caller(&engine, &task, 7);
    let interrupt = InterruptFlag::new();
    let request = listener.recv(&interrupt).unwrap();

    listener
        .send(&NotifResponseWire { id: request.id, val: 1, error: 0, flags: 0 })
        .unwrap();
    // Depending on scheduling the caller may or may not have consumed
    // already; both refusals are within contract.
    let second = listener.send(&NotifResponseWire {
        id: request.id,
        val: 2,
        error: 0,
        flags: 0,
    });
    assert!(matches!(
        second,
        Err(NotifyError::WrongState { .. } | NotifyError::NotFound { .. })
    ));

    assert_eq!(
        caller.join().unwrap(),
        SyscallFate::Emulate { error: 0, val: 1 }
    );
}

#[test]
fn responses_with_flag_bits_are_rejected() {
    let (_engine, _task, listener, _fd) = notifying_setup();
    assert!(matches!(
        listener.send(&NotifResponseWire { id: 1, val: 0, error: 0, flags: 2 }),
        Err(NotifyError::NonZeroFlags { flags: 2 })
    ));
}

#[test]
fn readiness_reflects_the_rendezvous_stages() {
    let (engine, task, listener, _fd) = notifying_setup();
    let ready = listener.readiness();
    assert!(!ready.readable && !ready.writable);

    let caller = spawn_caller(&engine, &task, 3);

    // Wait until the caller's request lands.
    let interrupt = InterruptFlag::new();
    let request = listener.recv(&interrupt).unwrap();
    let ready = listener.readiness();
    assert!(!ready.readable && ready.writable);

    listener
        .send(&NotifResponseWire { id: request.id, val: 0, error: 0, flags: 0 })
        .unwrap();
    caller.join().unwrap();

    let ready = listener.readiness();
    assert!(!ready.readable && !ready.writable);
}

#[test]
fn closing_the_listener_releases_blocked_callers() {
    let (engine, task, listener, fd) = notifying_setup();
    let caller = spawn_caller(&engine, &task, 11);

    // Take the request so it sits in the delivered state, then close.
    let interrupt = InterruptFlag::new();
    let request = listener.recv(&interrupt).unwrap();
    assert!(listener.id_valid(request.id));
    assert!(task.group().close_listener(fd));

    assert_eq!(
        caller.join().unwrap(),
        SyscallFate::Emulate { error: TEARDOWN_ERRNO, val: 0 }
    );

    // The descriptor is gone and the channel refuses further traffic.
    assert!(task.group().listener(fd).is_none());
    assert!(matches!(
        listener.recv(&interrupt),
        Err(NotifyError::Disconnected)
    ));
}

#[test]
fn closing_with_queued_requests_releases_them_too() {
    let (engine, task, _listener, fd) = notifying_setup();
    let caller = spawn_caller(&engine, &task, 13);

    // Give the caller time to queue, then close without receiving.
    thread::sleep(Duration::from_millis(20));
    assert!(task.group().close_listener(fd));

    assert_eq!(
        caller.join().unwrap(),
        SyscallFate::Emulate { error: TEARDOWN_ERRNO, val: 0 }
    );
}

#[test]
fn syscalls_after_listener_close_fail_fast() {
    let (engine, task, _listener, fd) = notifying_setup();
    assert!(task.group().close_listener(fd));
    assert_eq!(
        engine.secure_computing(&task, &record(17)),
        SyscallFate::Emulate { error: TEARDOWN_ERRNO, val: 0 }
    );
}

#[test]
fn interrupting_the_caller_withdraws_its_request() {
    let (engine, task, listener, _fd) = notifying_setup();
    let caller = spawn_caller(&engine, &task, 23);

    let interrupt = InterruptFlag::new();
    let request = listener.recv(&interrupt).unwrap();
    assert!(listener.id_valid(request.id));

    task.interrupt().raise();
    assert_eq!(caller.join().unwrap(), SyscallFate::Interrupted);

    // The withdrawn cookie no longer answers.
    assert!(!listener.id_valid(request.id));
    assert!(matches!(
        listener.send(&NotifResponseWire { id: request.id, val: 0, error: 0, flags: 0 }),
        Err(NotifyError::NotFound { .. })
    ));

    // The caller re-enters evaluation once the flag is cleared. The
    // interrupted request's doorbell ring may still be pending, so the
    // receive side retries through it.
    task.interrupt().clear();
    let retry = spawn_caller(&engine, &task, 23);
    let request = recv_retry(&listener, &interrupt);
    listener
        .send(&NotifResponseWire { id: request.id, val: 5, error: 0, flags: 0 })
        .unwrap();
    assert_eq!(
        retry.join().unwrap(),
        SyscallFate::Emulate { error: 0, val: 5 }
    );
}

#[test]
fn listener_close_drops_its_chain_reference() {
    let (engine, task, _listener, fd) = notifying_setup();
    let leaf = engine.leaf_node(&task).unwrap();
    assert_eq!(engine.node_usage(leaf), Some(2));

    assert!(task.group().close_listener(fd));
    assert_eq!(engine.node_usage(leaf), Some(1));

    engine.release_task(&task);
    assert_eq!(engine.live_filters(), 0);
}

#[test]
fn concurrent_callers_all_resolve() {
    let (engine, task, listener, _fd) = notifying_setup();

    let callers: Vec<_> = (0..8).map(|i| spawn_caller(&engine, &task, 100 + i)).collect();

    let interrupt = InterruptFlag::new();
    for _ in 0..8 {
        let request = listener.recv(&interrupt).unwrap();
        let val = i64::from(request.record.nr);
        listener
            .send(&NotifResponseWire { id: request.id, val, error: 0, flags: 0 })
            .unwrap();
    }

    let mut vals: Vec<i64> = callers
        .into_iter()
        .map(|caller| match caller.join().unwrap() {
            SyscallFate::Emulate { error: 0, val } => val,
            other => panic!("expected emulated result, got {other:?}"),
        })
        .collect();
    vals.sort_unstable();
    assert_eq!(vals, (100..108).collect::<Vec<i64>>());
}
