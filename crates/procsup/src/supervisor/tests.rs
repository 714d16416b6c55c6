use super::*;
use crate::reactor::Interests;
use crate::request::PtyMode;
use crate::test_support::{FarEnds, Log, Recorder, ScriptedEngine};
use std::io::{Read, Write};

type TestSupervisor = Supervisor<ScriptedEngine, Interests>;

fn supervisor() -> TestSupervisor {
    Supervisor::new(ScriptedEngine::new(), Interests::new())
}

fn request() -> SpawnRequest {
    SpawnRequest::builder("/bin/sh").arg("-c").arg("true").build().unwrap()
}

fn spawn(sup: &mut TestSupervisor, log: &Log) -> (ProcessKey, u32) {
    let key = sup.spawn(&request(), Recorder::boxed(log)).unwrap();
    let pid = sup.transport(key).pid().unwrap();
    (key, pid)
}

fn with_far<T>(sup: &TestSupervisor, pid: u32, f: impl FnOnce(&mut FarEnds) -> T) -> T {
    let far = sup.engine().far.clone();
    let mut ends = far.borrow_mut();
    f(ends.get_mut(&pid).expect("spawned pid"))
}

fn emit(sup: &TestSupervisor, pid: u32, child_fd: i32, data: &[u8]) {
    with_far(sup, pid, |ends| {
        ends.outputs.get_mut(&child_fd).unwrap().write_all(data).unwrap()
    });
}

/// Simulates a successful exec: the status pipe closes without a record
fn confirm(sup: &TestSupervisor, pid: u32) {
    with_far(sup, pid, |ends| ends.status = None);
}

/// Simulates the child going away: every far end closes
fn vanish(sup: &TestSupervisor, pid: u32) {
    sup.engine().far.borrow_mut().remove(&pid);
}

fn exit(sup: &mut TestSupervisor, pid: u32, status: ExitStatus) {
    sup.engine_mut().exited.push_back((pid, status));
}

fn drive(sup: &mut TestSupervisor, key: ProcessKey) {
    for _ in 0..20 {
        if sup.transport(key).state() == HandleState::Ended {
            return;
        }
        sup.pump();
    }
}

#[test]
fn full_lifecycle_delivers_ended_last() {
    let mut sup = supervisor();
    let log = Log::default();
    let (key, pid) = spawn(&mut sup, &log);
    assert_eq!(log.entries(), vec!["established"]);

    emit(&sup, pid, 1, b"hello");
    emit(&sup, pid, 2, b"oops");
    confirm(&sup, pid);
    sup.pump();
    assert_eq!(
        log.entries(),
        vec!["established", "data 1 hello", "data 2 oops"]
    );

    vanish(&sup, pid);
    exit(&mut sup, pid, ExitStatus::Exited(0));
    drive(&mut sup, key);

    let status = ExitStatus::Exited(0);
    assert_eq!(
        log.entries(),
        vec![
            "established".to_string(),
            "data 1 hello".to_string(),
            "data 2 oops".to_string(),
            "closed 0".to_string(),
            "closed 1".to_string(),
            "closed 2".to_string(),
            format!("exited {}", status),
            format!("ended {}", Termination::Exited(status)),
        ]
    );
    assert!(sup.is_empty());
    assert!(sup.registry().is_empty());
    assert!(matches!(
        sup.transport(key).write(b"gone"),
        Err(ProcessError::ProcessExitedAlready)
    ));
}

#[test]
fn exec_failure_reports_spawn_failed_only() {
    let mut sup = supervisor();
    let log = Log::default();
    let (key, pid) = spawn(&mut sup, &log);

    let failure = ChildFailure::new(ChildStage::Exec, libc::ENOENT);
    with_far(&sup, pid, |ends| {
        ends.status.as_mut().unwrap().write_all(&failure.encode()).unwrap()
    });
    vanish(&sup, pid);
    exit(&mut sup, pid, ExitStatus::Exited(127));
    drive(&mut sup, key);

    assert_eq!(
        log.entries(),
        vec![
            "established".to_string(),
            format!("ended {}", Termination::SpawnFailed(failure)),
        ]
    );
}

#[test]
fn malformed_status_record_counts_as_exec_failure() {
    let mut sup = supervisor();
    let log = Log::default();
    let (key, pid) = spawn(&mut sup, &log);

    with_far(&sup, pid, |ends| {
        ends.status.as_mut().unwrap().write_all(b"xyz").unwrap()
    });
    vanish(&sup, pid);
    exit(&mut sup, pid, ExitStatus::Exited(127));
    drive(&mut sup, key);

    let expected = ChildFailure::new(ChildStage::Exec, libc::EIO);
    assert_eq!(log.count("exited"), 0);
    assert_eq!(
        log.entries().last().unwrap(),
        &format!("ended {}", Termination::SpawnFailed(expected))
    );
}

#[test]
fn ended_waits_for_open_channels() {
    let mut sup = supervisor();
    let log = Log::default();
    let (key, pid) = spawn(&mut sup, &log);

    confirm(&sup, pid);
    exit(&mut sup, pid, ExitStatus::Exited(3));
    sup.pump();
    assert_eq!(
        sup.transport(key).state(),
        HandleState::Exited(ExitStatus::Exited(3))
    );
    assert_eq!(sup.transport(key).status(), Some(ExitStatus::Exited(3)));
    assert_eq!(log.count("exited"), 1);
    assert_eq!(log.count("ended"), 0);

    vanish(&sup, pid);
    drive(&mut sup, key);
    assert_eq!(log.count("exited"), 1);
    assert_eq!(log.count("ended"), 1);
    assert!(log.entries().last().unwrap().starts_with("ended"));
}

#[test]
fn signal_after_exit_is_rejected() {
    let mut sup = supervisor();
    let log = Log::default();
    let (key, pid) = spawn(&mut sup, &log);

    sup.transport(key).signal(SignalName::Term).unwrap();
    sup.transport(key).signal_named("SIGHUP").unwrap();
    assert_eq!(
        sup.engine().signals,
        vec![(pid, SignalName::Term), (pid, SignalName::Hup)]
    );

    exit(&mut sup, pid, ExitStatus::Signaled(libc::SIGTERM));
    sup.reap();
    assert!(matches!(
        sup.transport(key).signal(SignalName::Kill),
        Err(ProcessError::ProcessExitedAlready)
    ));
    assert!(matches!(
        sup.transport(key).signal_named("BOGUS"),
        Err(ProcessError::UnknownSignal(_))
    ));
}

#[test]
fn stdin_write_reaches_child_and_close_delivers_eof() {
    let mut sup = supervisor();
    let log = Log::default();
    let (key, pid) = spawn(&mut sup, &log);

    sup.transport(key).write(b"ping").unwrap();
    sup.pump();
    let mut received = [0u8; 4];
    with_far(&sup, pid, |ends| {
        ends.inputs.get_mut(&0).unwrap().read_exact(&mut received).unwrap()
    });
    assert_eq!(&received, b"ping");

    sup.transport(key).close_stdin().unwrap();
    let mut rest = Vec::new();
    with_far(&sup, pid, |ends| {
        ends.inputs.get_mut(&0).unwrap().read_to_end(&mut rest).unwrap()
    });
    assert!(rest.is_empty());
    // Held until the launch is confirmed
    assert_eq!(log.count("closed"), 0);

    confirm(&sup, pid);
    sup.pump();
    assert_eq!(log.entries(), vec!["established", "closed 0"]);

    // Writes after close are dropped silently
    sup.transport(key).write(b"late").unwrap();
}

#[test]
fn closures_are_immediate_without_status_pipe() {
    let mut engine = ScriptedEngine::new();
    engine.status_pipe = false;
    let mut sup = Supervisor::new(engine, Interests::new());
    let log = Log::default();
    let (key, _) = spawn(&mut sup, &log);

    sup.transport(key).close_stdout().unwrap();
    assert_eq!(log.entries(), vec!["established", "closed 1"]);
}

#[test]
fn unknown_channels_are_rejected() {
    let mut sup = supervisor();
    let log = Log::default();
    let (key, _) = spawn(&mut sup, &log);
    let mut transport = sup.transport(key);

    assert!(matches!(
        transport.write_to_child(7, b"x"),
        Err(ProcessError::UnknownChannel(7))
    ));
    assert!(matches!(
        transport.write_to_child(1, b"x"),
        Err(ProcessError::UnknownChannel(1))
    ));
    assert!(matches!(
        transport.close_child_fd(9),
        Err(ProcessError::UnknownChannel(9))
    ));
}

#[test]
fn one_reap_sweep_finishes_two_children() {
    let mut sup = supervisor();
    let first_log = Log::default();
    let second_log = Log::default();
    let (_, first) = spawn(&mut sup, &first_log);
    let (_, second) = spawn(&mut sup, &second_log);

    for pid in [first, second] {
        vanish(&sup, pid);
    }
    for _ in 0..3 {
        sup.pump();
    }
    assert_eq!(sup.len(), 2);

    exit(&mut sup, first, ExitStatus::Exited(0));
    exit(&mut sup, second, ExitStatus::Exited(1));
    sup.reap();

    assert!(sup.is_empty());
    assert_eq!(first_log.count("ended"), 1);
    assert_eq!(second_log.count("ended"), 1);
    assert!(
        second_log
            .entries()
            .contains(&format!("exited {}", ExitStatus::Exited(1)))
    );
}

#[test]
fn engine_errors_leave_no_handle() {
    let mut engine = ScriptedEngine::new();
    engine.fail_spawn = true;
    let mut sup = Supervisor::new(engine, Interests::new());
    let log = Log::default();

    let result = sup.spawn(&request(), Recorder::boxed(&log));
    assert!(matches!(result, Err(ProcessError::Spawn(_))));
    assert!(sup.is_empty());
    assert!(log.entries().is_empty());
}

#[test]
fn invalid_requests_never_reach_the_engine() {
    let mut sup = supervisor();
    let log = Log::default();
    let bad = SpawnRequest::builder("/bin/sh")
        .env("A=B", "c")
        .build_for(&procsup_core::BackendCapabilities::posix());
    assert!(bad.is_err());

    let unresolvable = SpawnRequest::builder("surely-not-a-real-program")
        .env("PATH", "/nonexistent")
        .build()
        .unwrap();
    let result = sup.spawn(&unresolvable, Recorder::boxed(&log));
    assert!(matches!(result, Err(ProcessError::ExecutableNotFound(_))));
    assert_eq!(sup.engine().next_pid, 100);
}

#[test]
fn paused_channels_are_not_read() {
    let mut sup = supervisor();
    let log = Log::default();
    let (key, pid) = spawn(&mut sup, &log);
    confirm(&sup, pid);

    sup.transport(key).pause_reading();
    emit(&sup, pid, 1, b"later");
    sup.pump();
    assert_eq!(log.count("data"), 0);

    sup.transport(key).resume_reading();
    sup.pump();
    assert_eq!(log.count("data 1 later"), 1);
}

#[test]
fn lose_connection_closes_every_channel() {
    let mut sup = supervisor();
    let log = Log::default();
    let (key, pid) = spawn(&mut sup, &log);
    confirm(&sup, pid);
    sup.pump();

    sup.transport(key).lose_connection();
    assert_eq!(
        log.entries(),
        vec!["established", "closed 0", "closed 1", "closed 2"]
    );

    exit(&mut sup, pid, ExitStatus::Exited(0));
    sup.reap();
    assert_eq!(log.count("ended"), 1);
}

#[test]
fn pty_refuses_half_close_and_retires_both_roles() {
    let mut sup = supervisor();
    let log = Log::default();
    let pty_request = SpawnRequest::builder("/bin/sh")
        .pty(PtyMode::Allocate)
        .build()
        .unwrap();
    let key = sup.spawn(&pty_request, Recorder::boxed(&log)).unwrap();
    let pid = sup.transport(key).pid().unwrap();

    assert!(matches!(
        sup.transport(key).close_stdin(),
        Err(ProcessError::PtyHalfClose)
    ));

    confirm(&sup, pid);
    emit(&sup, pid, 1, b"hi");
    sup.pump();
    assert_eq!(log.count("data 1 hi"), 1);

    vanish(&sup, pid);
    exit(&mut sup, pid, ExitStatus::Exited(0));
    drive(&mut sup, key);
    assert_eq!(log.count("closed 0"), 1);
    assert_eq!(log.count("closed 1"), 1);
    assert_eq!(log.count("ended"), 1);
}

#[test]
fn lose_connection_on_pty_drops_unwritten_input() {
    let mut sup = supervisor();
    let log = Log::default();
    let pty_request = SpawnRequest::builder("/bin/sh")
        .pty(PtyMode::Allocate)
        .build()
        .unwrap();
    let key = sup.spawn(&pty_request, Recorder::boxed(&log)).unwrap();
    let pid = sup.transport(key).pid().unwrap();
    confirm(&sup, pid);
    sup.pump();

    // Nobody reads the slave, so the terminal buffer fills long before this drains
    sup.transport(key).write(&vec![b'x'; 1 << 20]).unwrap();
    sup.pump();
    sup.transport(key).lose_connection();
    assert_eq!(log.count("closed 0"), 1);
    assert_eq!(log.count("closed 1"), 1);
    assert_eq!(sup.reactor().writable().count(), 0);

    exit(&mut sup, pid, ExitStatus::Exited(0));
    sup.reap();
    assert_eq!(log.count("ended"), 1);
}

struct Replier {
    log: Log,
}

impl ProcessProtocol for Replier {
    fn data_received(&mut self, transport: &mut Transport<'_>, child_fd: i32, data: &[u8]) {
        self.log.push(format!("data {}", child_fd));
        // Re-enters the supervisor from inside a callback
        transport.write(data).unwrap();
        transport.close_stdin().unwrap();
        self.log.push("replied".to_string());
    }

    fn child_channel_closed(&mut self, _transport: &mut Transport<'_>, child_fd: i32) {
        self.log.push(format!("closed {}", child_fd));
    }
}

#[test]
fn callbacks_are_not_reentrant() {
    let mut engine = ScriptedEngine::new();
    engine.status_pipe = false;
    let mut sup = Supervisor::new(engine, Interests::new());
    let log = Log::default();
    let key = sup
        .spawn_with(&request(), Replier { log: log.clone() })
        .unwrap();
    let pid = sup.transport(key).pid().unwrap();

    emit(&sup, pid, 1, b"echo");
    sup.pump();
    sup.pump();
    assert_eq!(log.entries(), vec!["data 1", "replied", "closed 0"]);

    let mut received = Vec::new();
    with_far(&sup, pid, |ends| {
        ends.inputs.get_mut(&0).unwrap().read_to_end(&mut received).unwrap()
    });
    assert_eq!(received, b"echo");
}
