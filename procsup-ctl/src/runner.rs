use console::style;
use log::{debug, info, warn};
use procsup::{
    Collected, Collector, DefaultEngine, ExitStatus, ProcessError, ProcessKey, ProcessProtocol,
    PtyMode, SignalName, SpawnRequest, Supervisor, Termination, Transport, default_engine,
};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::Write;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::cli::RunArgs;

/// Upper bound of one loop turn, so deadlines are checked regularly
const TICK: Duration = Duration::from_millis(100);

#[cfg(unix)]
type Loop = Supervisor<DefaultEngine, procsup::PollReactor>;
#[cfg(windows)]
type Loop = Supervisor<DefaultEngine, procsup::Interests>;

#[cfg(unix)]
fn new_loop() -> procsup::Result<Loop> {
    let mut supervisor = Supervisor::new(default_engine(), procsup::PollReactor::new());
    supervisor.attach_watcher(procsup::ChildWatcher::install()?);
    Ok(supervisor)
}

#[cfg(windows)]
fn new_loop() -> procsup::Result<Loop> {
    Ok(Supervisor::new(default_engine(), procsup::Interests::new()))
}

#[cfg(unix)]
fn tick(supervisor: &mut Loop) -> procsup::Result<()> {
    supervisor.turn(Some(TICK))?;
    Ok(())
}

// Anonymous pipes cannot be polled here; pump on a short interval instead
#[cfg(windows)]
fn tick(supervisor: &mut Loop) -> procsup::Result<()> {
    supervisor.pump();
    std::thread::sleep(Duration::from_millis(10));
    Ok(())
}

/// Relays child output to our own stdout/stderr as it arrives
struct Relay {
    input: Option<Vec<u8>>,
    pty: bool,
    outcome: Rc<RefCell<Option<Termination>>>,
}

impl ProcessProtocol for Relay {
    fn connection_established(&mut self, transport: &mut Transport<'_>) {
        if let Some(input) = self.input.take()
            && let Err(e) = transport.write(&input)
        {
            warn!("Could not queue input: {}", e);
        }
        // A pty has no separate stdin to close
        if !self.pty
            && let Err(e) = transport.close_stdin()
        {
            debug!("stdin left open: {}", e);
        }
    }

    fn data_received(&mut self, _transport: &mut Transport<'_>, child_fd: i32, data: &[u8]) {
        let written = if child_fd == 2 {
            let mut err = std::io::stderr();
            err.write_all(data).and_then(|_| err.flush())
        } else {
            let mut out = std::io::stdout();
            out.write_all(data).and_then(|_| out.flush())
        };
        if let Err(e) = written {
            debug!("Dropping output of child fd {}: {}", child_fd, e);
        }
    }

    fn child_channel_closed(&mut self, _transport: &mut Transport<'_>, child_fd: i32) {
        debug!("Child fd {} closed", child_fd);
    }

    fn process_exited(&mut self, transport: &mut Transport<'_>, status: ExitStatus) {
        info!("pid {:?} {}", transport.pid(), status);
    }

    fn process_ended(&mut self, termination: Termination) {
        *self.outcome.borrow_mut() = Some(termination);
    }
}

/// Timeout policy: TERM at the deadline, KILL after the grace period
#[derive(Debug)]
struct Deadline {
    term_at: Instant,
    grace: Duration,
    kill_at: Option<Instant>,
    killed: bool,
}

impl Deadline {
    fn new(timeout: Duration, grace: Duration) -> Self {
        Self {
            term_at: Instant::now() + timeout,
            grace,
            kill_at: None,
            killed: false,
        }
    }

    fn fired(&self) -> bool {
        self.kill_at.is_some()
    }

    /// Signal to send now, if any
    fn due(&mut self, now: Instant) -> Option<SignalName> {
        match self.kill_at {
            None if now >= self.term_at => {
                self.kill_at = Some(now + self.grace);
                Some(SignalName::Term)
            }
            Some(kill_at) if !self.killed && now >= kill_at => {
                self.killed = true;
                Some(SignalName::Kill)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct Report {
    program: String,
    pid: Option<u32>,
    termination: Termination,
    exit_code: i32,
    timed_out: bool,
    wall_time_ms: u128,
    outputs: BTreeMap<i32, String>,
}

fn build_request(args: &RunArgs) -> procsup::Result<SpawnRequest> {
    let Some((program, rest)) = args.command.split_first() else {
        return Err(ProcessError::InvalidRequest("no program given".to_string()));
    };
    let mut builder = SpawnRequest::builder(program)
        .args(rest)
        .inherit_env(!args.clear_env)
        .envs(args.env.iter().cloned());
    if let Some(cwd) = &args.cwd {
        builder = builder.cwd(cwd);
    }
    if let Some(uid) = args.uid {
        builder = builder.uid(uid);
    }
    if let Some(gid) = args.gid {
        builder = builder.gid(gid);
    }
    if args.pty {
        builder = builder.pty(PtyMode::Allocate);
    }
    builder.build()
}

fn exit_code(termination: &Termination) -> i32 {
    match termination {
        Termination::Exited(status) => status.shell_code(),
        Termination::SpawnFailed(failure) => failure.stage.exit_code(),
    }
}

/// Spawn, supervise until the end, report. Returns the exit code to use.
pub fn run(args: RunArgs) -> procsup::Result<i32> {
    let request = build_request(&args)?;
    let mut supervisor = new_loop()?;
    let started = Instant::now();
    let input = args.input.clone().map(String::into_bytes);

    let outcome = Rc::new(RefCell::new(None));
    let mut collected = None;
    let key = if args.json {
        let (collector, done) = Collector::new();
        let collector = match input {
            Some(input) => collector.with_input(input),
            None => collector,
        };
        collected = Some(done);
        supervisor.spawn_with(&request, collector)?
    } else {
        supervisor.spawn_with(
            &request,
            Relay {
                input,
                pty: args.pty,
                outcome: outcome.clone(),
            },
        )?
    };
    let pid = supervisor.transport(key).pid();
    info!("Supervising {} as pid {:?}", args.command[0], pid);

    let mut deadline = args
        .timeout
        .map(|secs| Deadline::new(Duration::from_secs(secs), Duration::from_secs(args.grace)));
    while !supervisor.is_empty() {
        tick(&mut supervisor)?;
        if let Some(deadline) = deadline.as_mut()
            && let Some(signal) = deadline.due(Instant::now())
        {
            send(&mut supervisor, key, signal);
        }
    }
    let timed_out = deadline.as_ref().is_some_and(Deadline::fired);
    let wall_time_ms = started.elapsed().as_millis();

    let (termination, outputs) = match collected {
        Some(mut done) => match done.try_recv() {
            Ok(Some(Collected {
                termination,
                outputs,
                ..
            })) => (termination, outputs),
            _ => return Err(ProcessError::Spawn("no result was reported".to_string())),
        },
        None => match outcome.borrow_mut().take() {
            Some(termination) => (termination, BTreeMap::new()),
            None => return Err(ProcessError::Spawn("no result was reported".to_string())),
        },
    };
    let code = exit_code(&termination);

    if args.json {
        let report = Report {
            program: args.command[0].clone(),
            pid,
            termination,
            exit_code: code,
            timed_out,
            wall_time_ms,
            outputs: outputs
                .into_iter()
                .map(|(fd, bytes)| (fd, String::from_utf8_lossy(&bytes).into_owned()))
                .collect(),
        };
        let text = serde_json::to_string_pretty(&report)
            .map_err(|e| ProcessError::InvalidRequest(format!("report: {}", e)))?;
        println!("{}", text);
    } else {
        print_status(&termination, code, wall_time_ms, timed_out);
    }
    Ok(code)
}

fn send(supervisor: &mut Loop, key: ProcessKey, signal: SignalName) {
    warn!("Timeout reached, sending {}", signal);
    match supervisor.transport(key).signal(signal) {
        Ok(()) | Err(ProcessError::ProcessExitedAlready) => {}
        Err(e) => warn!("Could not send {}: {}", signal, e),
    }
}

fn print_status(termination: &Termination, code: i32, wall_time_ms: u128, timed_out: bool) {
    let code_styled = if code == 0 {
        style(code).green().bold()
    } else {
        style(code).red().bold()
    };
    eprint!(
        "{}={} | {}={} | {}={}",
        style("exit_code").dim(),
        code_styled,
        style("outcome").dim(),
        style(termination).bold(),
        style("wall_time_ms").dim(),
        style(wall_time_ms).bold(),
    );
    if timed_out {
        eprint!(
            " | {}={}",
            style("timed_out").red(),
            style("true").red().bold()
        );
    }
    eprintln!();
}
