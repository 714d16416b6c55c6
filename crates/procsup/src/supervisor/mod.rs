//! Supervision of spawned processes
//!
//! The [`Supervisor`] ties a spawn engine, a reactor and the registry
//! together. It owns every channel, turns readiness into protocol callbacks
//! and drives each handle to its single `process_ended` delivery.
//!
//! # Handle lifecycle
//!
//! - **Launch pending**: the exec-status pipe has not reported yet. Channel
//!   closures are held back because the program may never have run.
//! - **Launch confirmed**: the status pipe hit EOF without data (or the
//!   engine has no status pipe). Held closures are released.
//! - **Launch failed**: the child sent a failure record. Its channels are
//!   dropped without callbacks.
//! - **Exited**: the status was collected. `process_exited` fires for
//!   confirmed launches.
//! - **Ended**: status collected, every channel closed and the launch
//!   resolved. `process_ended` fires once and the handle is removed.
//!
//! Callbacks never run re-entrantly. Events raised while a callback is
//! running (a `close_stdin` from inside `data_received`, say) are queued and
//! delivered after it returns.

mod handle;

pub use handle::{Control, HandleState, ProcessKey, ProcessProtocol, Transport};

use log::{debug, warn};
use procsup_core::{
    ChildFailure, ChildStage, ExitStatus, ProcessError, Result, SignalName, Termination,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::channel::{
    Channel, FlushOutcome, PTY_INPUT_FD, PTY_OUTPUT_FD, ReadChannel, ReadOutcome,
};
use crate::config::SupervisorConfig;
use crate::engine::{Launch, LaunchedChannel, SpawnEngine};
use crate::reactor::{Reactor, Token};
use crate::registry::Registry;
use crate::request::SpawnRequest;
use crate::resolve::resolve_executable;

#[cfg(unix)]
use crate::sigchld::ChildWatcher;

/// Reserved for the child-death notification source
pub const WATCHER_TOKEN: Token = Token(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchState {
    Pending,
    Confirmed,
    Failed(ChildFailure),
}

#[derive(Debug)]
enum Event {
    Established,
    Data(i32, Vec<u8>),
    ChannelClosed(i32),
    Exited(ExitStatus),
    Ended(Termination),
}

struct ProcessHandle {
    pid: u32,
    protocol: Option<Box<dyn ProcessProtocol>>,
    launch: LaunchState,
    status: Option<ExitStatus>,
    exit_reported: bool,
    end_queued: bool,
    pty: bool,
    /// Child fd to channel token; both pty roles share one token
    fds: BTreeMap<i32, Token>,
    /// Channel tokens not yet closed
    open: BTreeSet<Token>,
    status_token: Option<Token>,
    held_closures: Vec<i32>,
}

impl ProcessHandle {
    fn new(pid: u32, protocol: Box<dyn ProcessProtocol>) -> Self {
        Self {
            pid,
            protocol: Some(protocol),
            launch: LaunchState::Pending,
            status: None,
            exit_reported: false,
            end_queued: false,
            pty: false,
            fds: BTreeMap::new(),
            open: BTreeSet::new(),
            status_token: None,
            held_closures: Vec::new(),
        }
    }
}

enum SlotKind {
    Io { child_fd: i32, channel: Channel },
    Status { pipe: ReadChannel, received: Vec<u8> },
}

struct Slot {
    key: ProcessKey,
    kind: SlotKind,
}

/// What a readiness callback decided while the slot was borrowed
enum Step {
    Idle,
    Data(i32, Vec<u8>),
    Drained,
    Closed,
    PtyRetired(Vec<i32>),
    Resolve(Vec<u8>),
}

pub struct Supervisor<E, R> {
    engine: E,
    reactor: R,
    config: SupervisorConfig,
    registry: Registry,
    handles: HashMap<ProcessKey, ProcessHandle>,
    slots: BTreeMap<Token, Slot>,
    events: VecDeque<(ProcessKey, Event)>,
    dispatching: bool,
    next_token: usize,
    next_key: u64,
    #[cfg(unix)]
    watcher: Option<ChildWatcher>,
    scratch: Vec<u8>,
}

impl<E: SpawnEngine, R: Reactor> Supervisor<E, R> {
    pub fn new(engine: E, reactor: R) -> Self {
        Self::assemble(engine, reactor, SupervisorConfig::default())
    }

    pub fn with_config(engine: E, reactor: R, config: SupervisorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(engine, reactor, config))
    }

    fn assemble(engine: E, reactor: R, config: SupervisorConfig) -> Self {
        let scratch = vec![0u8; config.read_chunk_size];
        Self {
            engine,
            reactor,
            config,
            registry: Registry::new(),
            handles: HashMap::new(),
            slots: BTreeMap::new(),
            events: VecDeque::new(),
            dispatching: false,
            next_token: WATCHER_TOKEN.0 + 1,
            next_key: 1,
            #[cfg(unix)]
            watcher: None,
            scratch,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn reactor(&self) -> &R {
        &self.reactor
    }

    pub fn reactor_mut(&mut self) -> &mut R {
        &mut self.reactor
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Handles that have not ended yet
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn keys(&self) -> Vec<ProcessKey> {
        let mut keys: Vec<ProcessKey> = self.handles.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Route child-death notifications through the reactor
    #[cfg(unix)]
    pub fn attach_watcher(&mut self, watcher: ChildWatcher) {
        self.reactor.register_readable(WATCHER_TOKEN, watcher.fd());
        self.watcher = Some(watcher);
    }

    #[cfg(unix)]
    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    #[cfg(not(unix))]
    pub fn is_watching(&self) -> bool {
        false
    }

    /// Launch a process and attach `protocol` to it.
    ///
    /// Errors mean no process was created. A program that cannot be
    /// executed after the fork is reported through
    /// [`ProcessProtocol::process_ended`] as [`Termination::SpawnFailed`].
    pub fn spawn(
        &mut self,
        request: &SpawnRequest,
        protocol: Box<dyn ProcessProtocol>,
    ) -> Result<ProcessKey> {
        request.validate(&self.engine.capabilities())?;
        let executable = resolve_executable(request, &self.config.default_path)?;
        let env = request.effective_env();
        let launched = self.engine.spawn(&Launch {
            request,
            executable: &executable,
            env: &env,
        })?;

        let key = ProcessKey(self.next_key);
        self.next_key += 1;
        let pid = launched.pid;
        self.registry.insert(pid, key);

        let mut handle = ProcessHandle::new(pid, protocol);
        for LaunchedChannel { child_fd, channel } in launched.channels {
            let token = self.allocate_token();
            if let Some(source) = channel.source() {
                self.reactor.register_readable(token, source);
            }
            if channel.is_pty() {
                handle.pty = true;
                handle.fds.insert(PTY_INPUT_FD, token);
                handle.fds.insert(PTY_OUTPUT_FD, token);
            } else {
                handle.fds.insert(child_fd, token);
            }
            handle.open.insert(token);
            self.slots.insert(
                token,
                Slot {
                    key,
                    kind: SlotKind::Io { child_fd, channel },
                },
            );
        }

        match launched.status_pipe {
            Some(endpoint) => {
                let token = self.allocate_token();
                self.reactor.register_readable(token, endpoint.source());
                handle.status_token = Some(token);
                self.slots.insert(
                    token,
                    Slot {
                        key,
                        kind: SlotKind::Status {
                            pipe: ReadChannel::new(endpoint),
                            received: Vec::new(),
                        },
                    },
                );
            }
            None => handle.launch = LaunchState::Confirmed,
        }

        debug!("Handle {} supervises pid {}", key, pid);
        self.handles.insert(key, handle);
        self.events.push_back((key, Event::Established));

        // The child may already be gone if no notification source is attached
        if let Some((key, status)) = self.registry.collect_one(pid, &mut self.engine) {
            self.record_status(key, status);
        }
        self.dispatch();
        Ok(key)
    }

    /// [`Supervisor::spawn`] for an unboxed protocol
    pub fn spawn_with<P>(&mut self, request: &SpawnRequest, protocol: P) -> Result<ProcessKey>
    where
        P: ProcessProtocol + 'static,
    {
        self.spawn(request, Box::new(protocol))
    }

    /// Drive a process from outside its protocol
    pub fn transport(&mut self, key: ProcessKey) -> Transport<'_> {
        Transport::new(self, key)
    }

    /// The reactor reported `token` readable
    pub fn on_readable(&mut self, token: Token) {
        if token == WATCHER_TOKEN {
            self.drain_watcher();
            self.reap();
            return;
        }

        let Some(slot) = self.slots.get_mut(&token) else {
            return;
        };
        let key = slot.key;
        let step = match &mut slot.kind {
            SlotKind::Status { pipe, received } => match pipe.read_once(&mut self.scratch) {
                ReadOutcome::Data(n) => {
                    received.extend_from_slice(&self.scratch[..n]);
                    if received.len() >= ChildFailure::RECORD_LEN {
                        Step::Resolve(std::mem::take(received))
                    } else {
                        Step::Idle
                    }
                }
                ReadOutcome::Pending => Step::Idle,
                ReadOutcome::Closed => Step::Resolve(std::mem::take(received)),
            },
            SlotKind::Io { child_fd, channel } => match channel {
                Channel::Reader(reader) => match reader.read_once(&mut self.scratch) {
                    ReadOutcome::Data(n) => Step::Data(*child_fd, self.scratch[..n].to_vec()),
                    ReadOutcome::Pending => Step::Idle,
                    ReadOutcome::Closed => Step::Closed,
                },
                Channel::Writer(writer) => {
                    if writer.peer_closed() {
                        writer.close();
                        Step::Closed
                    } else {
                        Step::Idle
                    }
                }
                Channel::Pty(pty) => match pty.read_once(&mut self.scratch) {
                    ReadOutcome::Data(n) => Step::Data(PTY_OUTPUT_FD, self.scratch[..n].to_vec()),
                    ReadOutcome::Pending => Step::Idle,
                    ReadOutcome::Closed => Step::PtyRetired(pty.retire_all()),
                },
            },
        };

        self.apply(key, token, step);
        self.dispatch();
    }

    /// The reactor reported `token` writable
    pub fn on_writable(&mut self, token: Token) {
        let Some(slot) = self.slots.get_mut(&token) else {
            return;
        };
        let key = slot.key;
        let step = match &mut slot.kind {
            SlotKind::Io {
                channel: Channel::Writer(writer),
                ..
            } => match writer.flush() {
                FlushOutcome::Drained => Step::Drained,
                FlushOutcome::Pending => Step::Idle,
                FlushOutcome::Closed => Step::Closed,
            },
            SlotKind::Io {
                channel: Channel::Pty(pty),
                ..
            } => match pty.flush() {
                FlushOutcome::Drained => Step::Drained,
                FlushOutcome::Pending => Step::Idle,
                FlushOutcome::Closed => {
                    let mut retired = Vec::new();
                    if pty.retire_writer() {
                        retired.push(PTY_INPUT_FD);
                    }
                    Step::PtyRetired(retired)
                }
            },
            _ => Step::Drained,
        };

        self.apply(key, token, step);
        self.dispatch();
    }

    /// Run one reap sweep and deliver what it found
    pub fn reap(&mut self) {
        for (key, status) in self.registry.sweep(&mut self.engine) {
            self.record_status(key, status);
        }
        self.dispatch();
    }

    /// Treat every channel as ready once, then reap. For loops without
    /// readiness notification and for tests.
    pub fn pump(&mut self) {
        let tokens: Vec<Token> = self.slots.keys().copied().collect();
        for token in tokens {
            self.on_readable(token);
            if self.wants_write(token) {
                self.on_writable(token);
            }
        }
        self.reap();
    }

    fn wants_write(&self, token: Token) -> bool {
        match self.slots.get(&token).map(|slot| &slot.kind) {
            Some(SlotKind::Io {
                channel: Channel::Writer(writer),
                ..
            }) => writer.wants_write(),
            Some(SlotKind::Io {
                channel: Channel::Pty(pty),
                ..
            }) => pty.wants_write(),
            _ => false,
        }
    }

    #[cfg(unix)]
    fn drain_watcher(&self) {
        if let Some(watcher) = &self.watcher {
            watcher.drain();
        }
    }

    #[cfg(not(unix))]
    fn drain_watcher(&self) {}

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn apply(&mut self, key: ProcessKey, token: Token, step: Step) {
        match step {
            Step::Idle => {}
            Step::Data(child_fd, bytes) => {
                self.events.push_back((key, Event::Data(child_fd, bytes)));
            }
            Step::Drained => self.reactor.unregister_writable(token),
            Step::Closed => self.finish_channel(token),
            Step::PtyRetired(fds) => self.pty_roles_retired(token, fds),
            Step::Resolve(record) => {
                self.slots.remove(&token);
                self.reactor.unregister(token);
                self.resolve_launch(key, &record);
            }
        }
    }

    /// Drop a closed channel and announce it
    fn finish_channel(&mut self, token: Token) {
        let Some(slot) = self.slots.remove(&token) else {
            return;
        };
        self.reactor.unregister(token);
        if let SlotKind::Io { child_fd, .. } = slot.kind {
            self.channel_closed(slot.key, Some(token), &[child_fd]);
        }
    }

    fn pty_roles_retired(&mut self, token: Token, fds: Vec<i32>) {
        let Some(slot) = self.slots.get(&token) else {
            return;
        };
        let key = slot.key;
        let retired = matches!(
            &slot.kind,
            SlotKind::Io { channel: Channel::Pty(pty), .. } if pty.is_retired()
        );
        let released = if retired {
            self.slots.remove(&token);
            self.reactor.unregister(token);
            Some(token)
        } else {
            self.reactor.unregister_writable(token);
            None
        };
        self.channel_closed(key, released, &fds);
    }

    fn channel_closed(&mut self, key: ProcessKey, token: Option<Token>, fds: &[i32]) {
        let Some(handle) = self.handles.get_mut(&key) else {
            return;
        };
        if let Some(token) = token {
            handle.open.remove(&token);
        }
        for &fd in fds {
            match handle.launch {
                LaunchState::Pending => handle.held_closures.push(fd),
                LaunchState::Confirmed => self.events.push_back((key, Event::ChannelClosed(fd))),
                LaunchState::Failed(_) => {}
            }
        }
        self.advance(key);
    }

    fn resolve_launch(&mut self, key: ProcessKey, record: &[u8]) {
        let launch = if record.is_empty() {
            LaunchState::Confirmed
        } else {
            let failure = ChildFailure::decode(record).unwrap_or_else(|| {
                warn!("Malformed exec status record ({} bytes)", record.len());
                ChildFailure::new(ChildStage::Exec, libc::EIO)
            });
            LaunchState::Failed(failure)
        };

        let Some(handle) = self.handles.get_mut(&key) else {
            return;
        };
        handle.launch = launch;
        handle.status_token = None;
        match launch {
            LaunchState::Confirmed => {
                debug!("pid {} exec confirmed", handle.pid);
                for fd in handle.held_closures.drain(..) {
                    self.events.push_back((key, Event::ChannelClosed(fd)));
                }
            }
            LaunchState::Failed(failure) => {
                warn!("pid {} never ran its program: {}", handle.pid, failure);
                handle.held_closures.clear();
                for token in std::mem::take(&mut handle.open) {
                    self.slots.remove(&token);
                    self.reactor.unregister(token);
                }
            }
            LaunchState::Pending => {}
        }
        self.advance(key);
    }

    fn record_status(&mut self, key: ProcessKey, status: ExitStatus) {
        if let Some(handle) = self.handles.get_mut(&key) {
            handle.status = Some(status);
            self.advance(key);
        }
    }

    /// Queue whatever lifecycle events the handle's state now allows
    fn advance(&mut self, key: ProcessKey) {
        let Some(handle) = self.handles.get_mut(&key) else {
            return;
        };
        let Some(status) = handle.status else {
            return;
        };

        if handle.launch == LaunchState::Confirmed && !handle.exit_reported {
            handle.exit_reported = true;
            self.events.push_back((key, Event::Exited(status)));
        }

        if handle.end_queued || !handle.open.is_empty() || handle.status_token.is_some() {
            return;
        }
        let termination = match handle.launch {
            LaunchState::Confirmed => Termination::Exited(status),
            LaunchState::Failed(failure) => Termination::SpawnFailed(failure),
            LaunchState::Pending => return,
        };
        handle.end_queued = true;
        self.events.push_back((key, Event::Ended(termination)));
    }

    fn dispatch(&mut self) {
        if self.dispatching {
            return;
        }
        self.dispatching = true;
        while let Some((key, event)) = self.events.pop_front() {
            self.deliver(key, event);
        }
        self.dispatching = false;
    }

    fn deliver(&mut self, key: ProcessKey, event: Event) {
        let Some(mut protocol) = self
            .handles
            .get_mut(&key)
            .and_then(|handle| handle.protocol.take())
        else {
            return;
        };

        let ended = matches!(event, Event::Ended(_));
        {
            let mut transport = Transport::new(self, key);
            match event {
                Event::Established => protocol.connection_established(&mut transport),
                Event::Data(child_fd, bytes) => {
                    protocol.data_received(&mut transport, child_fd, &bytes)
                }
                Event::ChannelClosed(child_fd) => {
                    protocol.child_channel_closed(&mut transport, child_fd)
                }
                Event::Exited(status) => protocol.process_exited(&mut transport, status),
                Event::Ended(termination) => protocol.process_ended(termination),
            }
        }

        if ended {
            self.handles.remove(&key);
            debug!("Handle {} ended", key);
        } else if let Some(handle) = self.handles.get_mut(&key) {
            handle.protocol = Some(protocol);
        }
    }

    fn open_slot(&mut self, key: ProcessKey, child_fd: i32) -> Result<Token> {
        let handle = self
            .handles
            .get(&key)
            .ok_or(ProcessError::ProcessExitedAlready)?;
        handle
            .fds
            .get(&child_fd)
            .copied()
            .ok_or(ProcessError::UnknownChannel(child_fd))
    }
}

impl<E: SpawnEngine, R: Reactor> Control for Supervisor<E, R> {
    fn write(&mut self, key: ProcessKey, child_fd: i32, data: &[u8]) -> Result<()> {
        let token = self.open_slot(key, child_fd)?;
        // A channel that already closed drops the data
        let Some(slot) = self.slots.get_mut(&token) else {
            return Ok(());
        };
        let source = match &mut slot.kind {
            SlotKind::Io {
                channel: Channel::Writer(writer),
                ..
            } => writer.queue(data).then(|| writer.source()).flatten(),
            SlotKind::Io {
                channel: Channel::Pty(pty),
                ..
            } if child_fd == PTY_INPUT_FD => pty.queue(data).then(|| pty.source()).flatten(),
            _ => return Err(ProcessError::UnknownChannel(child_fd)),
        };
        if let Some(source) = source {
            self.reactor.register_writable(token, source);
        }
        Ok(())
    }

    fn close_child_fd(&mut self, key: ProcessKey, child_fd: i32) -> Result<()> {
        if self.handles.get(&key).is_some_and(|handle| handle.pty) {
            return Err(ProcessError::PtyHalfClose);
        }
        let token = self.open_slot(key, child_fd)?;
        let Some(slot) = self.slots.get_mut(&token) else {
            return Ok(());
        };
        let closed_now = match &mut slot.kind {
            SlotKind::Io {
                channel: Channel::Writer(writer),
                ..
            } => writer.request_close(),
            SlotKind::Io {
                channel: Channel::Reader(reader),
                ..
            } => {
                reader.close();
                true
            }
            _ => false,
        };
        if closed_now {
            self.finish_channel(token);
        }
        self.dispatch();
        Ok(())
    }

    fn lose_connection(&mut self, key: ProcessKey) {
        let Some(handle) = self.handles.get(&key) else {
            return;
        };
        let tokens: Vec<Token> = handle.open.iter().copied().collect();
        for token in tokens {
            let Some(slot) = self.slots.get_mut(&token) else {
                continue;
            };
            let step = match &mut slot.kind {
                SlotKind::Io {
                    channel: Channel::Writer(writer),
                    ..
                } => {
                    if writer.request_close() {
                        Step::Closed
                    } else {
                        Step::Idle
                    }
                }
                SlotKind::Io {
                    channel: Channel::Reader(reader),
                    ..
                } => {
                    reader.close();
                    Step::Closed
                }
                SlotKind::Io {
                    channel: Channel::Pty(pty),
                    ..
                } => {
                    // Best effort for input still buffered
                    let outcome = pty.flush();
                    if outcome != FlushOutcome::Drained {
                        debug!("{:?}: pty input left unwritten on close ({:?})", key, outcome);
                    }
                    Step::PtyRetired(pty.retire_all())
                }
                SlotKind::Status { .. } => Step::Idle,
            };
            self.apply(key, token, step);
        }
        self.dispatch();
    }

    fn pause_reading(&mut self, key: ProcessKey) {
        let Some(handle) = self.handles.get(&key) else {
            return;
        };
        for token in &handle.open {
            let paused = match self.slots.get_mut(token).map(|slot| &mut slot.kind) {
                Some(SlotKind::Io {
                    channel: Channel::Reader(reader),
                    ..
                }) => reader.pause(),
                Some(SlotKind::Io {
                    channel: Channel::Pty(pty),
                    ..
                }) => pty.pause(),
                _ => false,
            };
            if paused {
                self.reactor.unregister_readable(*token);
            }
        }
    }

    fn resume_reading(&mut self, key: ProcessKey) {
        let Some(handle) = self.handles.get(&key) else {
            return;
        };
        for token in &handle.open {
            let source = match self.slots.get_mut(token).map(|slot| &mut slot.kind) {
                Some(SlotKind::Io {
                    channel: Channel::Reader(reader),
                    ..
                }) => reader.resume().then(|| reader.source()).flatten(),
                Some(SlotKind::Io {
                    channel: Channel::Pty(pty),
                    ..
                }) => pty.resume().then(|| pty.source()).flatten(),
                _ => None,
            };
            if let Some(source) = source {
                self.reactor.register_readable(*token, source);
            }
        }
    }

    fn signal(&mut self, key: ProcessKey, signal: SignalName) -> Result<()> {
        let pid = match self.handles.get(&key) {
            Some(handle) if handle.status.is_none() => handle.pid,
            _ => return Err(ProcessError::ProcessExitedAlready),
        };
        self.engine.signal(pid, signal)
    }

    fn pid(&self, key: ProcessKey) -> Option<u32> {
        self.handles.get(&key).map(|handle| handle.pid)
    }

    fn state(&self, key: ProcessKey) -> HandleState {
        match self.handles.get(&key) {
            None => HandleState::Ended,
            Some(handle) => match handle.status {
                Some(status) => HandleState::Exited(status),
                None => HandleState::Running,
            },
        }
    }
}

#[cfg(unix)]
impl<E: SpawnEngine> Supervisor<E, crate::reactor::PollReactor> {
    /// Wait once for readiness and dispatch it; returns the number of ready
    /// tokens.
    ///
    /// Without an attached watcher every turn ends with a reap sweep and
    /// the wait is capped so exits are noticed.
    pub fn turn(&mut self, timeout: Option<std::time::Duration>) -> Result<usize> {
        let timeout = match self.watcher {
            Some(_) => timeout,
            None => Some(timeout.map_or(UNWATCHED_POLL, |t| t.min(UNWATCHED_POLL))),
        };
        let ready = self.reactor.wait(timeout)?;
        for readiness in &ready {
            if readiness.readable {
                self.on_readable(readiness.token);
            }
            if readiness.writable {
                self.on_writable(readiness.token);
            }
        }
        if self.watcher.is_none() {
            self.reap();
        }
        Ok(ready.len())
    }
}

#[cfg(unix)]
const UNWATCHED_POLL: std::time::Duration = std::time::Duration::from_millis(50);

#[cfg(all(test, unix))]
mod tests;
