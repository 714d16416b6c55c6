//! Shared fixtures for unit tests

use nix::unistd::pipe;
use procsup_core::{BackendCapabilities, ExitStatus, ProcessError, Result, SignalName, Termination};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::File;
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::channel::{Channel, Endpoint, PTY_OUTPUT_FD, PtyChannel, ReadChannel, WriteChannel};
use crate::engine::{Launch, Launched, LaunchedChannel, SpawnEngine};
use crate::request::ChildFd;
use crate::supervisor::{ProcessProtocol, Transport};

pub fn serial_guard() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

/// The "child" ends of one scripted spawn, held by the test
#[derive(Debug, Default)]
pub struct FarEnds {
    /// Where the test reads what the parent wrote, by child fd
    pub inputs: BTreeMap<i32, File>,
    /// Where the test writes what the parent should read, by child fd
    pub outputs: BTreeMap<i32, File>,
    /// Write end of the exec-status pipe
    pub status: Option<File>,
}

impl FarEnds {
    /// Drop every end except the output for `keep`
    pub fn close_all_but(&mut self, keep: i32) {
        self.inputs.clear();
        self.outputs.retain(|fd, _| *fd == keep);
        self.status = None;
    }
}

pub type SharedFarEnds = Rc<RefCell<HashMap<u32, FarEnds>>>;

/// Engine that wires channels to pipes (or a pty slave) the test holds
/// instead of forking
#[derive(Debug)]
pub struct ScriptedEngine {
    pub next_pid: u32,
    pub far: SharedFarEnds,
    pub exited: VecDeque<(u32, ExitStatus)>,
    pub signals: Vec<(u32, SignalName)>,
    pub status_pipe: bool,
    pub fail_spawn: bool,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            next_pid: 100,
            far: Rc::default(),
            exited: VecDeque::new(),
            signals: Vec::new(),
            status_pipe: true,
            fail_spawn: false,
        }
    }
}

impl SpawnEngine for ScriptedEngine {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::posix()
    }

    fn spawn(&mut self, launch: &Launch<'_>) -> Result<Launched> {
        if self.fail_spawn {
            return Err(ProcessError::Spawn("scripted failure".to_string()));
        }
        let mut far = FarEnds::default();
        let mut channels = Vec::new();
        if launch.request.pty().is_enabled() {
            let pair = nix::pty::openpty(None, None).map_err(std::io::Error::from)?;
            channels.push(LaunchedChannel {
                child_fd: PTY_OUTPUT_FD,
                channel: Channel::Pty(PtyChannel::new(Endpoint::new(pair.master)?)),
            });
            far.outputs.insert(PTY_OUTPUT_FD, File::from(pair.slave));
        }
        let wired = if launch.request.pty().is_enabled() {
            Vec::new()
        } else {
            launch.request.child_fd_map()
        };
        for (child_fd, disposition) in wired {
            match disposition {
                ChildFd::Read => {
                    let (read_end, write_end) = pipe().map_err(std::io::Error::from)?;
                    channels.push(LaunchedChannel {
                        child_fd,
                        channel: Channel::Reader(ReadChannel::new(Endpoint::new(read_end)?)),
                    });
                    far.outputs.insert(child_fd, File::from(write_end));
                }
                ChildFd::Write => {
                    let (read_end, write_end) = pipe().map_err(std::io::Error::from)?;
                    channels.push(LaunchedChannel {
                        child_fd,
                        channel: Channel::Writer(WriteChannel::new(Endpoint::new(write_end)?)),
                    });
                    far.inputs.insert(child_fd, File::from(read_end));
                }
                ChildFd::Inherit(_) | ChildFd::Discard => {}
            }
        }

        let status_pipe = if self.status_pipe {
            let (read_end, write_end) = pipe().map_err(std::io::Error::from)?;
            far.status = Some(File::from(write_end));
            Some(Endpoint::new(read_end)?)
        } else {
            None
        };

        let pid = self.next_pid;
        self.next_pid += 1;
        self.far.borrow_mut().insert(pid, far);
        Ok(Launched {
            pid,
            channels,
            status_pipe,
        })
    }

    fn signal(&mut self, pid: u32, signal: SignalName) -> Result<()> {
        self.signals.push((pid, signal));
        Ok(())
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        !self.exited.iter().any(|(p, _)| *p == pid)
    }

    fn reap_one(&mut self, pid: u32) -> Result<Option<ExitStatus>> {
        let position = self.exited.iter().position(|(p, _)| *p == pid);
        Ok(position
            .and_then(|index| self.exited.remove(index))
            .map(|(_, status)| status))
    }

    fn reap_any(&mut self) -> Result<Option<(u32, ExitStatus)>> {
        Ok(self.exited.pop_front())
    }
}

/// Callback log shared between a protocol and its test
#[derive(Debug, Clone, Default)]
pub struct Log(Rc<RefCell<Vec<String>>>);

impl Log {
    pub fn push(&self, entry: String) {
        self.0.borrow_mut().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0
            .borrow()
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .count()
    }
}

/// Protocol that writes every callback to a [`Log`]
#[derive(Debug)]
pub struct Recorder {
    pub log: Log,
}

impl Recorder {
    pub fn boxed(log: &Log) -> Box<dyn ProcessProtocol> {
        Box::new(Self { log: log.clone() })
    }
}

impl ProcessProtocol for Recorder {
    fn connection_established(&mut self, _transport: &mut Transport<'_>) {
        self.log.push("established".to_string());
    }

    fn data_received(&mut self, _transport: &mut Transport<'_>, child_fd: i32, data: &[u8]) {
        self.log
            .push(format!("data {} {}", child_fd, String::from_utf8_lossy(data)));
    }

    fn child_channel_closed(&mut self, _transport: &mut Transport<'_>, child_fd: i32) {
        self.log.push(format!("closed {}", child_fd));
    }

    fn process_exited(&mut self, _transport: &mut Transport<'_>, status: ExitStatus) {
        self.log.push(format!("exited {}", status));
    }

    fn process_ended(&mut self, termination: Termination) {
        self.log.push(format!("ended {}", termination));
    }
}
