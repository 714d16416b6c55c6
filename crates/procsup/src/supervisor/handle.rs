//! Application-facing side of a supervised process

use procsup_core::{ExitStatus, Result, SignalName, Termination};
use serde::Serialize;
use std::fmt;

/// Stable identity of one supervised process. Never reused, unlike pids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProcessKey(pub u64);

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a process handle as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    /// No status collected yet
    Running,
    /// Status collected; some channels are still open
    Exited(ExitStatus),
    /// Final outcome delivered; the handle is gone
    Ended,
}

/// Callbacks for one supervised process.
///
/// Delivery order: `connection_established` first, then any interleaving of
/// `data_received` and `child_channel_closed`, `process_exited` once the
/// status is collected, and `process_ended` exactly once, last.
pub trait ProcessProtocol {
    fn connection_established(&mut self, _transport: &mut Transport<'_>) {}

    fn data_received(&mut self, _transport: &mut Transport<'_>, _child_fd: i32, _data: &[u8]) {}

    fn child_channel_closed(&mut self, _transport: &mut Transport<'_>, _child_fd: i32) {}

    /// The program ran and its status has been collected. Not called when
    /// the launch failed before exec.
    fn process_exited(&mut self, _transport: &mut Transport<'_>, _status: ExitStatus) {}

    /// Status collected and every channel closed
    fn process_ended(&mut self, _termination: Termination) {}
}

/// Operations a transport forwards to whoever owns the process
pub trait Control {
    fn write(&mut self, key: ProcessKey, child_fd: i32, data: &[u8]) -> Result<()>;
    fn close_child_fd(&mut self, key: ProcessKey, child_fd: i32) -> Result<()>;
    fn lose_connection(&mut self, key: ProcessKey);
    fn pause_reading(&mut self, key: ProcessKey);
    fn resume_reading(&mut self, key: ProcessKey);
    fn signal(&mut self, key: ProcessKey, signal: SignalName) -> Result<()>;
    fn pid(&self, key: ProcessKey) -> Option<u32>;
    fn state(&self, key: ProcessKey) -> HandleState;
}

/// Handle through which a protocol (or any caller) drives its process
pub struct Transport<'a> {
    control: &'a mut dyn Control,
    key: ProcessKey,
}

impl<'a> Transport<'a> {
    pub fn new(control: &'a mut dyn Control, key: ProcessKey) -> Self {
        Self { control, key }
    }

    pub fn key(&self) -> ProcessKey {
        self.key
    }

    /// OS pid while the handle exists
    pub fn pid(&self) -> Option<u32> {
        self.control.pid(self.key)
    }

    pub fn state(&self) -> HandleState {
        self.control.state(self.key)
    }

    /// Collected status, until the handle ends
    pub fn status(&self) -> Option<ExitStatus> {
        match self.state() {
            HandleState::Exited(status) => Some(status),
            HandleState::Running | HandleState::Ended => None,
        }
    }

    /// Queue bytes for the child's standard input
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.control.write(self.key, 0, data)
    }

    /// Queue bytes for an arbitrary child descriptor the parent writes
    pub fn write_to_child(&mut self, child_fd: i32, data: &[u8]) -> Result<()> {
        self.control.write(self.key, child_fd, data)
    }

    pub fn write_sequence<I, B>(&mut self, chunks: I) -> Result<()>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        for chunk in chunks {
            self.write(chunk.as_ref())?;
        }
        Ok(())
    }

    pub fn close_stdin(&mut self) -> Result<()> {
        self.close_child_fd(0)
    }

    pub fn close_stdout(&mut self) -> Result<()> {
        self.close_child_fd(1)
    }

    pub fn close_stderr(&mut self) -> Result<()> {
        self.close_child_fd(2)
    }

    /// Close one child descriptor's channel. Fails with
    /// [`procsup_core::ProcessError::PtyHalfClose`] on a pseudo-terminal.
    pub fn close_child_fd(&mut self, child_fd: i32) -> Result<()> {
        self.control.close_child_fd(self.key, child_fd)
    }

    /// Close every channel; writers flush what is buffered first
    pub fn lose_connection(&mut self) {
        self.control.lose_connection(self.key)
    }

    pub fn pause_reading(&mut self) {
        self.control.pause_reading(self.key)
    }

    pub fn resume_reading(&mut self) {
        self.control.resume_reading(self.key)
    }

    /// Send a named signal; fails with
    /// [`procsup_core::ProcessError::ProcessExitedAlready`] once the status was collected
    pub fn signal(&mut self, signal: SignalName) -> Result<()> {
        self.control.signal(self.key, signal)
    }

    /// Parse and send a signal name such as `"TERM"` or `"SIGKILL"`
    pub fn signal_named(&mut self, name: &str) -> Result<()> {
        let signal: SignalName = name.parse()?;
        self.signal(signal)
    }
}

impl fmt::Debug for Transport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").field("key", &self.key).finish()
    }
}
