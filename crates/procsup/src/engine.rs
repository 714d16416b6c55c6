//! Platform spawn engines
//!
//! A [`SpawnEngine`] turns a validated, resolved request into a running OS
//! process plus the parent ends of its channels. Everything above this seam
//! (registry, supervisor, protocol dispatch) is platform-neutral.

use procsup_core::{BackendCapabilities, ExitStatus, Result, SignalName};
use std::ffi::OsString;
use std::path::Path;

use crate::channel::{Channel, Endpoint};
use crate::request::SpawnRequest;

/// Everything an engine needs for one spawn
#[derive(Debug, Clone, Copy)]
pub struct Launch<'a> {
    pub request: &'a SpawnRequest,
    /// Resolved absolute or relative path of the executable
    pub executable: &'a Path,
    /// Final child environment
    pub env: &'a [(OsString, OsString)],
}

/// One parent-side channel and the child fd it serves
#[derive(Debug)]
pub struct LaunchedChannel {
    pub child_fd: i32,
    pub channel: Channel,
}

/// Result of a successful spawn
#[derive(Debug)]
pub struct Launched {
    pub pid: u32,
    pub channels: Vec<LaunchedChannel>,
    /// Read end of the exec-status pipe. EOF without data means the exec
    /// succeeded; a failure record means the child never ran the program.
    pub status_pipe: Option<Endpoint>,
}

pub trait SpawnEngine {
    fn capabilities(&self) -> BackendCapabilities;

    /// Create the process. Errors here mean no process exists.
    fn spawn(&mut self, launch: &Launch<'_>) -> Result<Launched>;

    fn signal(&mut self, pid: u32, signal: SignalName) -> Result<()>;

    fn is_alive(&mut self, pid: u32) -> bool;

    /// Collect the status of `pid` if it has exited, without blocking
    fn reap_one(&mut self, pid: u32) -> Result<Option<ExitStatus>>;

    /// Collect any exited child, without blocking. `None` when nothing is
    /// ready or there are no children left.
    fn reap_any(&mut self) -> Result<Option<(u32, ExitStatus)>>;
}

#[cfg(unix)]
pub type DefaultEngine = crate::posix::PosixEngine;
#[cfg(windows)]
pub type DefaultEngine = crate::windows::WindowsEngine;

/// Engine for the platform this crate was built for
pub fn default_engine() -> DefaultEngine {
    DefaultEngine::new()
}
