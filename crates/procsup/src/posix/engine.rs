//! fork/exec spawn engine

use log::{debug, info, warn};
use procsup_core::{
    BackendCapabilities, ExitStatus, IdentityPlan, ProcessError, Result, SignalName,
};
use std::ffi::{CString, OsStr};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;

use super::child::{CStringArray, ChildPlan, run_child, wiring_floor};
use super::sys::{Forked, PosixSys, RealSys, dup_cloexec};
use crate::channel::{Channel, Endpoint, PtyChannel, ReadChannel, WriteChannel};
use crate::engine::{Launch, Launched, LaunchedChannel, SpawnEngine};
use crate::request::{ChildFd, PtyMode};

/// Spawns children with `fork` and `execve`
#[derive(Debug, Default)]
pub struct PosixEngine<S: PosixSys = RealSys> {
    sys: S,
}

impl PosixEngine<RealSys> {
    pub fn new() -> Self {
        Self { sys: RealSys }
    }
}

impl<S: PosixSys> PosixEngine<S> {
    pub fn with_sys(sys: S) -> Self {
        Self { sys }
    }

    pub fn sys(&self) -> &S {
        &self.sys
    }

    pub fn sys_mut(&mut self) -> &mut S {
        &mut self.sys
    }

    /// Open every descriptor the child needs. Child ends are kept alive in
    /// `Plumbing` until the fork has happened.
    fn plumb(&mut self, launch: &Launch<'_>) -> Result<Plumbing> {
        let mut plumbing = Plumbing::default();
        match launch.request.pty() {
            PtyMode::Off => {
                let mut null: Option<RawFd> = None;
                for (target, disposition) in launch.request.child_fd_map() {
                    match disposition {
                        ChildFd::Read => {
                            let (read_end, write_end) = self.sys.pipe()?;
                            plumbing.channel(target, Channel::Reader(ReadChannel::new(
                                Endpoint::new(read_end)?,
                            )));
                            plumbing.child_end(write_end, target);
                        }
                        ChildFd::Write => {
                            let (read_end, write_end) = self.sys.pipe()?;
                            plumbing.channel(target, Channel::Writer(WriteChannel::new(
                                Endpoint::new(write_end)?,
                            )));
                            plumbing.child_end(read_end, target);
                        }
                        ChildFd::Inherit(source) => plumbing.wiring.push((source, target)),
                        ChildFd::Discard => {
                            let fd = match null {
                                Some(fd) => fd,
                                None => {
                                    let opened = self.sys.open_null()?;
                                    let fd = opened.as_raw_fd();
                                    plumbing.keep_alive.push(opened);
                                    null = Some(fd);
                                    fd
                                }
                            };
                            plumbing.wiring.push((fd, target));
                        }
                    }
                }
            }
            PtyMode::Allocate => {
                let (master, slave) = self.sys.openpty()?;
                plumbing.terminal(master, slave)?;
            }
            PtyMode::Existing { master, slave } => {
                let master = dup_cloexec(master, 0)?;
                let slave = dup_cloexec(slave, 0)?;
                plumbing.terminal(master, slave)?;
            }
        }
        Ok(plumbing)
    }

    fn plan(&mut self, launch: &Launch<'_>, plumbing: &Plumbing, error_fd: RawFd) -> Result<ChildPlan> {
        let program = c_string(launch.executable.as_os_str())?;
        let argv = launch
            .request
            .argv()
            .iter()
            .map(|arg| c_string(arg))
            .collect::<Result<Vec<_>>>()?;
        let envp = launch
            .env
            .iter()
            .map(|(key, value)| {
                let mut entry = key.as_bytes().to_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                CString::new(entry).map_err(|_| nul_error(key))
            })
            .collect::<Result<Vec<_>>>()?;
        let cwd = launch
            .request
            .cwd()
            .map(|dir| c_string(dir.as_os_str()))
            .transpose()?;
        let identity = IdentityPlan::resolve(
            launch.request.uid(),
            launch.request.gid(),
            self.sys.identity(),
        );
        let groups = match identity {
            IdentityPlan::Switch { uid, gid, .. } => self.sys.supplementary_groups(uid, gid),
            IdentityPlan::Unchanged => Vec::new(),
        };

        Ok(ChildPlan::new(
            program,
            CStringArray::new(argv),
            CStringArray::new(envp),
            cwd,
            plumbing.controlling_tty,
            identity,
            groups,
            plumbing.wiring.clone(),
            self.sys.open_fds(),
            error_fd,
        ))
    }
}

/// Descriptors prepared for one spawn
#[derive(Debug, Default)]
struct Plumbing {
    channels: Vec<LaunchedChannel>,
    keep_alive: Vec<OwnedFd>,
    wiring: Vec<(RawFd, RawFd)>,
    controlling_tty: Option<RawFd>,
}

impl Plumbing {
    fn channel(&mut self, child_fd: i32, channel: Channel) {
        self.channels.push(LaunchedChannel { child_fd, channel });
    }

    fn child_end(&mut self, fd: OwnedFd, target: RawFd) {
        self.wiring.push((fd.as_raw_fd(), target));
        self.keep_alive.push(fd);
    }

    fn terminal(&mut self, master: OwnedFd, slave: OwnedFd) -> io::Result<()> {
        let fd = slave.as_raw_fd();
        self.wiring.extend([(fd, 0), (fd, 1), (fd, 2)]);
        self.controlling_tty = Some(fd);
        self.keep_alive.push(slave);
        self.channel(
            crate::channel::PTY_OUTPUT_FD,
            Channel::Pty(PtyChannel::new(Endpoint::new(master)?)),
        );
        Ok(())
    }
}

fn c_string(value: &OsStr) -> Result<CString> {
    CString::new(value.as_bytes()).map_err(|_| nul_error(value))
}

fn nul_error(value: &OsStr) -> ProcessError {
    ProcessError::InvalidRequest(format!("{:?} contains a NUL byte", value))
}

impl<S: PosixSys> SpawnEngine for PosixEngine<S> {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::posix()
    }

    fn spawn(&mut self, launch: &Launch<'_>) -> Result<Launched> {
        let plumbing = self.plumb(launch)?;

        // The status write end must sit above every target so fd setup in
        // the child cannot overwrite it.
        let (status_read, low_write) = self.sys.pipe()?;
        let status_write = dup_cloexec(low_write.as_raw_fd(), wiring_floor(&plumbing.wiring))?;
        drop(low_write);
        let mut plan = self.plan(launch, &plumbing, status_write.as_raw_fd())?;

        // SAFETY: the child branch only walks the prepared plan until exec
        let forked = unsafe { self.sys.fork() };
        match forked {
            Ok(Forked::Child) => run_child(&mut self.sys, &mut plan),
            Ok(Forked::Parent(pid)) => {
                drop(status_write);
                let Plumbing {
                    channels,
                    keep_alive,
                    ..
                } = plumbing;
                drop(keep_alive);

                info!(
                    "Spawned pid {} ({}) with {} channel(s)",
                    pid,
                    launch.executable.display(),
                    channels.len()
                );
                Ok(Launched {
                    pid,
                    channels,
                    status_pipe: Some(Endpoint::new(status_read)?),
                })
            }
            Err(e) => {
                warn!("fork failed for {}: {}", launch.executable.display(), e);
                Err(ProcessError::Spawn(format!("fork failed: {}", e)))
            }
        }
    }

    fn signal(&mut self, pid: u32, signal: SignalName) -> Result<()> {
        debug!("Sending {} to pid {}", signal, pid);
        self.sys.kill(pid, signal.native()).map_err(|e| {
            if e.raw_os_error() == Some(libc::ESRCH) {
                ProcessError::ProcessExitedAlready
            } else {
                ProcessError::Syscall(format!("kill({}, {}): {}", pid, signal, e))
            }
        })
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        match self.sys.kill(pid, 0) {
            Ok(()) => true,
            Err(e) => e.raw_os_error() == Some(libc::EPERM),
        }
    }

    fn reap_one(&mut self, pid: u32) -> Result<Option<ExitStatus>> {
        match self.sys.waitpid(Some(pid)) {
            Ok(reaped) => Ok(reaped.map(|(_, status)| status)),
            Err(e) if e.raw_os_error() == Some(libc::ECHILD) => Ok(None),
            Err(e) => Err(ProcessError::Syscall(format!("waitpid({}): {}", pid, e))),
        }
    }

    fn reap_any(&mut self) -> Result<Option<(u32, ExitStatus)>> {
        match self.sys.waitpid(None) {
            Ok(reaped) => Ok(reaped),
            Err(e) if e.raw_os_error() == Some(libc::ECHILD) => Ok(None),
            Err(e) => Err(ProcessError::Syscall(format!("waitpid(-1): {}", e))),
        }
    }
}
