//! Recording stand-in for the operating system

use nix::errno::Errno;
use procsup_core::{ExitStatus, Identity};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::ffi::CStr;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::raw::c_char;
use std::rc::Rc;

use super::sys::{ChildResult, Forked, PosixSys, RealSys, dup_cloexec};
use crate::channel::endpoint::set_nonblocking;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Fork,
    Setsid,
    Setuid(u32),
    Setgid(u32),
    SwitchUid(u32, u32, Vec<u32>),
    Chdir(String),
    Exec(String),
    Exit(i32),
    Waitpid(Option<u32>),
    Kill(u32, i32),
}

/// Panic payload standing in for `_exit` in the fake child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeExit(pub i32);

#[derive(Debug, Clone, Copy)]
pub enum FakeFork {
    Child,
    Parent(u32),
    Fail(Errno),
}

/// Fake child-side operations; parent-side pipes are real so descriptor
/// lifetimes can be checked.
#[derive(Debug)]
pub struct RecordingSys {
    pub actions: Rc<RefCell<Vec<Action>>>,
    pub reports: Rc<RefCell<Vec<Vec<u8>>>>,
    pub fork_as: FakeFork,
    pub identity: Identity,
    pub exec_errno: Errno,
    pub chdir_errno: Option<Errno>,
    pub kill_errno: Option<Errno>,
    pub exited: VecDeque<(u32, ExitStatus)>,
    /// Groups the user database lists for any user, besides the primary one
    pub member_of: Vec<u32>,
    /// Non-blocking duplicates of every pipe read end handed out
    pub probes: Vec<File>,
    next_fake_fd: RawFd,
}

impl RecordingSys {
    pub fn new(fork_as: FakeFork) -> Self {
        Self {
            actions: Rc::default(),
            reports: Rc::default(),
            fork_as,
            identity: Identity {
                ruid: 1000,
                euid: 1000,
                egid: 1000,
            },
            exec_errno: Errno::ENOENT,
            chdir_errno: None,
            kill_errno: None,
            exited: VecDeque::new(),
            member_of: Vec::new(),
            probes: Vec::new(),
            next_fake_fd: 100,
        }
    }

    pub fn actions(&self) -> Vec<Action> {
        self.actions.borrow().clone()
    }

    fn record(&self, action: Action) {
        self.actions.borrow_mut().push(action);
    }
}

impl PosixSys for RecordingSys {
    fn pipe(&mut self) -> io::Result<(OwnedFd, OwnedFd)> {
        let (read_end, write_end) = RealSys.pipe()?;
        let probe = dup_cloexec(read_end.as_raw_fd(), 0)?;
        set_nonblocking(probe.as_raw_fd())?;
        self.probes.push(File::from(probe));
        Ok((read_end, write_end))
    }

    fn openpty(&mut self) -> io::Result<(OwnedFd, OwnedFd)> {
        RealSys.openpty()
    }

    fn open_null(&mut self) -> io::Result<OwnedFd> {
        RealSys.open_null()
    }

    fn open_fds(&mut self) -> Vec<RawFd> {
        vec![0, 1, 2]
    }

    unsafe fn fork(&mut self) -> io::Result<Forked> {
        self.record(Action::Fork);
        match self.fork_as {
            FakeFork::Child => Ok(Forked::Child),
            FakeFork::Parent(pid) => Ok(Forked::Parent(pid)),
            FakeFork::Fail(errno) => Err(errno.into()),
        }
    }

    fn waitpid(&mut self, pid: Option<u32>) -> io::Result<Option<(u32, ExitStatus)>> {
        self.record(Action::Waitpid(pid));
        let position = match pid {
            Some(pid) => self.exited.iter().position(|(p, _)| *p == pid),
            None => (!self.exited.is_empty()).then_some(0),
        };
        Ok(position.and_then(|index| self.exited.remove(index)))
    }

    fn kill(&mut self, pid: u32, signal: i32) -> io::Result<()> {
        self.record(Action::Kill(pid, signal));
        match self.kill_errno {
            Some(errno) => Err(errno.into()),
            None => Ok(()),
        }
    }

    fn identity(&self) -> Identity {
        self.identity
    }

    fn supplementary_groups(&self, _uid: u32, gid: u32) -> Vec<u32> {
        let mut groups = vec![gid];
        groups.extend(&self.member_of);
        groups
    }

    fn reset_signals(&mut self) {}

    fn setsid(&mut self) -> ChildResult<()> {
        self.record(Action::Setsid);
        Ok(())
    }

    fn set_controlling_tty(&mut self, _fd: RawFd) -> ChildResult<()> {
        Ok(())
    }

    fn setuid(&mut self, uid: u32) -> ChildResult<()> {
        self.record(Action::Setuid(uid));
        Ok(())
    }

    fn setgid(&mut self, gid: u32) -> ChildResult<()> {
        self.record(Action::Setgid(gid));
        Ok(())
    }

    fn switch_uid(&mut self, uid: u32, gid: u32, groups: &[u32]) -> ChildResult<()> {
        self.record(Action::SwitchUid(uid, gid, groups.to_vec()));
        Ok(())
    }

    fn chdir(&mut self, path: &CStr) -> ChildResult<()> {
        self.record(Action::Chdir(path.to_string_lossy().into_owned()));
        match self.chdir_errno {
            Some(errno) => Err(errno),
            None => Ok(()),
        }
    }

    fn dup_above(&mut self, _fd: RawFd, floor: RawFd) -> ChildResult<RawFd> {
        self.next_fake_fd += 1;
        Ok(self.next_fake_fd.max(floor))
    }

    fn dup2(&mut self, _from: RawFd, _to: RawFd) -> ChildResult<()> {
        Ok(())
    }

    fn close(&mut self, _fd: RawFd) {}

    fn execve(&mut self, path: &CStr, _argv: &[*const c_char], _envp: &[*const c_char]) -> Errno {
        self.record(Action::Exec(path.to_string_lossy().into_owned()));
        self.exec_errno
    }

    fn write_report(&mut self, _fd: RawFd, record: &[u8]) {
        self.reports.borrow_mut().push(record.to_vec());
    }

    fn exit(&mut self, code: i32) -> ! {
        self.record(Action::Exit(code));
        std::panic::panic_any(FakeExit(code))
    }
}
