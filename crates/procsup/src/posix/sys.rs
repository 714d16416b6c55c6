//! OS primitives used by the fork/exec engine
//!
//! Everything the engine does to the operating system goes through
//! [`PosixSys`], so tests can substitute a recording fake and check the exact
//! call order. Methods documented as child-side run between `fork` and
//! `execve` and must not allocate or take locks.

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, fcntl};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Gid, Pid, Uid};
use procsup_core::{ExitStatus, Identity};
use std::ffi::CStr;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::raw::c_char;

use crate::channel::endpoint::set_cloexec;

/// Child-side result; the error is the raw errno
pub type ChildResult<T> = std::result::Result<T, Errno>;

/// Which side of a fork the caller is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    Child,
    Parent(u32),
}

pub trait PosixSys {
    /// Pipe with both ends close-on-exec
    fn pipe(&mut self) -> io::Result<(OwnedFd, OwnedFd)>;

    /// Pseudo-terminal pair (master, slave), both close-on-exec
    fn openpty(&mut self) -> io::Result<(OwnedFd, OwnedFd)>;

    /// Null device opened read-write, close-on-exec
    fn open_null(&mut self) -> io::Result<OwnedFd>;

    /// Descriptors currently open in this process
    fn open_fds(&mut self) -> Vec<RawFd>;

    /// # Safety
    /// In the child only async-signal-safe work may happen until exec.
    unsafe fn fork(&mut self) -> io::Result<Forked>;

    /// Non-blocking wait for `pid`, or for any child when `None`
    fn waitpid(&mut self, pid: Option<u32>) -> io::Result<Option<(u32, ExitStatus)>>;

    fn kill(&mut self, pid: u32, signal: i32) -> io::Result<()>;

    fn identity(&self) -> Identity;

    /// Group list `uid` would get from `initgroups`, `gid` included.
    /// Looked up in the parent; falls back to `[gid]` for unknown users.
    fn supplementary_groups(&self, uid: u32, gid: u32) -> Vec<u32>;

    /// Child-side: restore default signal disposition and mask
    fn reset_signals(&mut self);

    /// Child-side
    fn setsid(&mut self) -> ChildResult<()>;

    /// Child-side: make `fd` the controlling terminal
    fn set_controlling_tty(&mut self, fd: RawFd) -> ChildResult<()>;

    /// Child-side
    fn setuid(&mut self, uid: u32) -> ChildResult<()>;

    /// Child-side
    fn setgid(&mut self, gid: u32) -> ChildResult<()>;

    /// Child-side: switch to `uid`/`gid`. When privileged the
    /// supplementary groups become `groups` first, then gid, then uid.
    fn switch_uid(&mut self, uid: u32, gid: u32, groups: &[u32]) -> ChildResult<()>;

    /// Child-side
    fn chdir(&mut self, path: &CStr) -> ChildResult<()>;

    /// Child-side: close-on-exec duplicate numbered at least `floor`
    fn dup_above(&mut self, fd: RawFd, floor: RawFd) -> ChildResult<RawFd>;

    /// Child-side
    fn dup2(&mut self, from: RawFd, to: RawFd) -> ChildResult<()>;

    /// Child-side; errors are ignored
    fn close(&mut self, fd: RawFd);

    /// Child-side: only returns on failure
    fn execve(&mut self, path: &CStr, argv: &[*const c_char], envp: &[*const c_char]) -> Errno;

    /// Child-side: best-effort write of a failure record
    fn write_report(&mut self, fd: RawFd, record: &[u8]);

    /// Child-side: leave without running destructors or atexit handlers
    fn exit(&mut self, code: i32) -> !;
}

/// Duplicate `fd` close-on-exec at or above `floor` (parent side)
pub fn dup_cloexec(fd: RawFd, floor: RawFd) -> io::Result<OwnedFd> {
    let duplicate = fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(floor))?;
    // SAFETY: fcntl returned a fresh descriptor we now own
    Ok(unsafe { OwnedFd::from_raw_fd(duplicate) })
}

/// The real operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct RealSys;

impl PosixSys for RealSys {
    fn pipe(&mut self) -> io::Result<(OwnedFd, OwnedFd)> {
        let (read_end, write_end) = nix::unistd::pipe()?;
        set_cloexec(std::os::fd::AsRawFd::as_raw_fd(&read_end))?;
        set_cloexec(std::os::fd::AsRawFd::as_raw_fd(&write_end))?;
        Ok((read_end, write_end))
    }

    fn openpty(&mut self) -> io::Result<(OwnedFd, OwnedFd)> {
        let pair = nix::pty::openpty(None, None)?;
        set_cloexec(std::os::fd::AsRawFd::as_raw_fd(&pair.master))?;
        set_cloexec(std::os::fd::AsRawFd::as_raw_fd(&pair.slave))?;
        Ok((pair.master, pair.slave))
    }

    fn open_null(&mut self) -> io::Result<OwnedFd> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/null")?;
        Ok(OwnedFd::from(file))
    }

    fn open_fds(&mut self) -> Vec<RawFd> {
        for dir in ["/proc/self/fd", "/dev/fd"] {
            if let Ok(entries) = std::fs::read_dir(dir) {
                let mut fds: Vec<RawFd> = entries
                    .filter_map(|entry| entry.ok())
                    .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
                    .collect();
                fds.sort_unstable();
                return fds;
            }
        }

        // SAFETY: sysconf has no memory effects
        let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
        let limit = if limit <= 0 { 1024 } else { limit.min(65536) as RawFd };
        (0..limit).collect()
    }

    unsafe fn fork(&mut self) -> io::Result<Forked> {
        // SAFETY: forwarded to the caller
        match unsafe { nix::unistd::fork() }? {
            nix::unistd::ForkResult::Child => Ok(Forked::Child),
            nix::unistd::ForkResult::Parent { child } => Ok(Forked::Parent(child.as_raw() as u32)),
        }
    }

    fn waitpid(&mut self, pid: Option<u32>) -> io::Result<Option<(u32, ExitStatus)>> {
        let target = pid.map(|p| Pid::from_raw(p as libc::pid_t));
        loop {
            match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    return Ok(Some((pid.as_raw() as u32, ExitStatus::Exited(code))));
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    return Ok(Some((pid.as_raw() as u32, ExitStatus::Signaled(signal as i32))));
                }
                Ok(_) => return Ok(None),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn kill(&mut self, pid: u32, signal: i32) -> io::Result<()> {
        // SAFETY: kill(2) has no memory effects
        if unsafe { libc::kill(pid as libc::pid_t, signal) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn identity(&self) -> Identity {
        Identity::current()
    }

    #[cfg(not(any(
        target_os = "aix",
        target_os = "solaris",
        target_os = "illumos",
        target_vendor = "apple",
        target_os = "redox"
    )))]
    fn supplementary_groups(&self, uid: u32, gid: u32) -> Vec<u32> {
        let user = match nix::unistd::User::from_uid(Uid::from_raw(uid)) {
            Ok(Some(user)) => user,
            _ => return vec![gid],
        };
        let Ok(name) = std::ffi::CString::new(user.name) else {
            return vec![gid];
        };
        match nix::unistd::getgrouplist(&name, Gid::from_raw(gid)) {
            Ok(groups) => groups.into_iter().map(Gid::as_raw).collect(),
            Err(_) => vec![gid],
        }
    }

    #[cfg(any(
        target_os = "aix",
        target_os = "solaris",
        target_os = "illumos",
        target_vendor = "apple",
        target_os = "redox"
    ))]
    fn supplementary_groups(&self, _uid: u32, gid: u32) -> Vec<u32> {
        vec![gid]
    }

    fn reset_signals(&mut self) {
        // SAFETY: signal and sigprocmask are async-signal-safe
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
            let mut empty: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut empty);
            libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());
        }
    }

    fn setsid(&mut self) -> ChildResult<()> {
        nix::unistd::setsid().map(|_| ())
    }

    fn set_controlling_tty(&mut self, fd: RawFd) -> ChildResult<()> {
        // SAFETY: TIOCSCTTY takes an integer argument
        if unsafe { libc::ioctl(fd, libc::TIOCSCTTY as _, 0) } < 0 {
            return Err(Errno::last());
        }
        Ok(())
    }

    fn setuid(&mut self, uid: u32) -> ChildResult<()> {
        nix::unistd::setuid(Uid::from_raw(uid))
    }

    fn setgid(&mut self, gid: u32) -> ChildResult<()> {
        nix::unistd::setgid(Gid::from_raw(gid))
    }

    fn switch_uid(&mut self, uid: u32, gid: u32, groups: &[u32]) -> ChildResult<()> {
        // SAFETY: geteuid has no memory effects
        if unsafe { libc::geteuid() } == 0 {
            // SAFETY: groups outlives the call and gid_t is u32
            if unsafe { libc::setgroups(groups.len() as _, groups.as_ptr() as *const libc::gid_t) }
                != 0
            {
                return Err(Errno::last());
            }
        }
        nix::unistd::setgid(Gid::from_raw(gid))?;
        nix::unistd::setuid(Uid::from_raw(uid))
    }

    fn chdir(&mut self, path: &CStr) -> ChildResult<()> {
        nix::unistd::chdir(path)
    }

    fn dup_above(&mut self, fd: RawFd, floor: RawFd) -> ChildResult<RawFd> {
        fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(floor))
    }

    fn dup2(&mut self, from: RawFd, to: RawFd) -> ChildResult<()> {
        loop {
            match nix::unistd::dup2(from, to) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&mut self, fd: RawFd) {
        // SAFETY: closing an unowned number in the child; errors are irrelevant
        unsafe {
            libc::close(fd);
        }
    }

    fn execve(&mut self, path: &CStr, argv: &[*const c_char], envp: &[*const c_char]) -> Errno {
        // SAFETY: argv and envp are null-terminated arrays of valid C strings
        unsafe {
            libc::execve(path.as_ptr(), argv.as_ptr(), envp.as_ptr());
        }
        Errno::last()
    }

    fn write_report(&mut self, fd: RawFd, record: &[u8]) {
        // SAFETY: record is valid for its length
        unsafe {
            libc::write(fd, record.as_ptr() as *const libc::c_void, record.len());
        }
    }

    fn exit(&mut self, code: i32) -> ! {
        // SAFETY: _exit never returns
        unsafe { libc::_exit(code) }
    }
}
