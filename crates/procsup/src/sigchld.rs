//! Process-wide child-death notification
//!
//! The `SIGCHLD` handler only writes one byte to a non-blocking self-pipe.
//! The event loop watches the read end and runs a reap sweep after
//! [`ChildWatcher::drain`]; no table is touched in signal context.

use log::debug;
use procsup_core::{ProcessError, Result};
use std::os::fd::{IntoRawFd, RawFd};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::channel::endpoint::{set_cloexec, set_nonblocking};

static WAKE_FD: AtomicI32 = AtomicI32::new(-1);
static INSTALLED: OnceLock<std::result::Result<RawFd, String>> = OnceLock::new();

extern "C" fn on_sigchld(_signal: libc::c_int) {
    let fd = WAKE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let saved = nix::errno::Errno::last_raw();
    let byte = [1u8];
    // SAFETY: write(2) is async-signal-safe; a full pipe already holds a wakeup
    unsafe {
        libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
    }
    nix::errno::Errno::set_raw(saved);
}

/// Handle on the shared self-pipe
#[derive(Debug, Clone, Copy)]
pub struct ChildWatcher {
    read_fd: RawFd,
}

impl ChildWatcher {
    /// Install the handler on first use; later calls share it
    pub fn install() -> Result<Self> {
        let installed = INSTALLED.get_or_init(|| install_handler().map_err(|e| e.to_string()));
        match installed {
            Ok(read_fd) => Ok(Self { read_fd: *read_fd }),
            Err(e) => Err(ProcessError::Syscall(format!("SIGCHLD handler: {}", e))),
        }
    }

    /// Descriptor to register readable with the event loop
    pub fn fd(&self) -> RawFd {
        self.read_fd
    }

    /// Empty the self-pipe; returns the number of coalesced wakeups
    pub fn drain(&self) -> usize {
        let mut buf = [0u8; 64];
        let mut total = 0;
        loop {
            // SAFETY: buf is valid for its length
            let n = unsafe {
                libc::read(
                    self.read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
            total += n as usize;
        }
        total
    }
}

fn install_handler() -> std::io::Result<RawFd> {
    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

    let (read_end, write_end) = nix::unistd::pipe()?;
    let read_fd = read_end.into_raw_fd();
    let write_fd = write_end.into_raw_fd();
    for fd in [read_fd, write_fd] {
        set_nonblocking(fd)?;
        set_cloexec(fd)?;
    }
    WAKE_FD.store(write_fd, Ordering::Relaxed);

    let action = SigAction::new(
        SigHandler::Handler(on_sigchld),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    // SAFETY: the handler only performs async-signal-safe operations
    let _previous = unsafe { sigaction(Signal::SIGCHLD, &action) }?;

    debug!("SIGCHLD watcher installed (wake fd {})", read_fd);
    Ok(read_fd)
}
