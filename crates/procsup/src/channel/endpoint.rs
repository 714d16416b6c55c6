//! Non-blocking OS endpoint owned by exactly one channel

use crate::reactor::RawSource;
use std::io;

#[cfg(unix)]
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Parent-side end of a pipe or pty master.
///
/// Reads and writes never block: "no data yet" and "no room yet" surface as
/// [`io::ErrorKind::WouldBlock`].
#[derive(Debug)]
pub struct Endpoint {
    #[cfg(unix)]
    fd: OwnedFd,
    #[cfg(windows)]
    handle: std::os::windows::io::OwnedHandle,
}

#[cfg(unix)]
impl Endpoint {
    /// Take ownership of `fd` and switch it to non-blocking mode
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self { fd })
    }

    pub fn source(&self) -> RawSource {
        self.fd.as_raw_fd()
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for buf.len() bytes and fd is owned by self
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for buf.len() bytes and fd is owned by self
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// True once the other end is gone (hang-up or error pending)
    pub fn peer_closed(&self) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: 0,
            revents: 0,
        };
        // SAFETY: single valid pollfd, zero timeout
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        rc > 0 && pfd.revents & (libc::POLLHUP | libc::POLLERR) != 0
    }
}

/// Set `O_NONBLOCK` on `fd`
#[cfg(unix)]
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a caller-provided descriptor has no memory effects
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Set `FD_CLOEXEC` on `fd`
#[cfg(unix)]
pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a caller-provided descriptor has no memory effects
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(windows)]
impl Endpoint {
    /// Take ownership of a pipe handle. Write ends are switched to
    /// `PIPE_NOWAIT` so a full pipe reports `WouldBlock`.
    pub fn new(handle: std::os::windows::io::OwnedHandle) -> io::Result<Self> {
        use windows::Win32::System::Pipes::{
            PIPE_NOWAIT, PIPE_READMODE_BYTE, SetNamedPipeHandleState,
        };

        let endpoint = Self { handle };
        let mode = PIPE_READMODE_BYTE | PIPE_NOWAIT;
        // Fails harmlessly for non-pipe handles such as the null device
        let _ = unsafe {
            SetNamedPipeHandleState(endpoint.raw(), Some(&mode as *const _), None, None)
        };
        Ok(endpoint)
    }

    fn raw(&self) -> windows::Win32::Foundation::HANDLE {
        use std::os::windows::io::AsRawHandle;
        windows::Win32::Foundation::HANDLE(self.handle.as_raw_handle() as _)
    }

    pub fn source(&self) -> RawSource {
        use std::os::windows::io::AsRawHandle;
        self.handle.as_raw_handle()
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        use windows::Win32::Foundation::ERROR_BROKEN_PIPE;
        use windows::Win32::Storage::FileSystem::ReadFile;
        use windows::Win32::System::Pipes::PeekNamedPipe;

        let mut available = 0u32;
        let peeked = unsafe {
            PeekNamedPipe(
                self.raw(),
                None,
                0,
                None,
                Some(&mut available as *mut u32),
                None,
            )
        };
        if let Err(e) = peeked {
            if e.code() == ERROR_BROKEN_PIPE.to_hresult() {
                return Ok(0);
            }
            return Err(win_error(e));
        }
        if available == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let want = buf.len().min(available as usize);
        let mut read = 0u32;
        let result = unsafe {
            ReadFile(
                self.raw(),
                Some(&mut buf[..want]),
                Some(&mut read as *mut u32),
                None,
            )
        };
        match result {
            Ok(()) => Ok(read as usize),
            Err(e) if e.code() == ERROR_BROKEN_PIPE.to_hresult() => Ok(0),
            Err(e) => Err(win_error(e)),
        }
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        use windows::Win32::Foundation::{ERROR_BROKEN_PIPE, ERROR_NO_DATA};
        use windows::Win32::Storage::FileSystem::WriteFile;

        let mut written = 0u32;
        let result =
            unsafe { WriteFile(self.raw(), Some(buf), Some(&mut written as *mut u32), None) };
        match result {
            Ok(()) if written == 0 && !buf.is_empty() => Err(io::ErrorKind::WouldBlock.into()),
            Ok(()) => Ok(written as usize),
            Err(e)
                if e.code() == ERROR_BROKEN_PIPE.to_hresult()
                    || e.code() == ERROR_NO_DATA.to_hresult() =>
            {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            Err(e) => Err(win_error(e)),
        }
    }

    /// Anonymous pipes report a vanished reader only on write
    pub fn peer_closed(&self) -> bool {
        false
    }
}

#[cfg(windows)]
fn win_error(e: windows::core::Error) -> io::Error {
    io::Error::from_raw_os_error(e.code().0 & 0xFFFF)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn empty_pipe_would_block() {
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        let endpoint = Endpoint::new(read_end).unwrap();
        let mut buf = [0u8; 8];
        let err = endpoint.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn closed_writer_reads_eof() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let endpoint = Endpoint::new(read_end).unwrap();
        drop(write_end);
        let mut buf = [0u8; 8];
        assert_eq!(endpoint.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn peer_closed_tracks_reader() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let endpoint = Endpoint::new(write_end).unwrap();
        assert!(!endpoint.peer_closed());
        drop(read_end);
        assert!(endpoint.peer_closed());
    }
}
