//! `poll(2)` reference loop

use super::{Interests, RawSource, Reactor, Token};
use std::collections::BTreeMap;
use std::io;
use std::time::Duration;

/// One ready token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

/// Minimal reactor backed by `poll(2)`.
///
/// Hang-up and error conditions are reported as readable, so a write pipe
/// whose reader went away wakes the loop.
#[derive(Debug, Default)]
pub struct PollReactor {
    interests: Interests,
}

impl PollReactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interests(&self) -> &Interests {
        &self.interests
    }

    pub fn is_idle(&self) -> bool {
        self.interests.is_empty()
    }

    /// Wait up to `timeout` (forever when `None`) for registered readiness.
    /// An interrupted wait returns no events.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Readiness>> {
        let mut wanted: BTreeMap<Token, (RawSource, libc::c_short)> = BTreeMap::new();
        for (token, fd) in self.interests.readable() {
            wanted.entry(token).or_insert((fd, 0)).1 |= libc::POLLIN;
        }
        for (token, fd) in self.interests.writable() {
            wanted.entry(token).or_insert((fd, 0)).1 |= libc::POLLOUT;
        }

        let tokens: Vec<Token> = wanted.keys().copied().collect();
        let mut fds: Vec<libc::pollfd> = wanted
            .values()
            .map(|(fd, events)| libc::pollfd {
                fd: *fd,
                events: *events,
                revents: 0,
            })
            .collect();

        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
            None => -1,
        };

        // SAFETY: fds is a valid, exclusively borrowed pollfd array
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let readable_mask = libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
        Ok(tokens
            .into_iter()
            .zip(fds)
            .filter(|(_, pfd)| pfd.revents != 0)
            .map(|(token, pfd)| Readiness {
                token,
                readable: pfd.revents & readable_mask != 0,
                writable: pfd.revents & libc::POLLOUT != 0,
            })
            .collect())
    }
}

impl Reactor for PollReactor {
    fn register_readable(&mut self, token: Token, source: RawSource) {
        self.interests.register_readable(token, source);
    }

    fn register_writable(&mut self, token: Token, source: RawSource) {
        self.interests.register_writable(token, source);
    }

    fn unregister_readable(&mut self, token: Token) {
        self.interests.unregister_readable(token);
    }

    fn unregister_writable(&mut self, token: Token) {
        self.interests.unregister_writable(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    #[test]
    fn reports_readable_pipe() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let mut writer = File::from(write_end);
        writer.write_all(b"x").unwrap();

        let mut reactor = PollReactor::new();
        reactor.register_readable(Token(3), read_end.as_raw_fd());
        let ready = reactor.wait(Some(Duration::from_millis(100))).unwrap();

        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].token, Token(3));
        assert!(ready[0].readable);
    }

    #[test]
    fn write_end_with_closed_reader_is_readable() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        drop(read_end);

        let mut reactor = PollReactor::new();
        reactor.register_readable(Token(1), write_end.as_raw_fd());
        let ready = reactor.wait(Some(Duration::from_millis(100))).unwrap();

        assert_eq!(ready.len(), 1);
        assert!(ready[0].readable);
    }

    #[test]
    fn idle_wait_times_out_empty() {
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        let mut reactor = PollReactor::new();
        reactor.register_readable(Token(1), read_end.as_raw_fd());
        let ready = reactor.wait(Some(Duration::from_millis(10))).unwrap();
        assert!(ready.is_empty());
    }
}
