//! Named signals and their platform mapping

use crate::error::{ProcessError, Result};
use std::fmt;
use std::str::FromStr;

/// Signal names accepted by the signal delivery surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalName {
    Term,
    Kill,
    Hup,
    Int,
    Quit,
    Usr1,
    Usr2,
    Stop,
    Cont,
    Alrm,
    Chld,
    Pipe,
}

impl SignalName {
    pub const ALL: [SignalName; 12] = [
        SignalName::Term,
        SignalName::Kill,
        SignalName::Hup,
        SignalName::Int,
        SignalName::Quit,
        SignalName::Usr1,
        SignalName::Usr2,
        SignalName::Stop,
        SignalName::Cont,
        SignalName::Alrm,
        SignalName::Chld,
        SignalName::Pipe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalName::Term => "TERM",
            SignalName::Kill => "KILL",
            SignalName::Hup => "HUP",
            SignalName::Int => "INT",
            SignalName::Quit => "QUIT",
            SignalName::Usr1 => "USR1",
            SignalName::Usr2 => "USR2",
            SignalName::Stop => "STOP",
            SignalName::Cont => "CONT",
            SignalName::Alrm => "ALRM",
            SignalName::Chld => "CHLD",
            SignalName::Pipe => "PIPE",
        }
    }

    /// True for the names a kill-only platform can still honour
    pub fn is_termination(&self) -> bool {
        matches!(self, SignalName::Term | SignalName::Kill)
    }

    /// Native signal number
    #[cfg(unix)]
    pub fn native(&self) -> i32 {
        match self {
            SignalName::Term => libc::SIGTERM,
            SignalName::Kill => libc::SIGKILL,
            SignalName::Hup => libc::SIGHUP,
            SignalName::Int => libc::SIGINT,
            SignalName::Quit => libc::SIGQUIT,
            SignalName::Usr1 => libc::SIGUSR1,
            SignalName::Usr2 => libc::SIGUSR2,
            SignalName::Stop => libc::SIGSTOP,
            SignalName::Cont => libc::SIGCONT,
            SignalName::Alrm => libc::SIGALRM,
            SignalName::Chld => libc::SIGCHLD,
            SignalName::Pipe => libc::SIGPIPE,
        }
    }
}

impl FromStr for SignalName {
    type Err = ProcessError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        SignalName::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == bare)
            .ok_or_else(|| ProcessError::UnknownSignal(s.to_string()))
    }
}

impl fmt::Display for SignalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG{}", self.as_str())
    }
}
