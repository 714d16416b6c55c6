//! What a spawn backend is able to honour
//!
//! The request validator checks every request against the capability set of
//! the backend that will run it, so an unsupported field is reported as a
//! configuration error before any OS resource is allocated.

/// Capability set of one spawn backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Backend name for diagnostics
    pub name: &'static str,
    /// Can switch the child to another uid/gid
    pub identity_switch: bool,
    /// Can run the child on a pseudo-terminal
    pub pty: bool,
    /// Can wire child descriptors beyond 0, 1 and 2
    pub extra_child_fds: bool,
    /// Can pass an existing parent descriptor through to the child
    pub pass_through: bool,
    /// Can deliver named signals other than termination
    pub named_signals: bool,
}

impl BackendCapabilities {
    /// fork/exec backend
    pub const fn posix() -> Self {
        Self {
            name: "posix",
            identity_switch: true,
            pty: true,
            extra_child_fds: true,
            pass_through: true,
            named_signals: true,
        }
    }

    /// CreateProcess backend
    pub const fn windows() -> Self {
        Self {
            name: "windows",
            identity_switch: false,
            pty: false,
            extra_child_fds: false,
            pass_through: false,
            named_signals: false,
        }
    }

    /// Capabilities of the backend compiled for this platform
    pub const fn current() -> Self {
        #[cfg(windows)]
        {
            Self::windows()
        }
        #[cfg(not(windows))]
        {
            Self::posix()
        }
    }

    /// Get a human-readable summary of capabilities
    pub fn summary(&self) -> String {
        let check = |available: bool| if available { "[ok]" } else { "[--]" };

        [
            format!("backend: {}", self.name),
            format!("{} uid/gid switching", check(self.identity_switch)),
            format!("{} pseudo-terminals", check(self.pty)),
            format!("{} child fds beyond stdio", check(self.extra_child_fds)),
            format!("{} descriptor pass-through", check(self.pass_through)),
            format!("{} named signals", check(self.named_signals)),
        ]
        .join("\n")
    }
}
