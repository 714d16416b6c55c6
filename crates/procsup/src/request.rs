//! Spawn requests and their validation
//!
//! A [`SpawnRequest`] is immutable once built. Every check here runs before
//! any pipe is opened or any process is created, so a rejected request never
//! leaks a descriptor.

use procsup_core::{BackendCapabilities, ProcessError, Result};
use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// What the parent does with one child descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildFd {
    /// Parent reads what the child writes
    Read,
    /// Parent writes what the child reads
    Write,
    /// Child receives a duplicate of this parent descriptor
    Inherit(i32),
    /// Child descriptor is wired to the null device
    Discard,
}

/// Pseudo-terminal selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PtyMode {
    #[default]
    Off,
    /// Open a fresh master/slave pair for the child
    Allocate,
    /// Use a caller-supplied pair. The supervisor duplicates both descriptors,
    /// the caller keeps ownership of the originals.
    Existing { master: i32, slave: i32 },
}

impl PtyMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, PtyMode::Off)
    }
}

/// Validated description of one process launch
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    executable: PathBuf,
    argv: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    inherit_env: bool,
    cwd: Option<PathBuf>,
    uid: Option<u32>,
    gid: Option<u32>,
    pty: PtyMode,
    child_fds: Option<Vec<(i32, ChildFd)>>,
}

impl SpawnRequest {
    /// Create a builder for `executable`
    pub fn builder(executable: impl Into<PathBuf>) -> SpawnRequestBuilder {
        SpawnRequestBuilder::new(executable)
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Full argument vector, argv[0] included
    pub fn argv(&self) -> &[OsString] {
        &self.argv
    }

    /// Explicit environment entries, one per key, in first-insertion order
    pub fn env(&self) -> &[(OsString, OsString)] {
        &self.env
    }

    pub fn inherit_env(&self) -> bool {
        self.inherit_env
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn uid(&self) -> Option<u32> {
        self.uid
    }

    pub fn gid(&self) -> Option<u32> {
        self.gid
    }

    pub fn pty(&self) -> PtyMode {
        self.pty
    }

    /// Child descriptor map sorted by child fd. Without an explicit map the
    /// three stdio slots are piped: the parent writes fd 0 and reads fd 1 and 2.
    pub fn child_fd_map(&self) -> Vec<(i32, ChildFd)> {
        let mut map = self
            .child_fds
            .clone()
            .unwrap_or_else(|| vec![(0, ChildFd::Write), (1, ChildFd::Read), (2, ChildFd::Read)]);
        map.sort_by_key(|(fd, _)| *fd);
        map
    }

    pub fn has_custom_child_fds(&self) -> bool {
        self.child_fds.is_some()
    }

    /// Environment handed to the child: the parent's variables when inherited,
    /// overridden by the explicit entries
    pub fn effective_env(&self) -> Vec<(OsString, OsString)> {
        if !self.inherit_env {
            return self.env.clone();
        }

        let mut combined: Vec<(OsString, OsString)> = std::env::vars_os().collect();
        for (key, value) in &self.env {
            if let Some((_, existing)) = combined.iter_mut().find(|(k, _)| env_key_eq(k, key)) {
                *existing = value.clone();
            } else {
                combined.push((key.clone(), value.clone()));
            }
        }
        combined
    }

    /// `PATH` the child will see, if any
    pub fn path_var(&self) -> Option<OsString> {
        let explicit = self
            .env
            .iter()
            .rev()
            .find(|(k, _)| env_key_eq(k, OsStr::new("PATH")))
            .map(|(_, v)| v.clone());
        match explicit {
            Some(path) => Some(path),
            None if self.inherit_env => std::env::var_os("PATH"),
            None => None,
        }
    }

    /// Check the request against what `caps` can honour
    pub fn validate(&self, caps: &BackendCapabilities) -> Result<()> {
        if self.executable.as_os_str().is_empty() {
            return Err(invalid("executable path is empty"));
        }
        if has_nul(self.executable.as_os_str()) {
            return Err(invalid("executable path contains a NUL byte"));
        }

        for (index, arg) in self.argv.iter().enumerate() {
            if has_nul(arg) {
                return Err(invalid(format!("argument {} contains a NUL byte", index)));
            }
        }

        for (key, value) in &self.env {
            let shown = key.to_string_lossy();
            if key.is_empty() {
                return Err(invalid("environment key is empty"));
            }
            if has_nul(key) {
                return Err(invalid(format!("environment key {:?} contains a NUL byte", shown)));
            }
            if contains_unit(key, b'=') {
                return Err(invalid(format!("environment key {:?} contains '='", shown)));
            }
            if has_nul(value) {
                return Err(invalid(format!(
                    "environment value for {:?} contains a NUL byte",
                    shown
                )));
            }
        }

        if let Some(cwd) = &self.cwd
            && has_nul(cwd.as_os_str())
        {
            return Err(invalid("working directory contains a NUL byte"));
        }

        if (self.uid.is_some() || self.gid.is_some()) && !caps.identity_switch {
            return Err(ProcessError::Unsupported(format!(
                "uid/gid switching is not available on the {} backend",
                caps.name
            )));
        }

        if self.pty.is_enabled() && !caps.pty {
            return Err(ProcessError::Unsupported(format!(
                "pseudo-terminals are not available on the {} backend",
                caps.name
            )));
        }

        if let PtyMode::Existing { master, slave } = self.pty
            && (master < 0 || slave < 0)
        {
            return Err(invalid("pseudo-terminal descriptors must be non-negative"));
        }

        if let Some(map) = &self.child_fds {
            self.validate_child_fds(map, caps)?;
        }

        Ok(())
    }

    fn validate_child_fds(&self, map: &[(i32, ChildFd)], caps: &BackendCapabilities) -> Result<()> {
        if self.pty.is_enabled() {
            return Err(invalid(
                "a child fd map cannot be combined with a pseudo-terminal",
            ));
        }

        let mut seen = HashSet::new();
        for (fd, disposition) in map {
            if *fd < 0 {
                return Err(invalid(format!("child fd {} is negative", fd)));
            }
            if !seen.insert(*fd) {
                return Err(invalid(format!("child fd {} is mapped more than once", fd)));
            }
            if *fd > 2 && !caps.extra_child_fds {
                return Err(ProcessError::Unsupported(format!(
                    "child fd {} beyond stdio is not available on the {} backend",
                    fd, caps.name
                )));
            }
            if let ChildFd::Inherit(source) = disposition {
                if *source < 0 {
                    return Err(invalid(format!(
                        "child fd {} inherits negative parent fd {}",
                        fd, source
                    )));
                }
                if !caps.pass_through {
                    return Err(ProcessError::Unsupported(format!(
                        "descriptor pass-through is not available on the {} backend",
                        caps.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Builder for [`SpawnRequest`]
#[derive(Debug, Clone)]
pub struct SpawnRequestBuilder {
    executable: PathBuf,
    argv0: Option<OsString>,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    inherit_env: bool,
    cwd: Option<PathBuf>,
    uid: Option<u32>,
    gid: Option<u32>,
    pty: PtyMode,
    child_fds: Option<Vec<(i32, ChildFd)>>,
}

impl SpawnRequestBuilder {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            argv0: None,
            args: Vec::new(),
            env: Vec::new(),
            inherit_env: false,
            cwd: None,
            uid: None,
            gid: None,
            pty: PtyMode::Off,
            child_fds: None,
        }
    }

    /// Override argv[0] (defaults to the executable path)
    pub fn arg0(mut self, name: impl Into<OsString>) -> Self {
        self.argv0 = Some(name.into());
        self
    }

    /// Append one argument after argv[0]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments after argv[0]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Replace the whole argument vector, argv[0] included. An empty vector
    /// means `[executable]`.
    pub fn argv<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        self.argv0 = argv.next();
        self.args = argv.collect();
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Start from the parent's environment
    pub fn inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn gid(mut self, gid: u32) -> Self {
        self.gid = Some(gid);
        self
    }

    /// Run the child on a freshly allocated pseudo-terminal
    pub fn use_pty(mut self, enabled: bool) -> Self {
        self.pty = if enabled { PtyMode::Allocate } else { PtyMode::Off };
        self
    }

    pub fn pty(mut self, mode: PtyMode) -> Self {
        self.pty = mode;
        self
    }

    /// Map one child descriptor. The first call replaces the default stdio map.
    pub fn child_fd(mut self, fd: i32, disposition: ChildFd) -> Self {
        self.child_fds
            .get_or_insert_with(Vec::new)
            .push((fd, disposition));
        self
    }

    /// Build and validate against the backend compiled for this platform
    pub fn build(self) -> Result<SpawnRequest> {
        self.build_for(&BackendCapabilities::current())
    }

    /// Build and validate against `caps`
    pub fn build_for(self, caps: &BackendCapabilities) -> Result<SpawnRequest> {
        let argv0 = self
            .argv0
            .unwrap_or_else(|| self.executable.as_os_str().to_os_string());
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(argv0);
        argv.extend(self.args);

        let request = SpawnRequest {
            executable: self.executable,
            argv,
            env: collapse_env(self.env),
            inherit_env: self.inherit_env,
            cwd: self.cwd,
            uid: self.uid,
            gid: self.gid,
            pty: self.pty,
            child_fds: self.child_fds,
        };
        request.validate(caps)?;
        Ok(request)
    }
}

/// Keep one entry per key; a later value replaces an earlier one in place
fn collapse_env(vars: Vec<(OsString, OsString)>) -> Vec<(OsString, OsString)> {
    let mut merged: Vec<(OsString, OsString)> = Vec::with_capacity(vars.len());
    for (key, value) in vars {
        match merged.iter_mut().find(|(k, _)| env_key_eq(k, &key)) {
            Some(slot) => slot.1 = value,
            None => merged.push((key, value)),
        }
    }
    merged
}

fn invalid(message: impl Into<String>) -> ProcessError {
    ProcessError::InvalidRequest(message.into())
}

#[cfg(unix)]
fn contains_unit(s: &OsStr, unit: u8) -> bool {
    use std::os::unix::ffi::OsStrExt;
    s.as_bytes().contains(&unit)
}

#[cfg(windows)]
fn contains_unit(s: &OsStr, unit: u8) -> bool {
    use std::os::windows::ffi::OsStrExt;
    s.encode_wide().any(|c| c == u16::from(unit))
}

fn has_nul(s: &OsStr) -> bool {
    contains_unit(s, 0)
}

#[cfg(windows)]
fn env_key_eq(a: &OsStr, b: &OsStr) -> bool {
    a.to_string_lossy().eq_ignore_ascii_case(&b.to_string_lossy())
}

#[cfg(not(windows))]
fn env_key_eq(a: &OsStr, b: &OsStr) -> bool {
    a == b
}
