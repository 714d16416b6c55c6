//! Exit status and termination outcome

use serde::Serialize;
use std::fmt;

/// How an OS process finished. Only available once the status was collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Exited normally with a numeric code
    Exited(i32),
    /// Terminated by signal N
    Signaled(i32),
}

impl ExitStatus {
    /// Exit code, if the process exited normally
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            ExitStatus::Signaled(_) => None,
        }
    }

    /// Terminating signal, if the process was killed
    pub fn signal(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(_) => None,
            ExitStatus::Signaled(signal) => Some(*signal),
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    /// Shell-style status: the code, or 128 + signal
    pub fn shell_code(&self) -> i32 {
        match self {
            ExitStatus::Exited(code) => *code,
            ExitStatus::Signaled(signal) => 128 + signal,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exited with code {}", code),
            ExitStatus::Signaled(signal) => write!(f, "terminated by signal {}", signal),
        }
    }
}

/// Step of the child-side setup that failed before the target program ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildStage {
    Session,
    Identity,
    Chdir,
    FdSetup,
    Exec,
}

impl ChildStage {
    /// Exit status the child uses after reporting a failure at this stage
    pub const fn exit_code(self) -> i32 {
        match self {
            ChildStage::Session => 121,
            ChildStage::Identity => 122,
            ChildStage::Chdir => 123,
            ChildStage::FdSetup => 124,
            ChildStage::Exec => 127,
        }
    }

    const fn tag(self) -> u8 {
        match self {
            ChildStage::Session => 1,
            ChildStage::Identity => 2,
            ChildStage::Chdir => 3,
            ChildStage::FdSetup => 4,
            ChildStage::Exec => 5,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ChildStage::Session),
            2 => Some(ChildStage::Identity),
            3 => Some(ChildStage::Chdir),
            4 => Some(ChildStage::FdSetup),
            5 => Some(ChildStage::Exec),
            _ => None,
        }
    }
}

impl fmt::Display for ChildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChildStage::Session => "setsid",
            ChildStage::Identity => "identity switch",
            ChildStage::Chdir => "chdir",
            ChildStage::FdSetup => "fd setup",
            ChildStage::Exec => "exec",
        };
        f.write_str(name)
    }
}

const RECORD_FOOTER: [u8; 4] = *b"NOEX";

/// Failure record written by the child to the error-report pipe.
///
/// Wire format: `stage:u8`, `errno:i32` big-endian, footer `NOEX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChildFailure {
    pub stage: ChildStage,
    pub errno: i32,
}

impl ChildFailure {
    pub const RECORD_LEN: usize = 9;

    pub fn new(stage: ChildStage, errno: i32) -> Self {
        Self { stage, errno }
    }

    /// Encode without allocating (called in the forked child)
    pub fn encode(&self) -> [u8; Self::RECORD_LEN] {
        let errno = self.errno.to_be_bytes();
        [
            self.stage.tag(),
            errno[0],
            errno[1],
            errno[2],
            errno[3],
            RECORD_FOOTER[0],
            RECORD_FOOTER[1],
            RECORD_FOOTER[2],
            RECORD_FOOTER[3],
        ]
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::RECORD_LEN || bytes[5..] != RECORD_FOOTER {
            return None;
        }
        let stage = ChildStage::from_tag(bytes[0])?;
        let errno = i32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        Some(Self { stage, errno })
    }

    pub fn os_error(&self) -> std::io::Error {
        std::io::Error::from_raw_os_error(self.errno)
    }
}

impl fmt::Display for ChildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed in child: {}", self.stage, self.os_error())
    }
}

/// Final outcome delivered exactly once through `process_ended`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The target program ran; this is its collected status
    Exited(ExitStatus),
    /// The target program never ran
    SpawnFailed(ChildFailure),
}

impl Termination {
    pub fn status(&self) -> Option<ExitStatus> {
        match self {
            Termination::Exited(status) => Some(*status),
            Termination::SpawnFailed(_) => None,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exited(status) => status.fmt(f),
            Termination::SpawnFailed(failure) => write!(f, "spawn failed: {}", failure),
        }
    }
}
