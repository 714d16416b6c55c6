//! Error types for process supervision

use std::io;
use thiserror::Error;

/// Result type for process supervision operations
pub type Result<T> = std::result::Result<T, ProcessError>;

/// Errors surfaced to callers of the supervisor.
///
/// Everything here is reported synchronously: either before any OS resource
/// was touched (configuration, resolution) or as the result of an operation
/// on a live handle (signalling, half-close). Failures that happen inside the
/// forked child travel as a [`crate::ChildFailure`] instead.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Syscall error: {0}")]
    Syscall(String),

    #[error("Invalid spawn request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported on this platform: {0}")]
    Unsupported(String),

    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("Spawn failed: {0}")]
    Spawn(String),

    #[error("Process already exited")]
    ProcessExitedAlready,

    #[error("Unknown signal: {0}")]
    UnknownSignal(String),

    #[error("Cannot half-close a pseudo-terminal; use lose_connection to close both directions")]
    PtyHalfClose,

    #[error("No channel for child fd {0}")]
    UnknownChannel(i32),
}

impl ProcessError {
    /// True for errors detected before any OS process was created.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ProcessError::InvalidRequest(_) | ProcessError::Unsupported(_)
        )
    }
}
