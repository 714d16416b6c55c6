//! POSIX spawn engine
//!
//! # Child setup order
//!
//! After `fork` the child runs these steps and stops at the first failure:
//!
//! 1. Reset signal disposition and mask
//! 2. New session and controlling terminal (pty spawns only)
//! 3. Identity switch, regaining root first when the supervisor started as root
//! 4. Change directory
//! 5. Descriptor setup: relocate sources, `dup2` onto targets, close the rest
//! 6. `execve`
//!
//! A failure writes a [`procsup_core::ChildFailure`] record to the status
//! pipe and exits with the stage's code.

pub mod child;
pub mod engine;
pub mod sys;

#[cfg(test)]
pub(crate) mod fake;

pub use engine::PosixEngine;
pub use sys::{PosixSys, RealSys};
