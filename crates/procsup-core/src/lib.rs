//! procsup-core: shared types for the procsup process supervisor
//!
//! This crate provides the leaf types used by the other procsup crates:
//! - Error taxonomy and Result alias
//! - Exit status and termination outcome
//! - Signal names and their native numbers
//! - Backend capability sets (what a spawn engine can honour)
//! - Identity (uid/gid) switch planning
//! - UID/GID queries

pub mod capabilities;
pub mod error;
pub mod privilege;
pub mod signal;
pub mod status;
#[cfg(unix)]
pub mod util;

pub use capabilities::BackendCapabilities;
pub use error::{ProcessError, Result};
pub use privilege::{Identity, IdentityPlan};
pub use signal::SignalName;
pub use status::{ChildFailure, ChildStage, ExitStatus, Termination};
