//! procsup: child-process supervision for single-threaded event loops
//!
//! Spawns programs with piped or pseudo-terminal stdio, optional identity
//! switching and descriptor remapping, then reports everything that happens
//! to them through a [`ProcessProtocol`]:
//!
//! - output as it arrives, per child descriptor
//! - each channel closing
//! - the collected exit status
//! - a single final `process_ended` once status and channels are both done
//!
//! The supervisor never owns a loop. It registers interest with a
//! [`reactor::Reactor`] and is driven through [`Supervisor::on_readable`],
//! [`Supervisor::on_writable`] and [`Supervisor::reap`]. On Unix,
//! [`reactor::PollReactor`] and [`Supervisor::turn`] provide a ready-made loop.
//!
//! # Example
//!
//! ```ignore
//! use procsup::{Collector, PollReactor, SpawnRequest, Supervisor, default_engine};
//!
//! let mut supervisor = Supervisor::new(default_engine(), PollReactor::new());
//! supervisor.attach_watcher(procsup::ChildWatcher::install()?);
//!
//! let request = SpawnRequest::builder("echo").arg("hello").build()?;
//! let (collector, mut done) = Collector::new();
//! supervisor.spawn_with(&request, collector)?;
//!
//! while !supervisor.is_empty() {
//!     supervisor.turn(None)?;
//! }
//! let collected = done.try_recv()?.expect("process ended");
//! assert_eq!(collected.stdout(), b"hello\n");
//! ```

pub mod channel;
pub mod collector;
pub mod config;
pub mod engine;
#[cfg(unix)]
pub mod posix;
pub mod reactor;
pub mod registry;
pub mod request;
pub mod resolve;
#[cfg(unix)]
pub mod sigchld;
pub mod supervisor;
pub mod windows;

#[cfg(all(test, unix))]
pub mod test_support;

pub use procsup_core::{
    self as core, BackendCapabilities, ChildFailure, ChildStage, ExitStatus, Identity,
    IdentityPlan, ProcessError, Result, SignalName, Termination,
};

pub use collector::{Collected, Collector};
pub use config::SupervisorConfig;
pub use engine::{DefaultEngine, SpawnEngine, default_engine};
pub use reactor::{Interests, Reactor, Token};
pub use request::{ChildFd, PtyMode, SpawnRequest, SpawnRequestBuilder};
pub use resolve::{resolve_executable, which};
pub use supervisor::{HandleState, ProcessKey, ProcessProtocol, Supervisor, Transport};

#[cfg(unix)]
pub use reactor::PollReactor;
#[cfg(unix)]
pub use sigchld::ChildWatcher;
