//! Table of live children keyed by OS pid
//!
//! An entry is added right after a spawn and removed exactly once, when the
//! child's status is collected. Status for a pid that is not in the table
//! (a reparented orphan, a child spawned by other code) is discarded.

use log::{debug, warn};
use procsup_core::ExitStatus;
use std::collections::HashMap;

use crate::engine::SpawnEngine;
use crate::supervisor::ProcessKey;

/// Live entry for one OS process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessDescriptor {
    pub pid: u32,
    pub key: ProcessKey,
}

#[derive(Debug, Default)]
pub struct Registry {
    by_pid: HashMap<u32, ProcessDescriptor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pid: u32, key: ProcessKey) {
        if let Some(previous) = self.by_pid.insert(pid, ProcessDescriptor { pid, key }) {
            warn!(
                "pid {} re-registered while still live (previous handle {:?})",
                pid, previous.key
            );
        }
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.by_pid.contains_key(&pid)
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessDescriptor> {
        self.by_pid.get(&pid)
    }

    pub fn len(&self) -> usize {
        self.by_pid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pid.is_empty()
    }

    /// Remove the entry for a reaped pid. Returns the owning handle the
    /// first time only.
    pub fn record(&mut self, pid: u32) -> Option<ProcessKey> {
        self.by_pid.remove(&pid).map(|descriptor| descriptor.key)
    }

    /// Collect every child that has already terminated.
    ///
    /// Never blocks. Ends when the engine reports nothing ready, no children
    /// left, or an error.
    pub fn sweep<E>(&mut self, engine: &mut E) -> Vec<(ProcessKey, ExitStatus)>
    where
        E: SpawnEngine + ?Sized,
    {
        let mut collected = Vec::new();
        loop {
            match engine.reap_any() {
                Ok(Some((pid, status))) => match self.record(pid) {
                    Some(key) => {
                        debug!("Reaped pid {}: {}", pid, status);
                        collected.push((key, status));
                    }
                    None => debug!("Discarding status of unregistered pid {}", pid),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Reap sweep stopped: {}", e);
                    break;
                }
            }
        }
        collected
    }

    /// Non-blocking collection of one registered pid
    pub fn collect_one<E>(&mut self, pid: u32, engine: &mut E) -> Option<(ProcessKey, ExitStatus)>
    where
        E: SpawnEngine + ?Sized,
    {
        if !self.contains(pid) {
            return None;
        }
        match engine.reap_one(pid) {
            Ok(Some(status)) => self.record(pid).map(|key| (key, status)),
            Ok(None) => None,
            Err(e) => {
                debug!("waitpid for {} failed: {}", pid, e);
                None
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::posix::PosixEngine;
    use crate::posix::fake::{FakeFork, RecordingSys};

    fn engine_with(exited: &[(u32, ExitStatus)]) -> PosixEngine<RecordingSys> {
        let mut sys = RecordingSys::new(FakeFork::Parent(1));
        sys.exited.extend(exited.iter().copied());
        PosixEngine::with_sys(sys)
    }

    #[test]
    fn record_removes_exactly_once() {
        let mut registry = Registry::new();
        registry.insert(10, ProcessKey(1));
        assert_eq!(registry.record(10), Some(ProcessKey(1)));
        assert_eq!(registry.record(10), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn one_sweep_drains_every_dead_child() {
        let mut registry = Registry::new();
        registry.insert(10, ProcessKey(1));
        registry.insert(11, ProcessKey(2));
        let mut engine = engine_with(&[
            (10, ExitStatus::Exited(0)),
            (11, ExitStatus::Signaled(libc::SIGKILL)),
        ]);

        let collected = registry.sweep(&mut engine);
        assert_eq!(
            collected,
            vec![
                (ProcessKey(1), ExitStatus::Exited(0)),
                (ProcessKey(2), ExitStatus::Signaled(libc::SIGKILL))
            ]
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn unregistered_pids_are_discarded() {
        let mut registry = Registry::new();
        registry.insert(10, ProcessKey(1));
        let mut engine = engine_with(&[(99, ExitStatus::Exited(0)), (10, ExitStatus::Exited(4))]);

        let collected = registry.sweep(&mut engine);
        assert_eq!(collected, vec![(ProcessKey(1), ExitStatus::Exited(4))]);
    }

    #[test]
    fn collect_one_ignores_unknown_pids() {
        let mut registry = Registry::new();
        let mut engine = engine_with(&[(10, ExitStatus::Exited(0))]);
        assert_eq!(registry.collect_one(10, &mut engine), None);

        registry.insert(10, ProcessKey(3));
        assert_eq!(
            registry.collect_one(10, &mut engine),
            Some((ProcessKey(3), ExitStatus::Exited(0)))
        );
        assert!(!registry.contains(10));
    }
}
