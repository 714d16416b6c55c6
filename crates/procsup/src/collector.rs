//! Ready-made protocol that buffers a process's output until it ends

use futures::channel::oneshot;
use log::debug;
use procsup_core::Termination;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::supervisor::{ProcessProtocol, Transport};

/// Everything a finished process produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collected {
    pub pid: Option<u32>,
    /// Bytes read per child fd
    pub outputs: BTreeMap<i32, Vec<u8>>,
    pub termination: Termination,
}

impl Collected {
    pub fn output(&self, child_fd: i32) -> &[u8] {
        self.outputs.get(&child_fd).map_or(&[], Vec::as_slice)
    }

    pub fn stdout(&self) -> &[u8] {
        self.output(1)
    }

    pub fn stderr(&self) -> &[u8] {
        self.output(2)
    }
}

/// Feeds optional input to stdin, closes it, and collects every output
/// channel. The result arrives on the receiver returned by [`Collector::new`].
#[derive(Debug)]
pub struct Collector {
    input: Option<Vec<u8>>,
    pid: Option<u32>,
    outputs: BTreeMap<i32, Vec<u8>>,
    sender: Option<oneshot::Sender<Collected>>,
}

impl Collector {
    pub fn new() -> (Self, oneshot::Receiver<Collected>) {
        let (sender, receiver) = oneshot::channel();
        let collector = Self {
            input: None,
            pid: None,
            outputs: BTreeMap::new(),
            sender: Some(sender),
        };
        (collector, receiver)
    }

    pub fn with_input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }
}

impl ProcessProtocol for Collector {
    fn connection_established(&mut self, transport: &mut Transport<'_>) {
        self.pid = transport.pid();
        if let Some(input) = self.input.take()
            && let Err(e) = transport.write(&input)
        {
            debug!("Collector could not queue input: {}", e);
        }
        if let Err(e) = transport.close_stdin() {
            debug!("Collector left stdin open: {}", e);
        }
    }

    fn data_received(&mut self, _transport: &mut Transport<'_>, child_fd: i32, data: &[u8]) {
        self.outputs
            .entry(child_fd)
            .or_default()
            .extend_from_slice(data);
    }

    fn process_ended(&mut self, termination: Termination) {
        let Some(sender) = self.sender.take() else {
            return;
        };
        let collected = Collected {
            pid: self.pid,
            outputs: std::mem::take(&mut self.outputs),
            termination,
        };
        if sender.send(collected).is_err() {
            debug!("Collector result dropped: receiver is gone");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::reactor::Interests;
    use crate::request::SpawnRequest;
    use crate::supervisor::Supervisor;
    use crate::test_support::ScriptedEngine;
    use procsup_core::ExitStatus;
    use std::io::{Read, Write};

    #[test]
    fn collects_output_and_forwards_input() {
        let mut sup = Supervisor::new(ScriptedEngine::new(), Interests::new());
        let request = SpawnRequest::builder("/bin/cat").build().unwrap();
        let (collector, mut receiver) = Collector::new();
        let key = sup
            .spawn_with(&request, collector.with_input("abc"))
            .unwrap();
        let pid = sup.transport(key).pid().unwrap();
        let far = sup.engine().far.clone();

        // Input is flushed and stdin closes once drained
        sup.pump();
        let mut input = Vec::new();
        far.borrow_mut()
            .get_mut(&pid)
            .unwrap()
            .inputs
            .get_mut(&0)
            .unwrap()
            .read_to_end(&mut input)
            .unwrap();
        assert_eq!(input, b"abc");

        {
            let mut ends = far.borrow_mut();
            let ends = ends.get_mut(&pid).unwrap();
            ends.outputs.get_mut(&1).unwrap().write_all(b"out").unwrap();
            ends.outputs.get_mut(&2).unwrap().write_all(b"err").unwrap();
            ends.close_all_but(-1);
        }
        sup.engine_mut().exited.push_back((pid, ExitStatus::Exited(0)));
        for _ in 0..5 {
            sup.pump();
        }

        let collected = receiver.try_recv().unwrap().expect("process ended");
        assert_eq!(collected.pid, Some(pid));
        assert_eq!(collected.stdout(), b"out");
        assert_eq!(collected.stderr(), b"err");
        assert_eq!(collected.termination, Termination::Exited(ExitStatus::Exited(0)));
    }

    #[test]
    fn nothing_arrives_before_the_end() {
        let mut sup = Supervisor::new(ScriptedEngine::new(), Interests::new());
        let request = SpawnRequest::builder("/bin/true").build().unwrap();
        let (collector, mut receiver) = Collector::new();
        sup.spawn_with(&request, collector).unwrap();
        sup.pump();
        assert_eq!(receiver.try_recv().unwrap(), None);
    }
}
