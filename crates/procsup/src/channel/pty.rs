//! Pseudo-terminal channel: one master descriptor, two logical roles
//!
//! The reader role carries the child's terminal output (reported as child
//! fd 1) and the writer role carries its input (child fd 0). The master
//! descriptor is released only after both roles have retired.

use super::endpoint::Endpoint;
use super::pipe::{ChannelState, FlushOutcome, ReadOutcome, WriteBuffer, classify_read};
use crate::reactor::RawSource;

/// Child fd reported for terminal input
pub const PTY_INPUT_FD: i32 = 0;
/// Child fd reported for terminal output
pub const PTY_OUTPUT_FD: i32 = 1;

#[derive(Debug)]
pub struct PtyChannel {
    endpoint: Option<Endpoint>,
    reading: ChannelState,
    writer_open: bool,
    buffer: WriteBuffer,
}

impl PtyChannel {
    pub fn new(master: Endpoint) -> Self {
        Self {
            endpoint: Some(master),
            reading: ChannelState::Active,
            writer_open: true,
            buffer: WriteBuffer::default(),
        }
    }

    pub fn source(&self) -> Option<RawSource> {
        self.endpoint.as_ref().map(Endpoint::source)
    }

    pub fn reader_state(&self) -> ChannelState {
        self.reading
    }

    pub fn reader_open(&self) -> bool {
        self.reading != ChannelState::Closed
    }

    pub fn writer_open(&self) -> bool {
        self.writer_open
    }

    pub fn is_retired(&self) -> bool {
        !self.reader_open() && !self.writer_open
    }

    /// One bounded read from the terminal. `Closed` means the slave side is
    /// gone; the caller retires both roles.
    pub fn read_once(&mut self, buf: &mut [u8]) -> ReadOutcome {
        let Some(endpoint) = &self.endpoint else {
            return ReadOutcome::Closed;
        };
        match self.reading {
            ChannelState::Closed => ReadOutcome::Closed,
            ChannelState::Suspended => ReadOutcome::Pending,
            ChannelState::Active => classify_read(endpoint.read(buf)),
        }
    }

    pub fn queue(&mut self, data: &[u8]) -> bool {
        if !self.writer_open {
            return false;
        }
        self.buffer.push(data);
        true
    }

    pub fn wants_write(&self) -> bool {
        self.writer_open && !self.buffer.is_empty()
    }

    /// Drain terminal input. `Closed` means the writer role failed; the
    /// caller retires it.
    pub fn flush(&mut self) -> FlushOutcome {
        match (&self.endpoint, self.writer_open) {
            (Some(endpoint), true) => self.buffer.flush(endpoint),
            _ => FlushOutcome::Closed,
        }
    }

    pub fn pause(&mut self) -> bool {
        if self.reading == ChannelState::Active {
            self.reading = ChannelState::Suspended;
            return true;
        }
        false
    }

    pub fn resume(&mut self) -> bool {
        if self.reading == ChannelState::Suspended {
            self.reading = ChannelState::Active;
            return true;
        }
        false
    }

    /// Returns true if the role was open
    pub fn retire_reader(&mut self) -> bool {
        let was_open = self.reader_open();
        self.reading = ChannelState::Closed;
        self.release_if_retired();
        was_open
    }

    /// Returns true if the role was open
    pub fn retire_writer(&mut self) -> bool {
        let was_open = self.writer_open;
        self.writer_open = false;
        self.buffer.clear();
        self.release_if_retired();
        was_open
    }

    /// Retire both roles; returns the child fds whose role was still open,
    /// input first
    pub fn retire_all(&mut self) -> Vec<i32> {
        let mut retired = Vec::with_capacity(2);
        if self.retire_writer() {
            retired.push(PTY_INPUT_FD);
        }
        if self.retire_reader() {
            retired.push(PTY_OUTPUT_FD);
        }
        retired
    }

    fn release_if_retired(&mut self) {
        if self.is_retired() {
            self.endpoint = None;
        }
    }
}
