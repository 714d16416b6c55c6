//! Pipe channels: one descriptor, one direction

use super::endpoint::Endpoint;
use crate::reactor::RawSource;
use log::{debug, warn};
use std::io;

/// Registration state of a channel with the event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Active,
    Suspended,
    Closed,
}

/// Result of one bounded read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were placed at the start of the buffer
    Data(usize),
    /// Nothing available yet
    Pending,
    /// Peer closed its end
    Closed,
}

/// Result of draining a write buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Drained,
    Pending,
    Closed,
}

pub(crate) fn classify_read(result: io::Result<usize>) -> ReadOutcome {
    match result {
        Ok(0) => ReadOutcome::Closed,
        Ok(n) => ReadOutcome::Data(n),
        Err(e) if matches!(
            e.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        ) =>
        {
            ReadOutcome::Pending
        }
        Err(e) => {
            // A pty master reports EIO once the slave side is gone
            debug!("channel read ended: {}", e);
            ReadOutcome::Closed
        }
    }
}

/// Bytes waiting to be written
#[derive(Debug, Default)]
pub struct WriteBuffer {
    pending: Vec<u8>,
}

impl WriteBuffer {
    pub fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Write as much as the OS accepts and keep the rest
    pub fn flush(&mut self, endpoint: &Endpoint) -> FlushOutcome {
        while !self.pending.is_empty() {
            match endpoint.write(&self.pending) {
                Ok(0) => return FlushOutcome::Pending,
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return FlushOutcome::Pending,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if e.kind() == io::ErrorKind::BrokenPipe {
                        debug!("reader went away, dropping {} bytes", self.pending.len());
                    } else {
                        warn!("channel write failed: {}", e);
                    }
                    self.pending.clear();
                    return FlushOutcome::Closed;
                }
            }
        }
        FlushOutcome::Drained
    }
}

/// Parent reads what the child writes
#[derive(Debug)]
pub struct ReadChannel {
    endpoint: Option<Endpoint>,
    state: ChannelState,
}

impl ReadChannel {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint: Some(endpoint),
            state: ChannelState::Active,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn source(&self) -> Option<RawSource> {
        self.endpoint.as_ref().map(Endpoint::source)
    }

    /// One bounded non-blocking read
    pub fn read_once(&mut self, buf: &mut [u8]) -> ReadOutcome {
        let Some(endpoint) = &self.endpoint else {
            return ReadOutcome::Closed;
        };
        if self.state == ChannelState::Suspended {
            return ReadOutcome::Pending;
        }
        let outcome = classify_read(endpoint.read(buf));
        if outcome == ReadOutcome::Closed {
            self.close();
        }
        outcome
    }

    pub fn pause(&mut self) -> bool {
        if self.state == ChannelState::Active {
            self.state = ChannelState::Suspended;
            return true;
        }
        false
    }

    pub fn resume(&mut self) -> bool {
        if self.state == ChannelState::Suspended {
            self.state = ChannelState::Active;
            return true;
        }
        false
    }

    /// Returns false if already closed
    pub fn close(&mut self) -> bool {
        self.state = ChannelState::Closed;
        self.endpoint.take().is_some()
    }
}

/// Parent writes what the child reads
#[derive(Debug)]
pub struct WriteChannel {
    endpoint: Option<Endpoint>,
    buffer: WriteBuffer,
    close_after_drain: bool,
}

impl WriteChannel {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint: Some(endpoint),
            buffer: WriteBuffer::default(),
            close_after_drain: false,
        }
    }

    pub fn state(&self) -> ChannelState {
        if self.endpoint.is_some() {
            ChannelState::Active
        } else {
            ChannelState::Closed
        }
    }

    pub fn source(&self) -> Option<RawSource> {
        self.endpoint.as_ref().map(Endpoint::source)
    }

    /// Buffer `data`. Writes to a closed or closing channel are dropped.
    pub fn queue(&mut self, data: &[u8]) -> bool {
        if self.endpoint.is_none() || self.close_after_drain {
            return false;
        }
        self.buffer.push(data);
        true
    }

    pub fn wants_write(&self) -> bool {
        self.endpoint.is_some() && !self.buffer.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn flush(&mut self) -> FlushOutcome {
        let Some(endpoint) = &self.endpoint else {
            return FlushOutcome::Closed;
        };
        let outcome = match self.buffer.flush(endpoint) {
            FlushOutcome::Drained if self.close_after_drain => FlushOutcome::Closed,
            other => other,
        };
        if outcome == FlushOutcome::Closed {
            self.close();
        }
        outcome
    }

    /// Close now if nothing is buffered, otherwise once the buffer drains.
    /// Returns true when the channel closed immediately.
    pub fn request_close(&mut self) -> bool {
        if self.endpoint.is_none() {
            return false;
        }
        if self.buffer.is_empty() {
            return self.close();
        }
        self.close_after_drain = true;
        false
    }

    pub fn peer_closed(&self) -> bool {
        self.endpoint.as_ref().is_some_and(Endpoint::peer_closed)
    }

    /// Returns false if already closed
    pub fn close(&mut self) -> bool {
        self.buffer.clear();
        self.endpoint.take().is_some()
    }
}
