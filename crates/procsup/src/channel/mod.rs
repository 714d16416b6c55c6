//! Non-blocking I/O channels between the supervisor and a child
//!
//! Each channel owns one parent-side descriptor exclusively. Pipe channels
//! carry one direction; the pty channel multiplexes both directions over the
//! terminal master.

pub mod endpoint;
pub mod pipe;
pub mod pty;

pub use endpoint::Endpoint;
pub use pipe::{ChannelState, FlushOutcome, ReadChannel, ReadOutcome, WriteChannel};
pub use pty::{PTY_INPUT_FD, PTY_OUTPUT_FD, PtyChannel};

use crate::reactor::RawSource;

/// Channel kinds as handed from a spawn engine to the supervisor
#[derive(Debug)]
pub enum Channel {
    /// Parent reads child output
    Reader(ReadChannel),
    /// Parent writes child input
    Writer(WriteChannel),
    /// Combined terminal channel
    Pty(PtyChannel),
}

impl Channel {
    pub fn source(&self) -> Option<RawSource> {
        match self {
            Channel::Reader(c) => c.source(),
            Channel::Writer(c) => c.source(),
            Channel::Pty(c) => c.source(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.source().is_none()
    }

    pub fn is_pty(&self) -> bool {
        matches!(self, Channel::Pty(_))
    }
}
