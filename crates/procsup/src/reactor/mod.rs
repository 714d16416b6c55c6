//! Event-loop interface the supervisor registers its channels with
//!
//! The supervisor does not own a loop. It tells a [`Reactor`] which channel
//! wants which readiness, and the embedding loop calls back into
//! [`crate::Supervisor::on_readable`] / [`crate::Supervisor::on_writable`].

#[cfg(unix)]
pub mod poll;

#[cfg(unix)]
pub use poll::{PollReactor, Readiness};

use std::collections::BTreeMap;

/// Identifies one registered channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

/// OS object a loop waits on
#[cfg(unix)]
pub type RawSource = std::os::fd::RawFd;
#[cfg(windows)]
pub type RawSource = std::os::windows::io::RawHandle;

/// Readiness registration surface of an event loop
pub trait Reactor {
    fn register_readable(&mut self, token: Token, source: RawSource);
    fn register_writable(&mut self, token: Token, source: RawSource);
    fn unregister_readable(&mut self, token: Token);
    fn unregister_writable(&mut self, token: Token);

    fn unregister(&mut self, token: Token) {
        self.unregister_readable(token);
        self.unregister_writable(token);
    }
}

/// Plain interest table
#[derive(Debug, Default)]
pub struct Interests {
    readable: BTreeMap<Token, RawSource>,
    writable: BTreeMap<Token, RawSource>,
}

impl Interests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_readable(&self, token: Token) -> bool {
        self.readable.contains_key(&token)
    }

    pub fn is_writable(&self, token: Token) -> bool {
        self.writable.contains_key(&token)
    }

    pub fn readable(&self) -> impl Iterator<Item = (Token, RawSource)> + '_ {
        self.readable.iter().map(|(t, s)| (*t, *s))
    }

    pub fn writable(&self) -> impl Iterator<Item = (Token, RawSource)> + '_ {
        self.writable.iter().map(|(t, s)| (*t, *s))
    }

    pub fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.writable.is_empty()
    }

    pub fn len(&self) -> usize {
        self.readable.len() + self.writable.len()
    }
}

impl Reactor for Interests {
    fn register_readable(&mut self, token: Token, source: RawSource) {
        self.readable.insert(token, source);
    }

    fn register_writable(&mut self, token: Token, source: RawSource) {
        self.writable.insert(token, source);
    }

    fn unregister_readable(&mut self, token: Token) {
        self.readable.remove(&token);
    }

    fn unregister_writable(&mut self, token: Token) {
        self.writable.remove(&token);
    }
}
