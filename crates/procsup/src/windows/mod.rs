//! Windows spawn engine and its pure helpers
//!
//! Command-line quoting and environment-block construction are plain
//! functions over UTF-16 and are built and tested on every platform.

pub mod cmdline;
#[cfg(windows)]
pub mod engine;
pub mod envblock;

#[cfg(windows)]
pub use engine::WindowsEngine;
