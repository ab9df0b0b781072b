//! User-space demand-paging loader.
//!
//! A static executable is started without mapping any of its segments. Every
//! first access to an image page raises `SIGSEGV`; the handler in [`fault`]
//! maps that one page, fills it from the executable file (or leaves it zero
//! for the BSS tail), applies the segment's permissions and lets the
//! instruction run again.

pub mod arith;
pub mod debug;
pub mod error;
pub mod fault;
pub mod image;
pub mod loader;
pub mod logger;
pub mod materialize;
pub mod rt;
pub mod segment;
pub mod stack;
pub mod tracker;

#[cfg(test)]
mod testutil;

pub use error::{FaultError, LoaderError};
pub use loader::{execute, init_loader};
