use std::io;

use thiserror::Error;

/// Failures reported to the caller of [`crate::loader::execute`] before any
/// image code has run. Nothing has been mapped yet when one of these is
/// returned.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed executable {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("unsupported executable {path}: {reason}")]
    Unsupported { path: String, reason: String },

    #[error("segments {first} and {second} of {path} share page 0x{page:x}")]
    OverlappingSegments {
        path: String,
        first: usize,
        second: usize,
        page: usize,
    },

    #[error("no loadable segments in {path}")]
    NoLoadableSegments { path: String },

    #[error("cannot install fault handler: {0}")]
    SignalInstall(#[source] io::Error),

    #[error("an image is already executing in this process")]
    AlreadyExecuting,

    #[error("initial stack setup failed: {0}")]
    StackSetup(String),

    #[error("entering an image is not supported on {0}")]
    UnsupportedArch(&'static str),
}

/// Reasons a fault is escalated to the default signal disposition. None of
/// these is recoverable; they exist for logging and for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FaultError {
    #[error("no loader context installed")]
    NoContext,

    #[error("address 0x{addr:x} is outside every segment")]
    UnmappedAddress { addr: usize },

    #[error("page {page} of segment {segment} faulted again at 0x{addr:x}")]
    DoubleFault {
        addr: usize,
        segment: usize,
        page: usize,
    },

    #[error("read at file offset 0x{offset:x} failed (errno {errno})")]
    ReadFailure { offset: u64, errno: i32 },

    #[error("short read at file offset 0x{offset:x}: wanted {wanted}, got {got}")]
    ShortRead { offset: u64, wanted: usize, got: usize },

    #[error("mmap at 0x{addr:x} failed (errno {errno})")]
    MapFailure { addr: usize, errno: i32 },

    #[error("mprotect at 0x{addr:x} failed (errno {errno})")]
    ProtectFailure { addr: usize, errno: i32 },

    #[error("page at segment offset 0x{page_offset:x} has no consistent fill for file size 0x{file_size:x}")]
    InconsistentPage { page_offset: usize, file_size: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("page {0} is already mapped")]
    AlreadyMapped(usize),

    #[error("page {index} is out of range for {pages} tracked pages")]
    OutOfRange { index: usize, pages: usize },
}
