//! Process-level wiring: the single loader context, one-time installation of
//! the fault handler, and `execute`.
//!
//! Signal handlers get no user pointer, so the context lives in a
//! process-wide `spin::Once`. It is written once by [`install_context`] and
//! only read afterwards; the backing file it owns therefore stays open for
//! the rest of the process.

use std::convert::Infallible;
use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use spin::Once;

use crate::error::LoaderError;
use crate::fault;
use crate::image::{self, ExecutableImage};
use crate::rt;
use crate::segment::SegmentTable;

/// Everything the fault path needs: the parsed image and the open backing
/// file it reads pages from.
#[derive(Debug)]
pub struct LoaderContext {
    image: ExecutableImage,
    file: File,
    page_size: usize,
    materialized: AtomicUsize,
}

impl LoaderContext {
    pub fn new(image: ExecutableImage, file: File) -> Self {
        LoaderContext {
            image,
            file,
            page_size: rt::page_size(),
            materialized: AtomicUsize::new(0),
        }
    }

    pub fn image(&self) -> &ExecutableImage {
        &self.image
    }

    pub fn segments(&self) -> &SegmentTable {
        self.image.segments()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn backing_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    /// Pages materialized so far across all segments.
    pub fn materialized_pages(&self) -> usize {
        self.materialized.load(Ordering::Relaxed)
    }

    pub(crate) fn record_materialized(&self) {
        self.materialized.fetch_add(1, Ordering::Relaxed);
    }
}

static CONTEXT: Once<LoaderContext> = Once::new();
static HANDLER: Once<Result<(), i32>> = Once::new();

/// Installs the page-fault handler. Only the first call registers anything;
/// later calls report the first call's outcome.
pub fn init_loader() -> Result<(), LoaderError> {
    let outcome = HANDLER.call_once(|| {
        // Cache the page size before any fault can need it.
        rt::page_size();
        fault::install().map_err(|e| e.raw_os_error().unwrap_or(0))
    });

    match *outcome {
        Ok(()) => Ok(()),
        Err(errno) => Err(LoaderError::SignalInstall(io::Error::from_raw_os_error(errno))),
    }
}

/// Publishes `ctx` as the context consulted by the fault handler. There is
/// one context per process; a second call fails and drops its argument.
pub fn install_context(ctx: LoaderContext) -> Result<&'static LoaderContext, LoaderError> {
    let mut fresh = false;
    let installed = CONTEXT.call_once(|| {
        fresh = true;
        ctx
    });
    if !fresh {
        return Err(LoaderError::AlreadyExecuting);
    }
    Ok(installed)
}

pub fn context() -> Option<&'static LoaderContext> {
    CONTEXT.get()
}

/// Runs the executable at `path` with demand paging. Does not return on
/// success; `argv` is handed to the image unchanged.
pub fn execute(path: &Path, argv: &[OsString]) -> Result<Infallible, LoaderError> {
    let name = path.display().to_string();
    let file = File::open(path).map_err(|source| LoaderError::Open {
        path: name.clone(),
        source,
    })?;

    let image = image::parse_file(&name, &file)?;
    init_loader()?;

    let ctx = install_context(LoaderContext::new(image, file))?;
    log::info!(
        "demand-loading {name}: {} segments, page size 0x{:x}",
        ctx.segments().len(),
        ctx.page_size()
    );

    image::start(ctx.image(), argv)
}
