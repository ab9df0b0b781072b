//! The page-fault dispatcher.
//!
//! Each `SIGSEGV` is one independent transaction:
//!
//! ```text
//! Idle -> Handling -+-> Resolved  (page materialized, instruction re-runs)
//!                   +-> Escalate  (SIG_DFL restored, instruction re-runs and
//!                                  the kernel terminates the process)
//! ```
//!
//! Escalation happens for addresses outside every segment, for a second fault
//! on a page that is already resident, and for any failure while
//! materializing. It is never repaired.

use std::ffi::c_void;
use std::io;

use crate::error::FaultError;
use crate::loader::{self, LoaderContext};
use crate::materialize;
use crate::rt;
use crate::tracker;

/// The page a fault was resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedFault {
    pub segment: usize,
    pub page: usize,
    pub page_addr: usize,
}

/// Outcome of one fault transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Resolved(ResolvedFault),
    Escalate(FaultError),
}

impl From<Result<ResolvedFault, FaultError>> for Disposition {
    fn from(result: Result<ResolvedFault, FaultError>) -> Self {
        match result {
            Ok(resolved) => Disposition::Resolved(resolved),
            Err(err) => Disposition::Escalate(err),
        }
    }
}

/// Resolves a fault at `addr` against `ctx`, materializing the page if this
/// is its first fault.
///
/// The segment's tracker lock is held across check, mark and materialize, so
/// concurrent faults on the same segment are serialized.
pub fn handle_fault(ctx: &LoaderContext, addr: usize) -> Result<ResolvedFault, FaultError> {
    let page_size = ctx.page_size();
    let (index, segment) = ctx
        .segments()
        .lookup(addr)
        .ok_or(FaultError::UnmappedAddress { addr })?;
    let page = segment.page_index(addr, page_size);

    let mut state = segment.lock_pages();
    let pages = tracker::ensure_initialized(&mut state, segment, page_size);

    let double_fault = FaultError::DoubleFault {
        addr,
        segment: index,
        page,
    };
    if pages.is_mapped(page) {
        return Err(double_fault);
    }
    pages.mark_mapped(page).map_err(|_| double_fault)?;

    let page_addr = materialize::materialize_page(segment, page, ctx.backing_fd(), page_size)?;
    ctx.record_materialized();

    Ok(ResolvedFault {
        segment: index,
        page,
        page_addr,
    })
}

/// Full transaction for the installed context, if any.
pub fn dispatch(addr: usize) -> Disposition {
    match loader::context() {
        Some(ctx) => handle_fault(ctx, addr).into(),
        None => Disposition::Escalate(FaultError::NoContext),
    }
}

extern "C" fn segv_handler(signum: i32, info: *mut libc::siginfo_t, _uctx: *mut c_void) {
    let addr = unsafe { rt::fault_address(info) };
    log::trace!("fault at 0x{addr:x}");

    match dispatch(addr) {
        Disposition::Resolved(resolved) => {
            log::trace!(
                "fault at 0x{addr:x} resolved to segment {} page {}",
                resolved.segment,
                resolved.page
            );
        }
        Disposition::Escalate(err) => {
            log::warn!("escalating fault at 0x{addr:x}: {err}");
            rt::rt_restore_default(signum);
        }
    }
}

/// Registers the dispatcher for `SIGSEGV`. Callers go through
/// [`loader::init_loader`], which makes this happen at most once.
pub(crate) fn install() -> io::Result<()> {
    rt::rt_install_handler(libc::SIGSEGV, segv_handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ExecutableImage;
    use crate::segment::{Segment, SegmentPerms, SegmentTable};
    use crate::testutil::{backing_file, pattern, Reservation};

    struct Fixture {
        region: Reservation,
        contents: Vec<u8>,
        ctx: LoaderContext,
    }

    /// Two segments inside one reservation: a two-page file-backed text
    /// segment and a one-page BSS segment, with a gap page between them.
    fn fixture() -> Fixture {
        let pg = rt::page_size();
        let region = Reservation::new(4);
        let contents = pattern(3 * pg);
        let file = backing_file(&contents);

        let segments = SegmentTable::new(vec![
            Segment::new(region.base(), 2 * pg, pg as u64, pg + pg / 4, SegmentPerms::READ),
            Segment::new(
                region.base() + 3 * pg,
                pg,
                0,
                0,
                SegmentPerms::READ | SegmentPerms::WRITE,
            ),
        ]);
        let image = ExecutableImage::new("fixture", region.base() as u64, segments);
        let ctx = LoaderContext::new(image, file);
        Fixture { region, contents, ctx }
    }

    #[test]
    fn first_fault_materializes_the_page() {
        let f = fixture();
        let pg = f.ctx.page_size();

        let resolved = handle_fault(&f.ctx, f.region.base() + 17).unwrap();
        assert_eq!(
            resolved,
            ResolvedFault {
                segment: 0,
                page: 0,
                page_addr: f.region.base()
            }
        );
        assert_eq!(unsafe { f.region.bytes(0, pg) }, &f.contents[pg..2 * pg]);
        assert_eq!(f.ctx.materialized_pages(), 1);
    }

    #[test]
    fn refault_on_resident_page_escalates() {
        let f = fixture();
        let pg = f.ctx.page_size();
        let addr = f.region.base() + pg + 8;

        handle_fault(&f.ctx, addr).unwrap();
        assert_eq!(
            handle_fault(&f.ctx, addr),
            Err(FaultError::DoubleFault {
                addr,
                segment: 0,
                page: 1
            })
        );
        // Another address on the same page is the same resident page.
        assert!(matches!(
            handle_fault(&f.ctx, f.region.base() + pg),
            Err(FaultError::DoubleFault { page: 1, .. })
        ));
        assert_eq!(f.ctx.materialized_pages(), 1);
    }

    #[test]
    fn straddling_page_is_file_then_zero() {
        let f = fixture();
        let pg = f.ctx.page_size();

        handle_fault(&f.ctx, f.region.base() + pg).unwrap();
        let page = unsafe { f.region.bytes(pg, pg) };
        let split = pg / 4;
        assert_eq!(&page[..split], &f.contents[2 * pg..2 * pg + split]);
        assert!(page[split..].iter().all(|b| *b == 0));
    }

    #[test]
    fn bss_segment_page_is_zero() {
        let f = fixture();
        let pg = f.ctx.page_size();

        let resolved = handle_fault(&f.ctx, f.region.base() + 3 * pg + pg - 1).unwrap();
        assert_eq!(resolved.segment, 1);
        assert!(unsafe { f.region.bytes(3 * pg, pg) }.iter().all(|b| *b == 0));
    }

    #[test]
    fn address_outside_segments_leaves_trackers_alone() {
        let f = fixture();
        let pg = f.ctx.page_size();
        let gap = f.region.base() + 2 * pg;

        assert_eq!(
            handle_fault(&f.ctx, gap),
            Err(FaultError::UnmappedAddress { addr: gap })
        );
        assert_eq!(handle_fault(&f.ctx, 0), Err(FaultError::UnmappedAddress { addr: 0 }));
        for seg in f.ctx.segments().iter() {
            assert!(seg.lock_pages().is_none());
        }
        assert_eq!(f.ctx.materialized_pages(), 0);
    }

    #[test]
    fn every_page_materializes_at_most_once() {
        let f = fixture();
        let pg = f.ctx.page_size();
        let addrs = [0, 5, pg, pg + 9, 3 * pg, 3 * pg + 1, 0];

        let resolved = addrs
            .iter()
            .filter(|off| handle_fault(&f.ctx, f.region.base() + **off).is_ok())
            .count();
        assert_eq!(resolved, 3);
        assert_eq!(f.ctx.materialized_pages(), 3);

        let text = f.ctx.segments().get(0).unwrap().lock_pages();
        assert_eq!(text.as_ref().map(|t| t.mapped_count()), Some(2));
    }

    #[test]
    fn disposition_from_result() {
        let err = FaultError::UnmappedAddress { addr: 1 };
        assert_eq!(Disposition::from(Err(err)), Disposition::Escalate(err));
    }
}
