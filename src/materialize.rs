//! Page materialization: one fixed-address page, filled from the backing file
//! or left zero, then locked down to the segment's permissions.

use std::os::fd::BorrowedFd;

use crate::error::FaultError;
use crate::rt;
use crate::segment::Segment;

/// Where the bytes of one page come from, relative to the segment's on-file
/// extent `[0, file_size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFill {
    /// Page lies entirely inside the file extent.
    File { file_offset: u64, len: usize },
    /// Page straddles the end of the file extent: `len` file bytes, then zeros.
    Partial { file_offset: u64, len: usize },
    /// Page lies entirely in the BSS tail.
    Zero,
}

pub fn classify(segment: &Segment, page_index: usize, page_size: usize) -> Result<PageFill, FaultError> {
    let page_start = page_index
        .checked_mul(page_size)
        .ok_or(FaultError::InconsistentPage {
            page_offset: usize::MAX,
            file_size: segment.file_size,
        })?;
    let inconsistent = FaultError::InconsistentPage {
        page_offset: page_start,
        file_size: segment.file_size,
    };
    let page_end = page_start.checked_add(page_size).ok_or(inconsistent)?;
    let file_size = segment.file_size;

    let file_offset = || {
        segment
            .file_offset
            .checked_add(page_start as u64)
            .ok_or(inconsistent)
    };

    if page_end <= file_size {
        Ok(PageFill::File {
            file_offset: file_offset()?,
            len: page_size,
        })
    } else if page_start >= file_size {
        Ok(PageFill::Zero)
    } else if page_start < file_size && file_size < page_end {
        Ok(PageFill::Partial {
            file_offset: file_offset()?,
            len: file_size - page_start,
        })
    } else {
        Err(inconsistent)
    }
}

/// Maps page `page_index` of `segment` and returns its address.
///
/// The page is mapped read/write first so it can be filled, and only then
/// switched to the segment's permissions. If filling or protecting fails the
/// page is left `PROT_NONE`, so the re-executed access still faults.
pub fn materialize_page(
    segment: &Segment,
    page_index: usize,
    file: BorrowedFd<'_>,
    page_size: usize,
) -> Result<usize, FaultError> {
    let fill = classify(segment, page_index, page_size)?;
    let addr = segment
        .page_addr(page_index, page_size)
        .ok_or(FaultError::InconsistentPage {
            page_offset: page_index.saturating_mul(page_size),
            file_size: segment.file_size,
        })?;

    let page = rt::rt_mmap_fixed_rw(addr, page_size)?;

    let populated = populate(page, fill, file)
        .and_then(|()| rt::rt_mprotect(page, page_size, segment.perms.to_prot()));
    if let Err(err) = populated {
        let _ = rt::rt_mprotect(page, page_size, rt::PROT_NONE);
        return Err(err);
    }

    log::debug!("materialized page 0x{addr:x} ({fill:?}) perms={:?}", segment.perms);
    Ok(addr)
}

fn populate(page: *mut u8, fill: PageFill, file: BorrowedFd<'_>) -> Result<(), FaultError> {
    match fill {
        PageFill::File { file_offset, len } | PageFill::Partial { file_offset, len } => {
            // Fresh anonymous pages are zero, so a partial read leaves the
            // tail already cleared.
            let buf = unsafe { std::slice::from_raw_parts_mut(page, len) };
            rt::rt_pread_exact(file, file_offset, buf)
        }
        PageFill::Zero => Ok(()),
    }
}
