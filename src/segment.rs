use bitflags::bitflags;
use spin::{Mutex, MutexGuard};

use crate::arith;
use crate::rt;
use crate::tracker::PageTracker;

bitflags! {
    /// Access permissions of a segment. Bit values match ELF `p_flags`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SegmentPerms: u32 {
        const EXEC = 0x1;
        const WRITE = 0x2;
        const READ = 0x4;
    }
}

impl SegmentPerms {
    pub fn from_elf_flags(flags: xmas_elf::program::Flags) -> Self {
        let mut perms = SegmentPerms::empty();
        if flags.is_read() {
            perms |= SegmentPerms::READ;
        }
        if flags.is_write() {
            perms |= SegmentPerms::WRITE;
        }
        if flags.is_execute() {
            perms |= SegmentPerms::EXEC;
        }
        perms
    }

    /// `PROT_*` bits for `mprotect`.
    pub fn to_prot(self) -> i32 {
        let mut prot = rt::PROT_NONE;
        if self.contains(SegmentPerms::READ) {
            prot |= rt::PROT_READ;
        }
        if self.contains(SegmentPerms::WRITE) {
            prot |= rt::PROT_WRITE;
        }
        if self.contains(SegmentPerms::EXEC) {
            prot |= rt::PROT_EXEC;
        }
        prot
    }

    pub fn render(self) -> String {
        let mut out = String::with_capacity(3);
        out.push(if self.contains(SegmentPerms::READ) { 'R' } else { '-' });
        out.push(if self.contains(SegmentPerms::WRITE) { 'W' } else { '-' });
        out.push(if self.contains(SegmentPerms::EXEC) { 'X' } else { '-' });
        out
    }
}

/// One contiguous region of the image's address space.
///
/// Everything except the page tracking state is fixed after parsing. The
/// tracking state starts absent and is created by the fault path the first
/// time any page of the segment faults.
#[derive(Debug)]
pub struct Segment {
    pub vaddr: usize,
    pub mem_size: usize,
    pub file_offset: u64,
    pub file_size: usize,
    pub perms: SegmentPerms,
    pages: Mutex<Option<PageTracker>>,
}

impl Segment {
    pub fn new(vaddr: usize, mem_size: usize, file_offset: u64, file_size: usize, perms: SegmentPerms) -> Self {
        debug_assert!(file_size <= mem_size, "file_size 0x{file_size:x} > mem_size 0x{mem_size:x}");
        Segment {
            vaddr,
            mem_size,
            file_offset,
            file_size,
            perms,
            pages: Mutex::new(None),
        }
    }

    /// Exclusive end of `[vaddr, vaddr + mem_size)`.
    pub fn end(&self) -> usize {
        self.vaddr.saturating_add(self.mem_size)
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.vaddr && addr < self.end()
    }

    pub fn page_count(&self, page_size: usize) -> usize {
        arith::page_count(self.mem_size, page_size)
    }

    /// `floor((addr - vaddr) / page_size)`. `addr` must be inside the segment.
    pub fn page_index(&self, addr: usize, page_size: usize) -> usize {
        (addr - self.vaddr) / page_size
    }

    pub fn page_addr(&self, index: usize, page_size: usize) -> Option<usize> {
        index
            .checked_mul(page_size)
            .and_then(|off| self.vaddr.checked_add(off))
    }

    /// Locks the tracking state. Check, mark and materialize all happen under
    /// this one guard.
    pub fn lock_pages(&self) -> MutexGuard<'_, Option<PageTracker>> {
        self.pages.lock()
    }
}

/// Segments in the order the parser produced them. Read-only after
/// construction.
#[derive(Debug, Default)]
pub struct SegmentTable {
    segments: Vec<Segment>,
}

impl SegmentTable {
    pub fn new(segments: Vec<Segment>) -> Self {
        SegmentTable { segments }
    }

    /// The unique segment whose half-open range contains `addr`. Ranges are
    /// non-overlapping by the parser's contract, so the first hit wins.
    pub fn lookup(&self, addr: usize) -> Option<(usize, &Segment)> {
        self.segments
            .iter()
            .enumerate()
            .find(|(_, seg)| seg.contains(addr))
    }

    pub fn get(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}
