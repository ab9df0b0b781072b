//! Fixtures shared by the unit tests: a `PROT_NONE` address range the fault
//! path can map over, and throwaway backing files.

use std::fs::File;
use std::io::Write;

use crate::rt;

/// Kernel-chosen, inaccessible address range. Unmapped on drop.
pub struct Reservation {
    base: usize,
    len: usize,
}

impl Reservation {
    pub fn new(pages: usize) -> Self {
        let len = pages * rt::page_size();
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED, "reservation of {pages} pages failed");
        Reservation {
            base: ptr as usize,
            len,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// # Safety
    /// The requested range must already be mapped readable.
    pub unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.len);
        unsafe { std::slice::from_raw_parts((self.base + offset) as *const u8, len) }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

pub fn backing_file(contents: &[u8]) -> File {
    let mut file = tempfile::tempfile().expect("tempfile");
    file.write_all(contents).expect("write backing file");
    file
}

/// Deterministic non-trivial bytes, so misplaced copies are visible.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8 ^ (i >> 8) as u8).collect()
}
