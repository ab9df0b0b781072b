use crate::error::TrackerError;
use crate::segment::Segment;

/// Which pages of one segment have been materialized. Sized once, on first
/// touch, and never grown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTracker {
    mapped: Box<[bool]>,
}

impl PageTracker {
    pub fn new(pages: usize) -> Self {
        PageTracker {
            mapped: vec![false; pages].into_boxed_slice(),
        }
    }

    pub fn for_segment(segment: &Segment, page_size: usize) -> Self {
        PageTracker::new(segment.page_count(page_size))
    }

    pub fn len(&self) -> usize {
        self.mapped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapped.is_empty()
    }

    pub fn is_mapped(&self, index: usize) -> bool {
        self.mapped.get(index).copied().unwrap_or(false)
    }

    /// Flips the flag for `index`. A page is marked exactly once; a second
    /// mark is an inconsistency the caller must escalate.
    pub fn mark_mapped(&mut self, index: usize) -> Result<(), TrackerError> {
        let pages = self.mapped.len();
        let slot = self
            .mapped
            .get_mut(index)
            .ok_or(TrackerError::OutOfRange { index, pages })?;
        if *slot {
            return Err(TrackerError::AlreadyMapped(index));
        }
        *slot = true;
        Ok(())
    }

    pub fn mapped_count(&self) -> usize {
        self.mapped.iter().filter(|m| **m).count()
    }
}

/// Creates the tracker for `segment` if it does not exist yet. Idempotent.
pub fn ensure_initialized<'a>(
    state: &'a mut Option<PageTracker>,
    segment: &Segment,
    page_size: usize,
) -> &'a mut PageTracker {
    state.get_or_insert_with(|| PageTracker::for_segment(segment, page_size))
}
