//! Bitmap bookkeeping for the paged allocator.
//!
//! One bit per page, set when the page is used. Allocation is a single
//! pass over the map looking for a contiguous run of free pages; the
//! [`SearchStrategy`] decides whether that pass walks from the bottom of
//! the region or the top. Stacks grow downward on the target, so the
//! factory allocates them [`TopDown`](SearchStrategy::TopDown) to keep
//! them far away from heap data, which is allocated bottom-up.

use crate::config::PAGE_BYTES;

/// Direction in which the allocator searches for free pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStrategy {
    /// Search from the last page toward the first.
    TopDown,
    /// Search from the first page toward the last.
    BottomUp,
}

/// A successful allocation: the region base and its rounded-up length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Lowest address of the region.
    pub base: *mut u8,
    /// Length in bytes, always a whole number of pages.
    pub len: usize,
}

/// Rounds a byte count up to whole pages. Zero-byte requests stay zero.
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_BYTES)
}

/// A bitmap over `pages` pages, stored in `MAP_BYTES` bytes.
pub struct PageMap<const MAP_BYTES: usize> {
    map: [u8; MAP_BYTES],
    pages: usize,
}

impl<const MAP_BYTES: usize> PageMap<MAP_BYTES> {
    /// Creates a map with every page free.
    pub const fn new(pages: usize) -> PageMap<MAP_BYTES> {
        assert!(pages <= MAP_BYTES * 8, "bitmap too small for page count");
        PageMap {
            map: [0; MAP_BYTES],
            pages,
        }
    }

    /// `true` when `page` is not marked used.
    pub fn is_free(&self, page: usize) -> bool {
        self.map[page >> 3] & (1 << (page & 0b111)) == 0
    }

    fn mark_used(&mut self, page: usize) {
        self.map[page >> 3] |= 1 << (page & 0b111);
    }

    fn mark_free(&mut self, page: usize) {
        self.map[page >> 3] &= !(1 << (page & 0b111));
    }

    /// Number of pages under management.
    pub fn total(&self) -> usize {
        self.pages
    }

    /// Number of pages currently marked used.
    pub fn used(&self) -> usize {
        (0..self.pages).filter(|&p| !self.is_free(p)).count()
    }

    /// Number of pages currently free.
    pub fn free(&self) -> usize {
        self.pages - self.used()
    }

    /// Finds a run of `len` contiguous free pages and returns the lowest
    /// page of the run, without marking anything.
    ///
    /// A single pass visits pages in the order the strategy dictates; any
    /// used page restarts the run. With `TopDown` the pass walks downward,
    /// so the run's lowest page is the one visited last — the returned
    /// region is still `[base, base + len)` in ascending order.
    pub fn find_free_run(&self, len: usize, strategy: SearchStrategy) -> Option<usize> {
        if len == 0 || len > self.pages {
            return None;
        }

        let mut start: Option<usize> = None;
        let mut count = 0;

        for step in 0..self.pages {
            let page = match strategy {
                SearchStrategy::BottomUp => step,
                SearchStrategy::TopDown => self.pages - 1 - step,
            };

            if self.is_free(page) {
                count += 1;
                let first = *start.get_or_insert(page);
                if count == len {
                    return Some(first.min(page));
                }
            } else {
                start = None;
                count = 0;
            }
        }

        None
    }

    /// Marks `len` pages starting at `start` as used.
    pub fn claim_run(&mut self, start: usize, len: usize) {
        for page in start..start + len {
            debug_assert!(self.is_free(page), "claiming a used page");
            self.mark_used(page);
        }
    }

    /// Marks `len` pages starting at `start` as free.
    pub fn release_run(&mut self, start: usize, len: usize) {
        for page in start..start + len {
            self.mark_free(page);
        }
    }
}
