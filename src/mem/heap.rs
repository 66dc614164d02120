//! Global allocator backed by the paged region.
//!
//! Thread descriptors (and any application use of `alloc`) are allocated
//! bottom-up so that heap data stays at the low end of the region, far
//! from the top-down stacks.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use crate::config::PAGE_BYTES;
use crate::mem::SearchStrategy;

/// `GlobalAlloc` adapter over the kernel's paged allocator.
pub struct PagedHeap;

unsafe impl GlobalAlloc for PagedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Pages are PAGE_BYTES-aligned; stricter alignment is unsupported.
        if layout.align() > PAGE_BYTES {
            return ptr::null_mut();
        }

        match crate::kernel::kernel().allocate(layout.size(), SearchStrategy::BottomUp) {
            Some(region) => region.base,
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        crate::kernel::kernel().free(ptr, layout.size());
    }
}

#[cfg(all(target_arch = "avr", not(test), not(feature = "std-shim")))]
#[global_allocator]
static HEAP: PagedHeap = PagedHeap;
