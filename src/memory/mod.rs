/*
 * Memory Management
 *
 * The threading core's only memory concern is the pool of page slabs that
 * back thread control blocks: one 4 KiB unit per thread, control block at
 * the bottom, kernel stack growing down from the top.
 */

pub mod page_pool;

pub use page_pool::{PagePool, PoolFlags};

/// Allocation unit: control block plus kernel stack share one of these.
pub const PAGE_SIZE: usize = 4096;

/// Backing storage for a `PagePool`: `N` page slabs, page-aligned.
///
/// Kernel binaries place one in a static; tests leak one on the heap.
#[repr(C, align(4096))]
pub struct PageArena<const N: usize>([[u8; PAGE_SIZE]; N]);

impl<const N: usize> PageArena<N> {
    pub const fn new() -> Self {
        Self([[0; PAGE_SIZE]; N])
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr().cast()
    }
}

impl<const N: usize> Default for PageArena<N> {
    fn default() -> Self {
        Self::new()
    }
}
