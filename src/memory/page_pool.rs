/*
 * Thread Page Pool
 *
 * Bitmap-based allocator for the 4 KiB slabs that back thread control
 * blocks. Each slab holds the control block at its base and the thread's
 * kernel stack in the remainder.
 *
 * Unlike a boot-time frame allocator this is an owned value: the scheduler
 * context holds one, constructed over a caller-supplied arena, so tests can
 * build private pools and watch exhaustion and reclamation directly.
 */

use bitflags::bitflags;
use core::ptr::NonNull;

use super::{PAGE_SIZE, PageArena};

/// Upper bound on pool capacity, one bitmap bit per page.
pub const MAX_POOL_PAGES: usize = 64;
const BITMAP_WORDS: usize = MAX_POOL_PAGES / 64;

bitflags! {
    /// Allocation behavior flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PoolFlags: u32 {
        /// Zero the page before handing it out.
        const ZERO = 1 << 0;
        /// Treat exhaustion as a fatal fault instead of returning None.
        const ASSERT = 1 << 1;
    }
}

/// Fixed-size pool of page slabs over one contiguous aligned region.
///
/// Bit set = page used. All methods take `&mut self`; mutual exclusion is the
/// caller's interrupt-off critical section, not an internal lock.
pub struct PagePool {
    base: NonNull<u8>,
    pages: usize,
    bitmap: [u64; BITMAP_WORDS],
    used: usize,
}

// The base pointer refers to memory the pool exclusively manages; access is
// serialized by the owning scheduler context.
unsafe impl Send for PagePool {}

impl PagePool {
    /// Build a pool over `pages` slabs starting at `base`.
    ///
    /// `base` must be page-aligned and the region must stay valid and unused
    /// by anything else for the pool's lifetime.
    pub fn new(base: NonNull<u8>, pages: usize) -> Self {
        assert!(pages > 0 && pages <= MAX_POOL_PAGES, "pool size out of range");
        assert_eq!(base.as_ptr() as usize % PAGE_SIZE, 0, "pool base not page-aligned");

        log::info!("thread page pool: {} pages at {:p}", pages, base.as_ptr());

        Self {
            base,
            pages,
            bitmap: [0; BITMAP_WORDS],
            used: 0,
        }
    }

    /// Build a pool over a static arena.
    pub fn from_arena<const N: usize>(arena: &'static mut PageArena<N>) -> Self {
        let base = NonNull::from(arena).cast::<u8>();
        Self::new(base, N)
    }

    /// Allocate one page. Returns None on exhaustion unless `ASSERT` is set.
    pub fn alloc(&mut self, flags: PoolFlags) -> Option<NonNull<u8>> {
        for word_idx in 0..BITMAP_WORDS {
            let word = self.bitmap[word_idx];
            if word == u64::MAX {
                continue;
            }
            for bit_idx in 0..64 {
                let page_num = word_idx * 64 + bit_idx;
                if page_num >= self.pages {
                    break;
                }
                let mask = 1u64 << bit_idx;
                if word & mask == 0 {
                    self.bitmap[word_idx] = word | mask;
                    self.used += 1;

                    let page = unsafe { self.base.add(page_num * PAGE_SIZE) };
                    if flags.contains(PoolFlags::ZERO) {
                        unsafe { core::ptr::write_bytes(page.as_ptr(), 0, PAGE_SIZE) };
                    }
                    return Some(page);
                }
            }
        }

        assert!(
            !flags.contains(PoolFlags::ASSERT),
            "thread page pool exhausted"
        );
        None
    }

    /// Return a page to the pool.
    ///
    /// The page must have come from this pool and be currently allocated;
    /// anything else is a fatal bookkeeping fault.
    pub fn free(&mut self, page: NonNull<u8>) {
        let addr = page.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        assert_eq!(addr % PAGE_SIZE, 0, "freeing unaligned page");
        assert!(
            addr >= base && addr < base + self.pages * PAGE_SIZE,
            "freeing page outside pool"
        );

        let page_num = (addr - base) / PAGE_SIZE;
        let word_idx = page_num / 64;
        let mask = 1u64 << (page_num % 64);
        assert!(self.bitmap[word_idx] & mask != 0, "double free of pool page");

        self.bitmap[word_idx] &= !mask;
        self.used -= 1;
    }

    /// Number of pages currently allocated.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Total pages the pool manages.
    pub fn capacity(&self) -> usize {
        self.pages
    }

    /// Pages still available.
    pub fn free_pages(&self) -> usize {
        self.pages - self.used
    }
}
