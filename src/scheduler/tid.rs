/*
 * Thread Identifier Allocation
 */

use spin::Mutex;

use super::thread::ThreadId;

/// Hands out thread identifiers starting at 1 and counting up forever.
/// Identifiers are never reused and zero is never issued, so a ThreadId can
/// double as a "definitely a thread" token. The lock serializes allocation
/// against spawns racing from interrupt handlers.
pub(crate) struct TidAllocator {
    next: Mutex<u64>,
}

impl TidAllocator {
    pub const fn new() -> Self {
        TidAllocator { next: Mutex::new(1) }
    }

    pub fn allocate(&self) -> ThreadId {
        let mut next = self.next.lock();
        let id = ThreadId(*next);
        *next += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn identifiers_start_at_one_and_increase() {
        let tids = TidAllocator::new();
        let a = tids.allocate();
        let b = tids.allocate();
        let c = tids.allocate();
        assert_eq!(a, ThreadId(1));
        assert_eq!(b, ThreadId(2));
        assert_eq!(c, ThreadId(3));
    }

    #[test]
    fn zero_is_never_issued() {
        let tids = TidAllocator::new();
        for _ in 0..100 {
            assert_ne!(tids.allocate().0, 0);
        }
    }

    proptest! {
        /// Any allocation count yields strictly increasing identifiers with
        /// no repeats.
        #[test]
        fn identifiers_strictly_increase(n in 1usize..200) {
            let tids = TidAllocator::new();
            let mut last = 0;
            for _ in 0..n {
                let id = tids.allocate().0;
                prop_assert!(id > last);
                last = id;
            }
        }
    }
}
