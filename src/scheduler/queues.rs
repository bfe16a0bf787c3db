/*
 * Scheduling Queues
 *
 * Fixed-capacity queues over thread handles. Capacities match the
 * live-thread bound, so a full queue is always a bookkeeping fault and
 * never an error the caller could handle.
 */

use heapless::{Deque, Vec};

use super::MAX_THREADS;
use super::thread::{Tick, ThreadRef};

/// Runnable threads in arrival order. Pure FIFO; priorities are not
/// consulted.
pub(crate) struct ReadyQueue {
    queue: Deque<ThreadRef, MAX_THREADS>,
}

impl ReadyQueue {
    pub const fn new() -> Self {
        ReadyQueue { queue: Deque::new() }
    }

    pub fn push(&mut self, thread: ThreadRef) {
        if self.queue.push_back(thread).is_err() {
            panic!("ready queue overflow");
        }
    }

    pub fn pop(&mut self) -> Option<ThreadRef> {
        self.queue.pop_front()
    }

    #[cfg(test)]
    pub fn contains(&self, thread: ThreadRef) -> bool {
        self.iter().any(|&t| t == thread)
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &ThreadRef> {
        self.queue.iter()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Sleeping threads, ordered by wake tick with the latest deadline first.
/// The soonest deadline sits at the back, so the per-tick check pops from
/// the end in constant time.
///
/// Threads sharing a deadline wake in the order they went to sleep: an
/// insert lands before the equal-deadline entries already present, which
/// leaves the earlier sleeper nearer the back.
pub(crate) struct SleepQueue {
    queue: Vec<ThreadRef, MAX_THREADS>,
}

impl SleepQueue {
    pub const fn new() -> Self {
        SleepQueue { queue: Vec::new() }
    }

    /// Insert a sleeper. Its deadline is read from the control block, so
    /// `wake_tick` must already be set.
    pub fn insert(&mut self, thread: ThreadRef) {
        let wake = thread.thread().wake_tick;
        let at = self.queue.partition_point(|t| t.thread().wake_tick > wake);
        if self.queue.insert(at, thread).is_err() {
            panic!("sleep queue overflow");
        }
    }

    /// Soonest pending deadline, if any thread is asleep.
    pub fn next_wake(&self) -> Option<Tick> {
        self.queue.last().map(|t| t.thread().wake_tick)
    }

    /// Remove one thread whose deadline has arrived. Callers loop until
    /// `None` to release every due sleeper.
    pub fn pop_due(&mut self, now: Tick) -> Option<ThreadRef> {
        match self.queue.last() {
            Some(t) if t.thread().wake_tick <= now => self.queue.pop(),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &ThreadRef> {
        self.queue.iter()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
