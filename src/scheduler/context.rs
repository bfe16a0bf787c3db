/*
 * Scheduler State Machine
 *
 * SchedContext owns every piece of scheduling state: the page pool backing
 * thread pages, the ready/sleep/destruction queues, the identifier
 * allocator and the tick counters. All methods require interrupts to be
 * disabled; the embedding layer wraps them in its critical section.
 *
 * State changes and the actual jump to another thread are split. A
 * scheduling decision mutates the bookkeeping here and hands back the pair
 * of context pointers to switch between; the caller performs the jump after
 * releasing whatever lock guards this structure. Nothing in this module
 * ever holds a lock across a context switch.
 */

use core::ptr::NonNull;
use heapless::Deque;

use crate::arch::x86_64::context::SavedContext;
use crate::arch::x86_64::interrupts;
use crate::memory::{PagePool, PoolFlags};

use super::MAX_THREADS;
use super::policy::SchedPolicy;
use super::process::ProcessHooks;
use super::queues::{ReadyQueue, SleepQueue};
use super::thread::{
    Priority, SpawnError, ThreadFn, ThreadId, ThreadRef, ThreadStatus, Tick,
    thread_entry_trampoline,
};
use super::tid::TidAllocator;

/// Ticks a thread may run before the timer marks it for preemption.
pub const TIME_SLICE: u32 = 4;

/// Outgoing and incoming saved-context pointers of a decided switch. The
/// caller jumps through these once the scheduler lock is released.
pub(crate) type SwitchPair = (*mut SavedContext, *const SavedContext);

/// Processor time accounted per tick, split by what the tick interrupted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    /// Ticks spent in the idle thread.
    pub idle: u64,
    /// Ticks spent in kernel threads.
    pub kernel: u64,
    /// Ticks spent in user code, per the interrupt frame or the process
    /// hooks.
    pub user: u64,
}

pub(crate) struct SchedContext {
    pool: PagePool,
    ready: ReadyQueue,
    sleepers: SleepQueue,
    destruction: Deque<ThreadRef, MAX_THREADS>,
    tids: TidAllocator,
    policy: SchedPolicy,
    hooks: &'static dyn ProcessHooks,
    /// The thread the processor is executing right now.
    running: ThreadRef,
    /// Runs only when the ready queue is empty; never enqueued anywhere.
    idle: ThreadRef,
    /// The thread adopted at initialization. Its page is not pool-owned,
    /// so it is never queued for destruction.
    bootstrap: ThreadRef,
    /// Pool-backed threads that have not exited yet, idle included.
    /// Bounded by MAX_THREADS so the queues can never overflow.
    live: usize,
    /// Ticks the running thread has spent in its current slice.
    slice_ticks: u32,
    stats: TickStats,
}

impl SchedContext {
    /// Stand up scheduling on the boot processor.
    ///
    /// The caller's own execution becomes the bootstrap thread: a control
    /// block is written at the base of `bootstrap_page`, which must be the
    /// page the caller's stack lives in. The idle thread is carved out of
    /// the pool and parked blocked; it enters `idle_entry` the first time
    /// the ready queue runs dry.
    pub(crate) unsafe fn new(
        pool: PagePool,
        policy: SchedPolicy,
        hooks: &'static dyn ProcessHooks,
        bootstrap_page: NonNull<u8>,
        bootstrap_name: &str,
        idle_entry: ThreadFn,
    ) -> SchedContext {
        let mut pool = pool;
        let tids = TidAllocator::new();

        let mut bootstrap = unsafe {
            ThreadRef::init_at(
                bootstrap_page,
                tids.allocate(),
                bootstrap_name,
                Priority::DEFAULT,
            )
        };
        bootstrap.thread_mut().status = ThreadStatus::Running;

        let idle_page = match pool.alloc(PoolFlags::ZERO) {
            Some(page) => page,
            None => panic!("page pool too small for the idle thread"),
        };
        let mut idle =
            unsafe { ThreadRef::init_at(idle_page, tids.allocate(), "idle", Priority::MIN) };
        let idle_top = idle.stack_top();
        idle.thread_mut().context.seed(
            thread_entry_trampoline as usize,
            idle_entry as usize,
            0,
            idle_top,
        );

        log::debug!(
            "scheduler state ready: bootstrap {}, idle {}",
            bootstrap.id(),
            idle.id()
        );

        SchedContext {
            pool,
            ready: ReadyQueue::new(),
            sleepers: SleepQueue::new(),
            destruction: Deque::new(),
            tids,
            policy,
            hooks,
            running: bootstrap,
            idle,
            bootstrap,
            live: 1,
            slice_ticks: 0,
            stats: TickStats::default(),
        }
    }

    fn assert_quiesced(&self) {
        assert!(
            !interrupts::are_enabled(),
            "scheduler state touched with interrupts enabled"
        );
    }

    /// Create a thread and make it ready. On failure no page or identifier
    /// is consumed and the queues are untouched.
    pub fn spawn(
        &mut self,
        name: &str,
        priority: Priority,
        entry: ThreadFn,
        arg: usize,
    ) -> Result<ThreadId, SpawnError> {
        self.assert_quiesced();
        priority.assert_valid();

        if self.live >= MAX_THREADS {
            return Err(SpawnError::TooManyThreads);
        }
        let page = self.pool.alloc(PoolFlags::ZERO).ok_or(SpawnError::OutOfPages)?;

        let id = self.tids.allocate();
        let mut thread = unsafe { ThreadRef::init_at(page, id, name, priority) };
        let top = thread.stack_top();
        thread.thread_mut().context.seed(
            thread_entry_trampoline as usize,
            entry as usize,
            arg,
            top,
        );
        self.live += 1;
        self.enqueue_ready(thread);

        log::debug!("spawned {} \"{}\"", id, thread.thread().name());
        Ok(id)
    }

    /// Move a blocked thread to the back of the ready queue. Does not
    /// preempt the running thread.
    pub fn unblock(&mut self, thread: ThreadRef) {
        self.assert_quiesced();
        self.enqueue_ready(thread);
    }

    fn enqueue_ready(&mut self, mut thread: ThreadRef) {
        assert!(thread != self.idle, "idle thread is never queued");
        let block = thread.thread_mut();
        assert_eq!(
            block.status,
            ThreadStatus::Blocked,
            "unblock of a thread that is not blocked"
        );
        block.status = ThreadStatus::Ready;
        self.ready.push(thread);
    }

    /// Give up the processor but stay runnable. The running thread moves to
    /// the back of the ready queue; if it was alone, it simply keeps
    /// running with a fresh slice and no switch happens.
    pub fn yield_current(&mut self) -> Option<SwitchPair> {
        self.assert_quiesced();
        assert!(
            !interrupts::in_interrupt_context(),
            "yield from within an interrupt handler"
        );

        if self.running != self.idle {
            let current = self.running;
            self.ready.push(current);
        }
        self.do_schedule(ThreadStatus::Ready)
    }

    /// Stop running until somebody calls `unblock`. Returns `None` only
    /// when the idle thread blocks with nothing ready, in which case it
    /// just keeps running.
    pub fn block_current(&mut self) -> Option<SwitchPair> {
        self.assert_quiesced();
        assert!(
            !interrupts::in_interrupt_context(),
            "block from within an interrupt handler"
        );
        self.do_schedule(ThreadStatus::Blocked)
    }

    /// Park the running thread until the clock reaches `deadline`. A
    /// deadline already in the past still parks it; the next timer tick
    /// releases it immediately.
    pub fn sleep_current_until(&mut self, deadline: Tick) -> SwitchPair {
        self.assert_quiesced();
        assert!(
            !interrupts::in_interrupt_context(),
            "sleep from within an interrupt handler"
        );
        assert!(self.running != self.idle, "idle thread must not sleep");

        let mut current = self.running;
        current.thread_mut().wake_tick = deadline;
        self.sleepers.insert(current);
        let Some(pair) = self.do_schedule(ThreadStatus::Blocked) else {
            panic!("sleeping thread was re-selected to run");
        };
        pair
    }

    /// Terminate the running thread. The process teardown hook runs first,
    /// while the dying thread is still current. Its page then joins the
    /// destruction queue and is reclaimed at the start of a later
    /// scheduling decision, never while its stack is still in use. The
    /// returned switch never comes back.
    pub fn exit_current(&mut self) -> SwitchPair {
        self.assert_quiesced();
        assert!(
            !interrupts::in_interrupt_context(),
            "exit from within an interrupt handler"
        );
        assert!(self.running != self.idle, "idle thread must not exit");

        log::debug!("{} exiting", self.running.id());
        self.hooks.teardown(self.running.thread());
        if self.running != self.bootstrap {
            self.live -= 1;
        }
        let Some(pair) = self.do_schedule(ThreadStatus::Dying) else {
            panic!("dying thread was re-selected to run");
        };
        pair
    }

    /// Timer tick bookkeeping, called from the timer interrupt with `now`
    /// already advanced. Accounts the tick, releases due sleepers and
    /// reports whether the running thread's slice is used up, in which case
    /// the caller yields once the handler returns.
    pub fn tick(&mut self, now: Tick, user_frame: bool) -> bool {
        self.assert_quiesced();

        if self.running == self.idle {
            self.stats.idle += 1;
        } else if user_frame || self.hooks.in_user_mode(self.running.thread()) {
            self.stats.user += 1;
        } else {
            self.stats.kernel += 1;
        }

        while let Some(woken) = self.sleepers.pop_due(now) {
            self.enqueue_ready(woken);
        }

        self.slice_ticks += 1;
        self.slice_ticks >= TIME_SLICE
    }

    /// One full scheduling decision: reclaim exited threads, demote the
    /// running thread to `prev_status`, pick the next thread and account
    /// the switch. `None` means the running thread was picked again.
    fn do_schedule(&mut self, prev_status: ThreadStatus) -> Option<SwitchPair> {
        assert_eq!(
            self.running.status(),
            ThreadStatus::Running,
            "scheduling decision outside the running thread"
        );

        self.drain_destruction();
        self.running.thread_mut().status = prev_status;
        self.schedule_next()
    }

    fn schedule_next(&mut self) -> Option<SwitchPair> {
        let prev = self.running;
        assert!(prev.status() != ThreadStatus::Running);

        let mut next = match self.ready.pop() {
            Some(thread) => thread,
            None => self.idle,
        };
        assert!(
            next.status() == ThreadStatus::Ready || next == self.idle,
            "picked a thread that is not runnable"
        );
        next.thread_mut().status = ThreadStatus::Running;
        self.slice_ticks = 0;

        if prev == next {
            return None;
        }

        self.running = next;
        if prev.status() == ThreadStatus::Dying && prev != self.bootstrap {
            if self.destruction.push_back(prev).is_err() {
                panic!("destruction queue overflow");
            }
        }
        self.hooks.activate(next.thread());
        Some((prev.context_ptr(), next.context_ptr() as *const SavedContext))
    }

    /// Free the pages of threads that exited before this decision. The
    /// running thread is never in this queue, so no stack is freed while
    /// in use.
    fn drain_destruction(&mut self) {
        while let Some(victim) = self.destruction.pop_front() {
            assert!(victim != self.running, "reclaiming the running thread");
            assert_eq!(victim.status(), ThreadStatus::Dying);
            log::trace!("reclaiming {}", victim.id());
            self.pool.free(victim.page());
        }
    }

    pub fn current(&self) -> ThreadRef {
        self.running
    }

    pub fn policy(&self) -> SchedPolicy {
        self.policy
    }

    pub fn stats(&self) -> TickStats {
        self.stats
    }

    pub fn current_priority(&self) -> Priority {
        self.running.thread().priority
    }

    pub fn set_current_priority(&mut self, priority: Priority) {
        self.assert_quiesced();
        priority.assert_valid();
        self.running.thread_mut().priority = priority;
    }

    pub fn current_nice(&self) -> i32 {
        self.running.thread().nice
    }

    pub fn set_current_nice(&mut self, nice: i32) {
        self.assert_quiesced();
        self.running.thread_mut().nice = nice;
    }

    /// Recent processor use of the running thread. The accounting behind
    /// the alternate policy is not implemented; reads as zero.
    pub fn recent_cpu(&self) -> i32 {
        0
    }

    /// System load average. Same placeholder as `recent_cpu`.
    pub fn load_avg(&self) -> i32 {
        0
    }

    #[cfg(test)]
    pub(crate) fn ready_len(&self) -> usize {
        self.ready.len()
    }

    #[cfg(test)]
    pub(crate) fn sleeping_len(&self) -> usize {
        self.sleepers.len()
    }

    #[cfg(test)]
    pub(crate) fn ready_ids(&self) -> std::vec::Vec<u64> {
        self.ready.iter().map(|t| t.id().0).collect()
    }

    #[cfg(test)]
    pub(crate) fn ready_refs(&self) -> std::vec::Vec<ThreadRef> {
        self.ready.iter().copied().collect()
    }

    #[cfg(test)]
    pub(crate) fn pool_used(&self) -> usize {
        self.pool.used()
    }

    #[cfg(test)]
    pub(crate) fn pending_destruction(&self) -> usize {
        self.destruction.len()
    }

    /// Structural invariants, checked by tests after every step.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        assert_eq!(self.running.status(), ThreadStatus::Running);
        assert!(!self.ready.contains(self.running));
        assert!(!self.ready.contains(self.idle));
        for t in self.ready.iter() {
            assert_eq!(t.status(), ThreadStatus::Ready);
        }
        for t in self.sleepers.iter() {
            assert_eq!(t.status(), ThreadStatus::Blocked);
        }
        for t in self.destruction.iter() {
            assert_eq!(t.status(), ThreadStatus::Dying);
            assert!(*t != self.bootstrap);
        }
        // Every pool page is owned by a live thread or a queued corpse.
        assert_eq!(self.pool.used(), self.live + self.destruction.len());
    }
}

impl core::fmt::Debug for SchedContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SchedContext")
            .field("running", &self.running.id())
            .field("ready", &self.ready.len())
            .field("sleeping", &self.sleepers.len())
            .field("next_wake", &self.sleepers.next_wake())
            .field("live", &self.live)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PageArena;
    use crate::scheduler::process::NO_PROCESSES;
    use crate::scheduler::thread::Thread;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use proptest::prelude::*;

    fn idle_entry(_: usize) {}

    fn work_entry(_: usize) {}

    fn harness_with<const PAGES: usize>(hooks: &'static dyn ProcessHooks) -> SchedContext {
        interrupts::disable();
        let pool = PagePool::from_arena(Box::leak(Box::new(PageArena::<PAGES>::new())));
        let boot = Box::leak(Box::new(PageArena::<1>::new()));
        let boot_page = NonNull::new(boot.as_mut_ptr()).unwrap();
        unsafe {
            SchedContext::new(
                pool,
                SchedPolicy::RoundRobin,
                hooks,
                boot_page,
                "main",
                idle_entry,
            )
        }
    }

    fn harness() -> SchedContext {
        harness_with::<8>(&NO_PROCESSES)
    }

    /// Apply a decided switch the way the embedding layer would, minus the
    /// actual jump: the bookkeeping already moved `running`, so tests only
    /// need the pair for pointer assertions.
    fn switched(pair: Option<SwitchPair>) -> SwitchPair {
        pair.unwrap()
    }

    #[test]
    fn fresh_context_runs_the_bootstrap_thread() {
        let ctx = harness();
        assert_eq!(ctx.current().id(), ThreadId(1));
        assert_eq!(ctx.current().status(), ThreadStatus::Running);
        assert_eq!(ctx.idle.id(), ThreadId(2));
        assert_eq!(ctx.idle.status(), ThreadStatus::Blocked);
        assert_eq!(ctx.ready_len(), 0);
        assert_eq!(ctx.pool_used(), 1);
        ctx.check_invariants();
    }

    #[test]
    fn spawned_threads_queue_in_order_with_fresh_identifiers() {
        let mut ctx = harness();
        let a = ctx.spawn("a", Priority::DEFAULT, work_entry, 7).unwrap();
        let b = ctx.spawn("b", Priority::DEFAULT, work_entry, 8).unwrap();
        let c = ctx.spawn("c", Priority::DEFAULT, work_entry, 9).unwrap();
        assert_eq!((a, b, c), (ThreadId(3), ThreadId(4), ThreadId(5)));
        assert_eq!(ctx.ready_ids(), vec![3, 4, 5]);
        for t in ctx.ready_refs() {
            assert_eq!(t.status(), ThreadStatus::Ready);
        }
        ctx.check_invariants();
    }

    #[test]
    fn spawn_seeds_the_startup_context() {
        let mut ctx = harness();
        ctx.spawn("seeded", Priority::DEFAULT, work_entry, 42).unwrap();
        let t = ctx.ready_refs()[0];
        let block = t.thread();
        assert_eq!(block.context.frame.rip, thread_entry_trampoline as u64);
        assert_eq!(block.context.rdi, work_entry as u64);
        assert_eq!(block.context.rsi, 42);
        assert_eq!(block.context.frame.rsp, t.stack_top() as u64 - 8);
    }

    #[test]
    fn idle_context_is_seeded_from_its_own_page() {
        let ctx = harness();
        let block = ctx.idle.thread();
        assert_eq!(block.context.frame.rip, thread_entry_trampoline as u64);
        assert_eq!(block.context.rdi, idle_entry as u64);
        assert_eq!(block.context.rsi, 0);
        assert_eq!(block.context.frame.rsp, ctx.idle.stack_top() as u64 - 8);
    }

    #[test]
    fn yield_rotates_threads_in_spawn_order() {
        let mut ctx = harness();
        ctx.spawn("a", Priority::DEFAULT, work_entry, 0).unwrap();
        ctx.spawn("b", Priority::DEFAULT, work_entry, 0).unwrap();

        let (prev, next) = switched(ctx.yield_current());
        assert_eq!(ctx.current().id(), ThreadId(3));
        assert_eq!(ctx.ready_ids(), vec![4, 1]);
        assert_eq!(next, ctx.current().context_ptr() as *const _);
        assert!(!prev.is_null());
        ctx.check_invariants();

        switched(ctx.yield_current());
        assert_eq!(ctx.current().id(), ThreadId(4));
        assert_eq!(ctx.ready_ids(), vec![1, 3]);
        ctx.check_invariants();

        switched(ctx.yield_current());
        assert_eq!(ctx.current().id(), ThreadId(1));
        assert_eq!(ctx.ready_ids(), vec![3, 4]);
        ctx.check_invariants();
    }

    #[test]
    fn solo_yield_keeps_running_without_a_switch() {
        let mut ctx = harness();
        assert!(ctx.yield_current().is_none());
        assert_eq!(ctx.current().id(), ThreadId(1));
        assert_eq!(ctx.ready_len(), 0);
        ctx.check_invariants();
    }

    #[test]
    fn block_parks_and_unblock_requeues_at_the_tail() {
        let mut ctx = harness();
        ctx.spawn("a", Priority::DEFAULT, work_entry, 0).unwrap();
        switched(ctx.yield_current());
        let a = ctx.current();
        assert_eq!(a.id(), ThreadId(3));

        switched(ctx.block_current());
        assert_eq!(a.status(), ThreadStatus::Blocked);
        assert_eq!(ctx.current().id(), ThreadId(1));
        ctx.check_invariants();

        ctx.spawn("late", Priority::DEFAULT, work_entry, 0).unwrap();
        ctx.unblock(a);
        assert_eq!(a.status(), ThreadStatus::Ready);
        assert_eq!(ctx.ready_ids(), vec![4, 3]);
        assert_eq!(ctx.current().id(), ThreadId(1));
        ctx.check_invariants();
    }

    #[test]
    fn idle_runs_only_when_nothing_is_ready() {
        let mut ctx = harness();
        let boot = ctx.current();
        switched(ctx.block_current());
        assert_eq!(ctx.current(), ctx.idle);
        ctx.check_invariants();

        // Somebody wakes the bootstrap thread; idle parks itself again the
        // way its loop does.
        ctx.unblock(boot);
        assert_eq!(ctx.ready_ids(), vec![1]);
        switched(ctx.block_current());
        assert_eq!(ctx.current().id(), ThreadId(1));
        assert_eq!(ctx.idle.status(), ThreadStatus::Blocked);
        ctx.check_invariants();
    }

    #[test]
    fn idle_block_with_empty_queue_keeps_idling() {
        let mut ctx = harness();
        switched(ctx.block_current());
        assert_eq!(ctx.current(), ctx.idle);

        assert!(ctx.block_current().is_none());
        assert_eq!(ctx.current(), ctx.idle);
        assert_eq!(ctx.current().status(), ThreadStatus::Running);
        ctx.check_invariants();
    }

    #[test]
    fn sleepers_wake_exactly_at_their_deadline() {
        let mut ctx = harness();
        ctx.spawn("napper", Priority::DEFAULT, work_entry, 0).unwrap();
        switched(ctx.yield_current());
        let napper = ctx.current();

        ctx.sleep_current_until(60);
        assert_eq!(napper.status(), ThreadStatus::Blocked);
        assert_eq!(ctx.sleeping_len(), 1);
        assert_eq!(ctx.current().id(), ThreadId(1));

        assert!(!ctx.tick(59, false));
        assert_eq!(napper.status(), ThreadStatus::Blocked);
        assert_eq!(ctx.sleeping_len(), 1);

        ctx.tick(60, false);
        assert_eq!(napper.status(), ThreadStatus::Ready);
        assert_eq!(ctx.sleeping_len(), 0);
        assert_eq!(ctx.ready_ids().last(), Some(&3));
        ctx.check_invariants();
    }

    #[test]
    fn equal_deadline_sleepers_wake_in_sleep_order() {
        let mut ctx = harness();
        ctx.spawn("x", Priority::DEFAULT, work_entry, 0).unwrap();
        ctx.spawn("y", Priority::DEFAULT, work_entry, 0).unwrap();

        switched(ctx.yield_current());
        assert_eq!(ctx.current().id(), ThreadId(3));
        ctx.sleep_current_until(50);

        // Parking the first sleeper already handed the processor on.
        assert_eq!(ctx.current().id(), ThreadId(4));
        ctx.sleep_current_until(50);
        assert_eq!(ctx.current().id(), ThreadId(1));

        ctx.tick(50, false);
        let ids = ctx.ready_ids();
        let tail = &ids[ids.len() - 2..];
        assert_eq!(tail, &[3, 4]);
        ctx.check_invariants();
    }

    #[test]
    fn ticks_accumulate_per_mode() {
        let mut ctx = harness();
        ctx.tick(1, false);
        ctx.tick(2, true);
        assert_eq!(ctx.stats(), TickStats { idle: 0, kernel: 1, user: 1 });

        switched(ctx.block_current());
        assert_eq!(ctx.current(), ctx.idle);
        ctx.tick(3, false);
        assert_eq!(ctx.stats(), TickStats { idle: 1, kernel: 1, user: 1 });
    }

    #[test]
    fn slice_expires_after_time_slice_ticks() {
        let mut ctx = harness();
        for now in 1..TIME_SLICE as i64 {
            assert!(!ctx.tick(now, false));
        }
        assert!(ctx.tick(TIME_SLICE as i64, false));
    }

    #[test]
    fn any_decision_starts_a_fresh_slice() {
        let mut ctx = harness();
        assert!(!ctx.tick(1, false));
        assert!(!ctx.tick(2, false));
        assert!(!ctx.tick(3, false));
        // Re-selected without a switch, slice starts over.
        assert!(ctx.yield_current().is_none());
        assert!(!ctx.tick(4, false));
        assert!(!ctx.tick(5, false));
        assert!(!ctx.tick(6, false));
        assert!(ctx.tick(7, false));
    }

    #[test]
    fn pool_exhaustion_fails_spawn_without_side_effects() {
        let mut ctx = harness();
        for i in 0..7 {
            ctx.spawn("filler", Priority::DEFAULT, work_entry, i).unwrap();
        }
        let ready_before = ctx.ready_ids();
        assert_eq!(ctx.pool_used(), 8);

        let err = ctx.spawn("straw", Priority::DEFAULT, work_entry, 0);
        assert_eq!(err, Err(SpawnError::OutOfPages));
        assert_eq!(ctx.ready_ids(), ready_before);
        ctx.check_invariants();
    }

    #[test]
    fn live_thread_bound_rejects_spawn() {
        let mut ctx = harness_with::<{ MAX_THREADS }>(&NO_PROCESSES);
        for i in 0..MAX_THREADS - 1 {
            ctx.spawn("crowd", Priority::DEFAULT, work_entry, i).unwrap();
        }
        let err = ctx.spawn("straw", Priority::DEFAULT, work_entry, 0);
        assert_eq!(err, Err(SpawnError::TooManyThreads));
        ctx.check_invariants();
    }

    #[test]
    fn exit_defers_reclamation_to_the_next_decision() {
        let mut ctx = harness();
        ctx.spawn("doomed", Priority::DEFAULT, work_entry, 0).unwrap();
        switched(ctx.yield_current());
        assert_eq!(ctx.current().id(), ThreadId(3));
        assert_eq!(ctx.pool_used(), 2);

        let (prev, _) = ctx.exit_current();
        assert!(!prev.is_null());
        assert_eq!(ctx.current().id(), ThreadId(1));
        assert_eq!(ctx.pending_destruction(), 1);
        // The page outlives the exit; the corpse still owns it.
        assert_eq!(ctx.pool_used(), 2);
        ctx.check_invariants();

        // The next decision reclaims it.
        assert!(ctx.yield_current().is_none());
        assert_eq!(ctx.pending_destruction(), 0);
        assert_eq!(ctx.pool_used(), 1);
        ctx.check_invariants();
    }

    #[test]
    fn reclaimed_pages_can_back_new_threads() {
        let mut ctx = harness();
        for i in 0..7 {
            ctx.spawn("filler", Priority::DEFAULT, work_entry, i).unwrap();
        }
        assert!(ctx.spawn("straw", Priority::DEFAULT, work_entry, 0).is_err());

        switched(ctx.yield_current());
        ctx.exit_current();
        // Still full: the corpse keeps its page until the next decision.
        assert!(ctx.spawn("early", Priority::DEFAULT, work_entry, 0).is_err());

        switched(ctx.yield_current());
        let id = ctx.spawn("reborn", Priority::DEFAULT, work_entry, 0).unwrap();
        // Identifiers keep counting; pages are reused, identities are not.
        assert_eq!(id, ThreadId(10));
        ctx.check_invariants();
    }

    #[test]
    fn bootstrap_thread_is_never_reclaimed() {
        let mut ctx = harness();
        ctx.spawn("heir", Priority::DEFAULT, work_entry, 0).unwrap();
        let used_before = ctx.pool_used();

        let (_, _) = ctx.exit_current();
        assert_eq!(ctx.current().id(), ThreadId(3));
        assert_eq!(ctx.pending_destruction(), 0);
        assert_eq!(ctx.pool_used(), used_before);
        ctx.check_invariants();

        assert!(ctx.yield_current().is_none());
        assert_eq!(ctx.pool_used(), used_before);
    }

    #[test]
    fn hooks_fire_on_switch_and_exit() {
        #[derive(Default)]
        struct Counting {
            activated: AtomicUsize,
            torn_down: AtomicUsize,
        }
        impl ProcessHooks for Counting {
            fn activate(&self, _: &Thread) {
                self.activated.fetch_add(1, Ordering::Relaxed);
            }
            fn teardown(&self, _: &Thread) {
                self.torn_down.fetch_add(1, Ordering::Relaxed);
            }
        }

        let hooks: &'static Counting = Box::leak(Box::new(Counting::default()));
        let mut ctx = harness_with::<8>(hooks);
        ctx.spawn("h", Priority::DEFAULT, work_entry, 0).unwrap();

        switched(ctx.yield_current());
        assert_eq!(hooks.activated.load(Ordering::Relaxed), 1);
        assert_eq!(hooks.torn_down.load(Ordering::Relaxed), 0);

        // Teardown runs at exit, on the dying thread; the page is still
        // held until the next decision reclaims it.
        let used_before = ctx.pool_used();
        ctx.exit_current();
        assert_eq!(hooks.activated.load(Ordering::Relaxed), 2);
        assert_eq!(hooks.torn_down.load(Ordering::Relaxed), 1);
        assert_eq!(ctx.pool_used(), used_before);

        assert!(ctx.yield_current().is_none());
        assert_eq!(hooks.torn_down.load(Ordering::Relaxed), 1);
        assert_eq!(ctx.pool_used(), used_before - 1);
    }

    #[test]
    fn priority_and_nice_are_stored_per_thread() {
        let mut ctx = harness();
        assert_eq!(ctx.current_priority(), Priority::DEFAULT);
        ctx.set_current_priority(Priority(5));
        assert_eq!(ctx.current_priority(), Priority(5));

        ctx.set_current_nice(-3);
        assert_eq!(ctx.current_nice(), -3);
        assert_eq!(ctx.recent_cpu(), 0);
        assert_eq!(ctx.load_avg(), 0);
    }

    #[test]
    #[should_panic(expected = "not blocked")]
    fn unblocking_a_running_thread_is_fatal() {
        let mut ctx = harness();
        let current = ctx.current();
        ctx.unblock(current);
    }

    #[test]
    #[should_panic(expected = "never queued")]
    fn unblocking_the_idle_thread_is_fatal() {
        let mut ctx = harness();
        let idle = ctx.idle;
        ctx.unblock(idle);
    }

    #[test]
    #[should_panic(expected = "idle thread must not sleep")]
    fn sleeping_from_idle_is_fatal() {
        let mut ctx = harness();
        switched(ctx.block_current());
        assert_eq!(ctx.current(), ctx.idle);
        ctx.sleep_current_until(10);
    }

    #[test]
    #[should_panic(expected = "interrupts enabled")]
    fn touching_state_with_interrupts_enabled_is_fatal() {
        let mut ctx = harness();
        interrupts::enable();
        ctx.yield_current();
    }

    proptest! {
        /// Random mixes of scheduling operations never break the
        /// structural invariants.
        #[test]
        fn random_operation_sequences_hold_invariants(ops in prop::collection::vec(0u8..5, 1..60)) {
            let mut ctx = harness();
            let mut now: Tick = 0;
            let mut parked: std::vec::Vec<ThreadRef> = vec![];

            for op in ops {
                match op {
                    0 => { let _ = ctx.spawn("p", Priority::DEFAULT, work_entry, 0); }
                    1 => { ctx.yield_current(); }
                    2 => {
                        if ctx.current() != ctx.idle && ctx.current().id().0 != 1 {
                            ctx.sleep_current_until(now + 3);
                        } else {
                            let who = ctx.current();
                            if who != ctx.idle {
                                parked.push(who);
                            }
                            ctx.block_current();
                        }
                    }
                    3 => {
                        now += 1;
                        if ctx.tick(now, false) {
                            ctx.yield_current();
                        }
                    }
                    _ => {
                        if let Some(t) = parked.pop() {
                            ctx.unblock(t);
                        } else if ctx.current() != ctx.idle && ctx.current().id().0 != 1 {
                            ctx.exit_current();
                        }
                    }
                }
                ctx.check_invariants();
            }
        }
    }
}
