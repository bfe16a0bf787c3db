/*
 * Preemptive Round-Robin Scheduler
 *
 * Threads share the single processor under a round-robin discipline: the
 * ready queue is plain FIFO, a timer interrupt marks the running thread for
 * preemption after its time slice, and threads may also yield, block, sleep
 * or exit on their own.
 *
 * THREAD LIFECYCLE:
 * ================
 *
 *            spawn
 *              |
 *              v
 *   +------> Ready <------ unblock / deadline
 *   |          |                      |
 * yield /      v                      |
 * preempt   Running ----- block / sleep ----> Blocked
 *              |
 *              v
 *            Dying -> page reclaimed at a later decision
 *
 * LOCKING AND SWITCHING:
 * =====================
 *
 * All scheduler state sits behind one spinlock, taken only with interrupts
 * disabled; the timer interrupt can therefore never spin on a core that
 * holds it. A scheduling decision runs under the lock and returns the pair
 * of context pointers to switch between; the actual jump happens after the
 * lock is released, so no thread ever parks while holding it. A resumed
 * thread comes back inside its own critical section and unwinds it
 * normally.
 *
 * THE IDLE THREAD:
 * ===============
 *
 * Created at initialization and handed the processor whenever the ready
 * queue is empty. It never appears in any queue: it blocks itself, halts
 * until an interrupt arrives and gets picked directly by the scheduler.
 * Its ticks are accounted separately so a busy system can be told from a
 * quiet one.
 */

mod context;
mod policy;
mod process;
mod queues;
mod thread;
mod tid;

pub use context::{TIME_SLICE, TickStats};
pub use policy::SchedPolicy;
pub use process::{NO_PROCESSES, NoProcesses, ProcessHooks};
pub use thread::{
    NAME_MAX, Priority, SpawnError, ThreadFn, ThreadId, ThreadRef, ThreadStatus, Tick,
};

use core::ptr::NonNull;
use heapless::String;
use spin::Mutex;

use crate::arch::x86_64::context::switch;
use crate::arch::x86_64::interrupts;
use crate::memory::PagePool;

use context::{SchedContext, SwitchPair};

/// Upper bound on simultaneously live threads. Queue capacities and the
/// page pool are sized to it.
pub const MAX_THREADS: usize = crate::memory::page_pool::MAX_POOL_PAGES;

static SCHEDULER: Mutex<Option<SchedContext>> = Mutex::new(None);

fn with_scheduler<R>(f: impl FnOnce(&mut SchedContext) -> R) -> R {
    interrupts::without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        let Some(ctx) = guard.as_mut() else {
            panic!("scheduler not initialized");
        };
        f(ctx)
    })
}

/// Run one scheduling decision under the lock, then perform the decided
/// jump with the lock released and interrupts still off.
fn decide_and_jump(decide: impl FnOnce(&mut SchedContext) -> Option<SwitchPair>) {
    interrupts::without_interrupts(|| {
        let pair = {
            let mut guard = SCHEDULER.lock();
            let Some(ctx) = guard.as_mut() else {
                panic!("scheduler not initialized");
            };
            decide(ctx)
        };
        if let Some((prev, next)) = pair {
            unsafe { switch(prev, next) };
        }
    });
}

/// Bring up the scheduler on the boot processor.
///
/// The calling execution becomes the first thread, named "main"; the idle
/// thread is created alongside it. Interrupts stay as they were, so nothing
/// preempts until [`start`].
pub fn init(pool: PagePool, policy: SchedPolicy, hooks: &'static dyn ProcessHooks) {
    let bootstrap_page = bootstrap_page();
    interrupts::without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        assert!(guard.is_none(), "scheduler already initialized");
        *guard = Some(unsafe {
            SchedContext::new(pool, policy, hooks, bootstrap_page, "main", idle_main)
        });
    });
    log::info!("scheduler initialized, policy {:?}", policy);
}

/// The page the boot stack lives in; its base becomes the bootstrap
/// thread's control block.
#[cfg(not(test))]
fn bootstrap_page() -> NonNull<u8> {
    let base = crate::arch::x86_64::current_stack_base();
    let Some(page) = NonNull::new(base as *mut u8) else {
        panic!("boot stack page is null");
    };
    page
}

#[cfg(test)]
fn bootstrap_page() -> NonNull<u8> {
    let arena = Box::leak(Box::new(crate::memory::PageArena::<1>::new()));
    NonNull::new(arena.as_mut_ptr()).unwrap()
}

/// Let the timer start preempting. Call once the interrupt path is wired.
pub fn start() {
    with_scheduler(|ctx| {
        log::info!("preemptive scheduling enabled, policy {:?}", ctx.policy());
    });
    interrupts::enable();
}

/// Create a thread running `entry(arg)` and queue it. It competes for the
/// processor from now on; the caller keeps running.
pub fn spawn(
    name: &str,
    priority: Priority,
    entry: ThreadFn,
    arg: usize,
) -> Result<ThreadId, SpawnError> {
    with_scheduler(|ctx| ctx.spawn(name, priority, entry, arg))
}

/// Hand the processor to the next ready thread, staying runnable. Returns
/// when the caller is scheduled again, which is immediately if it is alone.
pub fn yield_now() {
    decide_and_jump(|ctx| ctx.yield_current());
}

/// Stop running until another thread calls [`unblock`] on this thread's
/// handle. Callers disable interrupts before checking the condition they
/// block on, or the wakeup can slip between check and block; arriving here
/// with them still enabled is fatal.
pub fn block() {
    assert!(!interrupts::are_enabled(), "block with interrupts enabled");
    decide_and_jump(|ctx| ctx.block_current());
}

/// Make a blocked thread ready again. Never preempts; the woken thread
/// joins the back of the ready queue.
pub fn unblock(thread: ThreadRef) {
    with_scheduler(|ctx| ctx.unblock(thread));
}

/// Park the calling thread until the tick counter reaches `deadline`.
pub fn sleep_until(deadline: Tick) {
    interrupts::without_interrupts(|| {
        let pair = {
            let mut guard = SCHEDULER.lock();
            let Some(ctx) = guard.as_mut() else {
                panic!("scheduler not initialized");
            };
            ctx.sleep_current_until(deadline)
        };
        let (prev, next) = pair;
        unsafe { switch(prev, next) };
    });
}

/// Terminate the calling thread. Its page is reclaimed later, after the
/// processor has moved on.
pub fn exit() -> ! {
    interrupts::disable();
    let (prev, next) = {
        let mut guard = SCHEDULER.lock();
        let Some(ctx) = guard.as_mut() else {
            panic!("scheduler not initialized");
        };
        ctx.exit_current()
    };
    unsafe { switch(prev, next) };
    unreachable!("resumed an exited thread");
}

/// Timer-interrupt bookkeeping: account the tick, wake due sleepers and
/// report whether the handler should yield on its way out.
pub fn tick(now: Tick, user_frame: bool) -> bool {
    with_scheduler(|ctx| ctx.tick(now, user_frame))
}

pub fn current_thread_id() -> ThreadId {
    with_scheduler(|ctx| ctx.current().id())
}

pub fn current_thread_name() -> String<NAME_MAX> {
    with_scheduler(|ctx| ctx.current().thread().name.clone())
}

/// Handle of the calling thread, for parking in wait lists and passing to
/// [`unblock`].
pub fn current_thread() -> ThreadRef {
    with_scheduler(|ctx| ctx.current())
}

pub fn current_priority() -> Priority {
    with_scheduler(|ctx| ctx.current_priority())
}

pub fn set_priority(priority: Priority) {
    with_scheduler(|ctx| ctx.set_current_priority(priority));
}

pub fn current_nice() -> i32 {
    with_scheduler(|ctx| ctx.current_nice())
}

pub fn set_nice(nice: i32) {
    with_scheduler(|ctx| ctx.set_current_nice(nice));
}

/// Recent processor use of the calling thread, in the alternate policy's
/// fixed-point scale. Reads as zero until that accounting exists.
pub fn recent_cpu() -> i32 {
    with_scheduler(|ctx| ctx.recent_cpu())
}

/// System load average in the same scale as [`recent_cpu`].
pub fn load_avg() -> i32 {
    with_scheduler(|ctx| ctx.load_avg())
}

pub fn stats() -> TickStats {
    with_scheduler(|ctx| ctx.stats())
}

pub fn policy() -> SchedPolicy {
    with_scheduler(|ctx| ctx.policy())
}

/// Body of the idle thread. Parks itself and halts until an interrupt
/// arrives; the scheduler hands it the processor only when the ready queue
/// is empty.
fn idle_main(_: usize) {
    loop {
        interrupts::disable();
        block();
        crate::arch::x86_64::wait_for_interrupt();
    }
}
