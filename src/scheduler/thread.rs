/*
 * Thread Control Block
 *
 * One thread occupies one 4 KiB page: the control block sits at the page
 * base and the thread's kernel stack grows down from the page end toward it.
 * The integrity marker is the last field, so a stack that overflows its
 * region corrupts the marker before anything else. Every access through a
 * ThreadRef checks it.
 *
 *      4 KiB +---------------------------------+
 *            |          kernel stack           |
 *            |               |                 |
 *            |               v                 |
 *            +---------------------------------+
 *            |             magic               |
 *            |        control block ...        |
 *          0 +---------------------------------+
 */

use core::fmt;
use core::ptr::NonNull;
use heapless::String;
use static_assertions::const_assert;

use crate::arch::x86_64::context::SavedContext;
use crate::arch::x86_64::interrupts;
use crate::memory::PAGE_SIZE;

/// Written at creation, checked on every access; a mismatch means the
/// thread's stack has grown into its own control block.
const THREAD_MAGIC: u32 = 0xcd6a_bf4b;

/// Bound on thread names. Diagnostics only.
pub const NAME_MAX: usize = 16;

/// Kernel time unit: one periodic timer interrupt.
pub type Tick = i64;

/// Entry function of a kernel thread.
pub type ThreadFn = fn(usize);

/// Thread identifier: unique, strictly increasing, never zero, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid {}", self.0)
    }
}

/// Scheduling priority. Advisory under round robin: stored and readable but
/// never consulted by the selection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(pub i32);

impl Priority {
    pub const MIN: Priority = Priority(0);
    pub const DEFAULT: Priority = Priority(31);
    pub const MAX: Priority = Priority(63);

    /// An out-of-range priority is a caller bug, not an error value.
    pub fn assert_valid(self) {
        assert!(
            self >= Self::MIN && self <= Self::MAX,
            "priority {} outside {}..={}",
            self.0,
            Self::MIN.0,
            Self::MAX.0
        );
    }
}

/// Lifecycle state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Currently executing. Exactly one thread at any instant.
    Running,
    /// In the ready queue, waiting for the processor.
    Ready,
    /// Waiting to be unblocked: a sleep deadline or an external wakeup.
    Blocked,
    /// Exited; page reclamation pending in the destruction queue.
    Dying,
}

/// Why thread creation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// The page pool has no free page for the control block and stack.
    OutOfPages,
    /// The live-thread bound was reached; queues are sized to it.
    TooManyThreads,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::OutOfPages => write!(f, "thread page pool exhausted"),
            SpawnError::TooManyThreads => write!(f, "live thread limit reached"),
        }
    }
}

/// The control block. Lives at the base of its thread's page; never moved,
/// never owned by value outside that page.
#[repr(C)]
pub struct Thread {
    pub(crate) id: ThreadId,
    pub(crate) status: ThreadStatus,
    pub(crate) name: String<NAME_MAX>,
    pub(crate) priority: Priority,
    /// Niceness seam for the unimplemented alternate policy: stored and
    /// settable, never consulted.
    pub(crate) nice: i32,
    /// Wakeup deadline while parked in the sleep queue; stale otherwise.
    pub(crate) wake_tick: Tick,
    pub(crate) context: SavedContext,
    /// Must stay last: highest address in the struct, first byte a stack
    /// overflow reaches.
    magic: u32,
}

// The stack needs nearly the whole page; the control block must stay small.
const_assert!(core::mem::size_of::<Thread>() <= PAGE_SIZE / 4);

impl Thread {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name.as_str())
            .field("status", &self.status)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Checked handle to a control block.
///
/// Copyable and comparable by page identity. All access to the block goes
/// through here so the integrity marker is verified on every touch,
/// including the raw context pointer handed to the switch stubs.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ThreadRef(NonNull<Thread>);

// Handles cross the interrupt boundary of a single core; every dereference
// happens inside the interrupt-off critical section.
unsafe impl Send for ThreadRef {}

impl ThreadRef {
    /// Write a fresh control block at the base of `page` and hand back its
    /// handle. The page must be zeroed, page-aligned and exclusively ours.
    pub(crate) unsafe fn init_at(
        page: NonNull<u8>,
        id: ThreadId,
        name: &str,
        priority: Priority,
    ) -> ThreadRef {
        priority.assert_valid();
        let block = page.cast::<Thread>();
        unsafe {
            block.write(Thread {
                id,
                status: ThreadStatus::Blocked,
                name: bounded_name(name),
                priority,
                nice: 0,
                wake_tick: 0,
                context: SavedContext::default(),
                magic: THREAD_MAGIC,
            });
        }
        ThreadRef(block)
    }

    fn check(&self) {
        let magic = unsafe { (*self.0.as_ptr()).magic };
        assert_eq!(magic, THREAD_MAGIC, "thread integrity marker corrupted");
    }

    pub(crate) fn thread(&self) -> &Thread {
        self.check();
        unsafe { self.0.as_ref() }
    }

    pub(crate) fn thread_mut(&mut self) -> &mut Thread {
        self.check();
        unsafe { self.0.as_mut() }
    }

    /// Raw pointer to the saved context for the switch stubs. No reference
    /// is materialized; the pointer stays usable while the scheduler is
    /// switching away from this very block.
    pub(crate) fn context_ptr(&self) -> *mut SavedContext {
        self.check();
        unsafe { &raw mut (*self.0.as_ptr()).context }
    }

    /// The page this control block lives in.
    pub(crate) fn page(&self) -> NonNull<u8> {
        self.0.cast::<u8>()
    }

    /// First address above the thread's stack: the end of its page.
    pub(crate) fn stack_top(&self) -> usize {
        self.0.as_ptr() as usize + PAGE_SIZE
    }

    pub fn id(&self) -> ThreadId {
        self.thread().id
    }

    pub fn status(&self) -> ThreadStatus {
        self.thread().status
    }
}

impl fmt::Debug for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadRef({})", self.thread().id)
    }
}

fn bounded_name(name: &str) -> String<NAME_MAX> {
    let mut out = String::new();
    for ch in name.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

/// First code every spawned thread executes, entered by the context switch
/// "returning" into it.
///
/// The scheduler switched here with interrupts off; turn them back on, run
/// the entry function, and exit if it ever returns.
pub(crate) extern "C" fn thread_entry_trampoline(entry_raw: usize, arg: usize) -> ! {
    interrupts::enable();
    let entry: ThreadFn = unsafe { core::mem::transmute(entry_raw) };
    entry(arg);
    crate::scheduler::exit()
}
