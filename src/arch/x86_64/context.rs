/*
 * Thread Context Layout and Switch Stubs
 *
 * The saved machine context of a thread: the fifteen general-purpose
 * registers followed by an iretq frame (rip, cs, rflags, rsp, ss). A context
 * switch stores the outgoing thread's registers into its control block, then
 * points the stack at the incoming thread's stored context, pops the register
 * file and executes iretq, the same return mechanism a hardware interrupt
 * uses. A freshly created thread's context is seeded so that this "return"
 * lands at its entry trampoline with interrupts enabled.
 *
 * These two stubs are the single unsafe boundary of the subsystem. Everything
 * above them works on context values and pointers; on hosted test builds the
 * jump is replaced by a recorder so the scheduling logic runs under the std
 * test harness without ever executing privileged instructions.
 *
 * The stubs address fields by byte offset, so the layout is #[repr(C)] and
 * locked by compile-time assertions.
 */

use core::arch::naked_asm;
use core::mem::offset_of;
use static_assertions::const_assert_eq;

use super::gdt;

/// RFLAGS image for a brand-new thread: reserved bit 1, interrupt flag set.
/// The first switch into the thread therefore lands with interrupts on.
const INITIAL_RFLAGS: u64 = 0x202;

/// The frame iretq consumes, in pop order.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct IretFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Full saved machine context of a suspended thread.
///
/// Field order is the pop order of `restore_context`: general registers from
/// r15 up to rax, then the iretq frame. The timer interrupt entry builds the
/// same shape on the stack with pushes in the reverse order.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedContext {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub frame: IretFrame,
}

// The switch stubs hardcode these offsets.
const_assert_eq!(offset_of!(SavedContext, rbp), 0x40);
const_assert_eq!(offset_of!(SavedContext, rax), 0x70);
const_assert_eq!(offset_of!(SavedContext, frame), 0x78);
const_assert_eq!(offset_of!(IretFrame, rsp), 0x18);
const_assert_eq!(core::mem::size_of::<SavedContext>(), 0xA0);

impl SavedContext {
    /// Seed a context so the first switch into it enters `entry` with
    /// `arg0`/`arg1` in the first two argument registers, running on the
    /// stack that tops out at `stack_top`, in the kernel segments.
    ///
    /// `stack_top` must be 16-byte aligned; the word subtracted below leaves
    /// the stack pointer where a near call would have, which is what the
    /// SysV ABI promises a function entry.
    pub fn seed(&mut self, entry: usize, arg0: usize, arg1: usize, stack_top: usize) {
        debug_assert_eq!(stack_top % 16, 0);
        *self = Self::default();
        self.rdi = arg0 as u64;
        self.rsi = arg1 as u64;
        self.frame.rip = entry as u64;
        self.frame.cs = gdt::kernel_code_selector().0 as u64;
        self.frame.ss = gdt::kernel_data_selector().0 as u64;
        self.frame.rflags = INITIAL_RFLAGS;
        self.frame.rsp = (stack_top - core::mem::size_of::<u64>()) as u64;
    }
}

/// Save the full register file into `prev`, then restore `next`.
///
/// Returns only when some later switch restores `prev`; the caller observes
/// that as this function returning normally. Interrupts must be disabled for
/// the entire duration and both pointers must refer to live context storage.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_contexts(prev: *mut SavedContext, next: *const SavedContext) {
    naked_asm!(
        // Outgoing register file, stored before anything is clobbered.
        // rdi/rsi hold the arguments; their slots get those values, which is
        // fine: both are caller-saved and dead across the call.
        "mov [rdi + 0x00], r15",
        "mov [rdi + 0x08], r14",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r11",
        "mov [rdi + 0x28], r10",
        "mov [rdi + 0x30], r9",
        "mov [rdi + 0x38], r8",
        "mov [rdi + 0x40], rbp",
        "mov [rdi + 0x48], rdi",
        "mov [rdi + 0x50], rsi",
        "mov [rdi + 0x58], rdx",
        "mov [rdi + 0x60], rcx",
        "mov [rdi + 0x68], rbx",
        "mov [rdi + 0x70], rax",
        // Continuation point: when this context is restored, execution
        // resumes at 2: below with the stack pointer saved here, and the
        // ret pops the original return address.
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x78], rax",
        "mov rax, cs",
        "mov [rdi + 0x80], rax",
        "pushfq",
        "pop qword ptr [rdi + 0x88]",
        "mov [rdi + 0x90], rsp",
        "mov rax, ss",
        "mov [rdi + 0x98], rax",
        // Hand the incoming context to the restore stub. Control never falls
        // through; the label below is reached only by a future restore.
        "mov rdi, rsi",
        "jmp {restore}",
        "2:",
        "ret",
        restore = sym restore_context,
    )
}

/// Restore a stored context and transfer control into it via iretq.
///
/// The context memory doubles as the stack during the restore, so nothing may
/// touch it concurrently; interrupts must be disabled.
#[unsafe(naked)]
pub unsafe extern "C" fn restore_context(ctx: *const SavedContext) -> ! {
    naked_asm!(
        "mov rsp, rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
    )
}

/// Perform the context switch, or record it on hosted test builds.
///
/// This is the one callsite through which the scheduler reaches the stubs.
/// Test builds swap the current-thread pointer upstream exactly as the real
/// path does, then land here and merely log the jump.
pub unsafe fn switch(prev: *mut SavedContext, next: *const SavedContext) {
    #[cfg(not(test))]
    unsafe {
        switch_contexts(prev, next)
    }
    #[cfg(test)]
    test_jump::record(prev, next);
}
