/*
 * x86_64 Architecture Support Module
 *
 * Architecture-specific pieces of the threading core:
 *
 * - gdt: the minimal kernel segment table whose selectors are seeded into
 *   every new thread context
 * - interrupts: interrupt-flag control and the in-handler marker
 * - context: the saved-context layout and the save/restore switch stubs
 *
 * plus the two platform helpers below that the bootstrap and idle paths use.
 */

pub mod context;
pub mod gdt;
pub mod interrupts;

/// One-time platform bringup for the threading core.
///
/// Loads the kernel segment table. Must run before the first thread control
/// block is created (their contexts embed the selectors) and before
/// interrupts are enabled.
#[cfg(not(test))]
pub fn init() {
    gdt::init();
}

/// Base address of the page the current stack pointer lives in.
///
/// The bootstrap thread's control block is written there: the boot stack
/// occupies a page-aligned region, so rounding rsp down finds its base, the
/// same way the running control block is located for any thread.
#[cfg(not(test))]
pub fn current_stack_base() -> usize {
    let rsp: usize;
    unsafe {
        core::arch::asm!("mov {}, rsp", out(reg) rsp, options(nomem, nostack, preserves_flags));
    }
    rsp & !(crate::memory::PAGE_SIZE - 1)
}

/// Atomically enable interrupts and halt until the next one arrives.
///
/// Only the idle thread calls this; sti and hlt execute back to back, so no
/// tick can slip in between and leave the processor halted past a wakeup.
pub fn wait_for_interrupt() {
    #[cfg(not(test))]
    x86_64::instructions::interrupts::enable_and_hlt();
    #[cfg(test)]
    self::interrupts::enable();
}
