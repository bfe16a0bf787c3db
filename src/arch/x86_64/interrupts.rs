/*
 * Interrupt-Flag Control
 *
 * This module provides the interrupt-flag discipline the scheduler is built
 * on: enabling/disabling maskable interrupts, querying the flag, and running
 * closures inside an interrupts-off critical section. On a single core,
 * interrupts-off is the scheduler's one global critical section; every
 * mutation of scheduler state happens under it.
 *
 * It also tracks whether execution is currently inside an external interrupt
 * handler, so blocking primitives can reject being called from one.
 *
 * On test builds the CPU flag is replaced by a thread-local stand-in: the
 * scheduler logic above this module runs unmodified on the host, and each
 * test thread owns an independent flag.
 */

#[cfg(not(test))]
mod flag {
    use core::sync::atomic::{AtomicBool, Ordering};
    use x86_64::instructions::interrupts;

    // Single core: one flag is enough to answer "is this an interrupt frame".
    static IN_INTERRUPT: AtomicBool = AtomicBool::new(false);

    pub fn enable() {
        interrupts::enable();
    }

    pub fn disable() {
        interrupts::disable();
    }

    pub fn are_enabled() -> bool {
        interrupts::are_enabled()
    }

    pub fn set_in_interrupt(value: bool) {
        IN_INTERRUPT.store(value, Ordering::Relaxed);
    }

    pub fn in_interrupt() -> bool {
        IN_INTERRUPT.load(Ordering::Relaxed)
    }
}


/// Enable interrupts globally
///
/// This allows the CPU to respond to hardware interrupts. Should only be
/// called after the embedder has installed its interrupt descriptor table.
pub fn enable() {
    flag::enable();
}

/// Disable interrupts globally
///
/// This prevents the CPU from responding to maskable interrupts. Useful for
/// critical sections where atomicity is required.
pub fn disable() {
    flag::disable();
}

/// Check if interrupts are enabled
///
/// Returns true if interrupts are currently enabled, false otherwise.
pub fn are_enabled() -> bool {
    flag::are_enabled()
}

/// Execute a closure with interrupts disabled
///
/// The previous flag state is restored afterwards, so nested critical
/// sections compose.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let were_enabled = are_enabled();
    if were_enabled {
        disable();
    }
    let ret = f();
    if were_enabled {
        enable();
    }
    ret
}

/// Whether execution is currently inside an external interrupt handler.
///
/// Blocking primitives assert this is false: a handler runs on a borrowed
/// stack and must never be suspended.
pub fn in_interrupt_context() -> bool {
    flag::in_interrupt()
}

/// Mark entry into an external interrupt handler.
pub(crate) fn enter_interrupt_context() {
    debug_assert!(!flag::in_interrupt(), "nested external interrupt");
    flag::set_in_interrupt(true);
}

/// Mark exit from an external interrupt handler.
///
/// Called before any end-of-handler yield, mirroring that the yield happens
/// on behalf of the interrupted thread, not the handler.
pub(crate) fn leave_interrupt_context() {
    flag::set_in_interrupt(false);
}

/// RAII guard that disables interrupts for its lifetime
///
/// Interrupts are disabled when this guard is created and restored to their
/// previous state when it's dropped. This ensures the flag is always restored
/// even on early returns.
///
/// # Example
/// ```ignore
/// let _guard = DisableInterrupts::new();
/// // Critical section - interrupts are disabled
/// // Previous state restored when _guard is dropped
/// ```
pub struct DisableInterrupts {
    were_enabled: bool,
}

impl DisableInterrupts {
    /// Create a new interrupt guard, disabling interrupts
    pub fn new() -> Self {
        let were_enabled = are_enabled();
        if were_enabled {
            disable();
        }
        Self { were_enabled }
    }
}

impl Default for DisableInterrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DisableInterrupts {
    fn drop(&mut self) {
        // Only re-enable if they were enabled before
        if self.were_enabled {
            enable();
        }
    }
}
