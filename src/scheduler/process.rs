/*
 * Process Integration Hooks
 *
 * The scheduler itself knows nothing about address spaces or user mode.
 * An embedder that runs user processes supplies these hooks; the scheduler
 * calls them at the few points where process state matters. The default
 * implementations describe a kernel-only system.
 */

use super::thread::Thread;

/// Callbacks into the process layer, if one exists.
///
/// All hooks run inside the scheduler's interrupt-off critical section and
/// must neither block nor call back into the scheduler.
pub trait ProcessHooks: Sync {
    /// The processor is switching to `next`: install its address space and
    /// any per-thread processor state.
    fn activate(&self, next: &Thread) {
        let _ = next;
    }

    /// `dying` is exiting and is still the current thread: release process
    /// resources tied to it while its address space is still installed.
    fn teardown(&self, dying: &Thread) {
        let _ = dying;
    }

    /// Whether `interrupted` was executing user code when the current
    /// interrupt arrived. Consulted for tick accounting when the interrupt
    /// frame alone cannot tell.
    fn in_user_mode(&self, interrupted: &Thread) -> bool {
        let _ = interrupted;
        false
    }
}

/// Hook set for a system with no process layer: nothing to install, nothing
/// to tear down, nobody in user mode.
pub struct NoProcesses;

impl ProcessHooks for NoProcesses {}

/// Shared instance for the common kernel-only configuration.
pub static NO_PROCESSES: NoProcesses = NoProcesses;
