/*
 * Architecture Abstraction Layer
 *
 * Everything that touches privileged CPU state lives below this module:
 * segment tables, the interrupt flag, saved-context layout and the switch
 * stubs. The scheduler and timer layers above are architecture-neutral logic
 * driven through this interface, which is what lets them run under the host
 * test harness.
 */

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
