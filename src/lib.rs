/*
 * Tern Kernel Threading
 *
 * Preemptive kernel threading for a single x86-64 processor: thread control
 * blocks co-located with their stacks, a round-robin scheduler driven by
 * the 8254 timer, tick-based sleeping, and the context-switch plumbing
 * underneath it all.
 *
 * The crate is freestanding. An embedder brings a boot path, an interrupt
 * descriptor table and a panic handler, then:
 *   - routes logging with `utils::logger::init`
 *   - calls `arch::x86_64::init` to load the kernel segment table
 *   - hands `scheduler::init` a page pool for thread pages
 *   - installs `devices::timer::timer_interrupt_entry` at
 *     `devices::timer::TIMER_VECTOR` and calls `devices::timer::init`
 *   - calls `scheduler::start` to let preemption begin
 *
 * Everything above the switch stubs is ordinary safe code, so the whole
 * scheduler also builds and runs under `cargo test` on a host.
 */

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod devices;
pub mod memory;
pub mod scheduler;
pub mod utils;
